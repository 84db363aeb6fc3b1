use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Final verdict for an invoice-payment request.
///
/// The decision is a pure function of the aggregated fraud score; see
/// [`Decision::from_score`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Allow,
    Review,
    Block,
}

impl Decision {
    /// Score tiers: 0..=30 allow, 31..=70 review, 71..=100 block.
    /// Boundaries are closed on the lower side.
    pub fn from_score(score: u8) -> Self {
        if score <= 30 {
            Self::Allow
        } else if score <= 70 {
            Self::Review
        } else {
            Self::Block
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "ALLOW",
            Self::Review => "REVIEW",
            Self::Block => "BLOCK",
        }
    }
}

/// Token kind claim; refresh tokens are long-lived, access tokens short-lived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "ACCESS",
            Self::Refresh => "REFRESH",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACCESS" => Some(Self::Access),
            "REFRESH" => Some(Self::Refresh),
            _ => None,
        }
    }
}

/// Scoring request for a single invoice payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudCheckRequest {
    pub iban: String,
    pub amount: Decimal,
    pub vendor_id: i64,
    pub invoice_number: String,
}

impl FraudCheckRequest {
    /// Validate loosely-bound request fields, returning a per-field error map
    /// on the first pass so callers can answer with all violations at once.
    pub fn from_parts(
        iban: Option<String>,
        amount: Option<Decimal>,
        vendor_id: Option<i64>,
        invoice_number: Option<String>,
    ) -> Result<Self, BTreeMap<String, String>> {
        let mut errors = BTreeMap::new();

        let iban = match iban.filter(|value| !value.trim().is_empty()) {
            Some(value) => Some(value),
            None => {
                errors.insert("iban".to_string(), "iban is required".to_string());
                None
            }
        };
        let amount = match amount {
            Some(value) if value > Decimal::ZERO => Some(value),
            Some(_) => {
                errors.insert("amount".to_string(), "amount must be positive".to_string());
                None
            }
            None => {
                errors.insert("amount".to_string(), "amount is required".to_string());
                None
            }
        };
        let vendor_id = match vendor_id {
            Some(value) if value > 0 => Some(value),
            Some(_) => {
                errors.insert(
                    "vendorId".to_string(),
                    "vendorId must be positive".to_string(),
                );
                None
            }
            None => {
                errors.insert("vendorId".to_string(), "vendorId is required".to_string());
                None
            }
        };
        let invoice_number = match invoice_number.filter(|value| !value.trim().is_empty()) {
            Some(value) => Some(value),
            None => {
                errors.insert(
                    "invoiceNumber".to_string(),
                    "invoiceNumber is required".to_string(),
                );
                None
            }
        };

        match (iban, amount, vendor_id, invoice_number) {
            (Some(iban), Some(amount), Some(vendor_id), Some(invoice_number))
                if errors.is_empty() =>
            {
                Ok(Self {
                    iban,
                    amount,
                    vendor_id,
                    invoice_number,
                })
            }
            _ => Err(errors),
        }
    }
}

/// Scoring response returned to callers and persisted with the transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudCheckResponse {
    pub decision: Decision,
    pub fraud_score: u8,
    pub risk_factors: Vec<String>,
}

/// Account record owned by the edge service.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub display_name: String,
    pub active: bool,
    pub locked: bool,
    pub failed_attempts: i32,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// Durable token record; a token string appears at most once.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub token: String,
    pub user_id: i64,
    pub kind: TokenKind,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Transaction record to persist after scoring; immutable once written.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub transaction_ref: String,
    pub iban: String,
    pub amount: Decimal,
    pub vendor_id: Option<i64>,
    pub invoice_number: String,
    pub fraud_score: u8,
    pub decision: Decision,
    pub risk_factors: Vec<String>,
}

/// Vendor risk bucket; read-only input to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskBucket {
    Low,
    Medium,
    High,
}

impl RiskBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Vendor {
    pub id: i64,
    pub name: String,
    pub iban: String,
    pub risk_bucket: RiskBucket,
    pub active: bool,
    pub total_count: i64,
    pub flagged_count: i64,
}

/// Immutable audit entry; the audit log is append-only.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub user_id: Option<i64>,
    pub action: String,
    pub resource_kind: String,
    pub resource_id: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub detail: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

/// Request-scoped client metadata carried into audit entries.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

impl AuditRecord {
    /// Auth event for a known user.
    pub fn auth(user_id: i64, action: &str, ctx: &ClientContext, detail: serde_json::Value) -> Self {
        Self {
            user_id: Some(user_id),
            action: action.to_string(),
            resource_kind: "USER".to_string(),
            resource_id: Some(user_id.to_string()),
            client_ip: ctx.client_ip.clone(),
            user_agent: ctx.user_agent.clone(),
            detail,
            occurred_at: Utc::now(),
        }
    }

    /// Auth event when the user could not be resolved, e.g. a failed login
    /// against a nonexistent account.
    pub fn anonymous_auth(action: &str, ctx: &ClientContext, detail: serde_json::Value) -> Self {
        Self {
            user_id: None,
            action: action.to_string(),
            resource_kind: "USER".to_string(),
            resource_id: None,
            client_ip: ctx.client_ip.clone(),
            user_agent: ctx.user_agent.clone(),
            detail,
            occurred_at: Utc::now(),
        }
    }

    /// Invoice-validation event emitted after a scoring round trip.
    pub fn invoice(
        user_id: Option<i64>,
        invoice_number: &str,
        ctx: &ClientContext,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            user_id,
            action: "INVOICE_VALIDATED".to_string(),
            resource_kind: "INVOICE".to_string(),
            resource_id: Some(invoice_number.to_string()),
            client_ip: ctx.client_ip.clone(),
            user_agent: ctx.user_agent.clone(),
            detail,
            occurred_at: Utc::now(),
        }
    }
}
