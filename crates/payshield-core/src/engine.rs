//! Parallel five-rule fraud evaluator.
//!
//! Rules fan out concurrently and join under a hard wall-clock deadline; a
//! rule that errors or misses the deadline contributes no points, so the
//! engine always returns a decision.

use crate::error::ShieldError;
use crate::iban::{self, CachedIbanValidator};
use crate::kv::KvStore;
use crate::store::{IbanRegistry, TransactionStore};
use crate::types::{Decision, FraudCheckRequest, FraudCheckResponse, NewTransaction};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const DUPLICATE_POINTS: u8 = 50;
const INVALID_IBAN_POINTS: u8 = 50;
const RISKY_IBAN_POINTS: u8 = 40;
const AMOUNT_POINTS: u8 = 30;
const VELOCITY_POINTS: u8 = 15;

const MAX_SCORE: u32 = 100;

const DUPLICATE_FACTOR: &str = "Duplicate invoice detected within 24 hours";
const RISKY_IBAN_FACTOR: &str = "IBAN flagged as risky";
const AMOUNT_FACTOR: &str = "Amount suspiciously close to common threshold";
const VELOCITY_FACTOR: &str = "Unusual transaction velocity detected";

/// Round amounts fraudsters aim just below when splitting invoices.
pub const AMOUNT_THRESHOLDS: [i64; 7] = [999, 1999, 4999, 9999, 14999, 19999, 49999];

/// The manipulation window around a threshold T is `[T - 50, T + 1)`:
/// closed at the bottom, open at the top, so 4999.99 scores and 5000 does not.
pub const THRESHOLD_MARGIN_BELOW: i64 = 50;
pub const THRESHOLD_MARGIN_ABOVE: i64 = 1;

/// Abstraction over "something that can score an invoice"; implemented by the
/// engine itself and by the edge service's HTTP client to the scoring service.
#[async_trait]
pub trait FraudChecker: Send + Sync {
    async fn check(&self, request: &FraudCheckRequest) -> Result<FraudCheckResponse, ShieldError>;
}

#[derive(Debug, Clone)]
pub struct FraudEngineConfig {
    /// Hard wall-clock deadline for the rule fan-out join.
    pub rule_deadline: Duration,
    pub duplicate_ttl: Duration,
    pub risky_cache_ttl: Duration,
    pub velocity_window: Duration,
    pub iban_velocity_threshold: u64,
    pub vendor_velocity_threshold: u64,
}

impl Default for FraudEngineConfig {
    fn default() -> Self {
        Self {
            rule_deadline: Duration::from_millis(150),
            duplicate_ttl: Duration::from_secs(24 * 60 * 60),
            risky_cache_ttl: Duration::from_secs(4 * 60 * 60),
            velocity_window: Duration::from_secs(15 * 60),
            iban_velocity_threshold: 5,
            vendor_velocity_threshold: 10,
        }
    }
}

struct RuleHit {
    points: u8,
    factor: String,
}

impl RuleHit {
    fn new(points: u8, factor: impl Into<String>) -> Option<Self> {
        Some(Self {
            points,
            factor: factor.into(),
        })
    }
}

pub struct FraudEngine {
    kv: Arc<dyn KvStore>,
    transactions: Arc<dyn TransactionStore>,
    registry: Arc<dyn IbanRegistry>,
    iban: CachedIbanValidator,
    config: FraudEngineConfig,
}

impl FraudEngine {
    pub fn new(
        kv: Arc<dyn KvStore>,
        transactions: Arc<dyn TransactionStore>,
        registry: Arc<dyn IbanRegistry>,
        config: FraudEngineConfig,
    ) -> Self {
        Self {
            iban: CachedIbanValidator::new(kv.clone()),
            kv,
            transactions,
            registry,
            config,
        }
    }

    /// Score one request. Velocity markers and the transaction record are
    /// written after the join so a cancelled rule never mutates shared state.
    pub async fn check(&self, request: &FraudCheckRequest) -> FraudCheckResponse {
        // One IBAN identity throughout: cache keys, velocity windows, and the
        // persisted row all derive from the normalized form, so formatting
        // variants of the same account cannot split state.
        let request = FraudCheckRequest {
            iban: iban::normalize(&request.iban),
            amount: request.amount,
            vendor_id: request.vendor_id,
            invoice_number: request.invoice_number.clone(),
        };
        let request = &request;

        let now = Utc::now();
        let deadline = tokio::time::Instant::now() + self.config.rule_deadline;

        let (duplicate, invalid_iban, risky_iban, amount, velocity) = tokio::join!(
            bounded(
                deadline,
                "duplicate_invoice",
                self.duplicate_rule(&request.invoice_number),
            ),
            bounded(deadline, "iban_validity", self.iban_rule(&request.iban)),
            bounded(deadline, "risky_iban", self.risky_iban_rule(&request.iban)),
            bounded(deadline, "amount_manipulation", self.amount_rule(request.amount)),
            bounded(deadline, "velocity", self.velocity_rule(request, now)),
        );

        // Factors compose in canonical rule order, independent of completion
        // order.
        let hits = [duplicate, invalid_iban, risky_iban, amount, velocity];
        let mut total: u32 = 0;
        let mut risk_factors = Vec::new();
        for hit in hits.into_iter().flatten() {
            total += u32::from(hit.points);
            risk_factors.push(hit.factor);
        }
        let fraud_score = total.min(MAX_SCORE) as u8;
        let decision = Decision::from_score(fraud_score);

        self.record_velocity(request, now).await;
        self.persist(request, fraud_score, decision, &risk_factors)
            .await;

        FraudCheckResponse {
            decision,
            fraud_score,
            risk_factors,
        }
    }

    /// Rule 1: the set-if-absent write doubles as the read; only a request
    /// that finds the key already present scores. A KV failure means the
    /// invoice is treated as first-seen, never as a duplicate.
    async fn duplicate_rule(&self, invoice_number: &str) -> Result<Option<RuleHit>, ShieldError> {
        let key = format!("fraud:duplicate:{invoice_number}");
        match self
            .kv
            .set_nx_ex(&key, "1", self.config.duplicate_ttl)
            .await
        {
            Ok(true) => Ok(None),
            Ok(false) => Ok(RuleHit::new(DUPLICATE_POINTS, DUPLICATE_FACTOR)),
            Err(err) => {
                warn!(%err, "duplicate check unavailable, treating invoice as first-seen");
                Ok(None)
            }
        }
    }

    /// Rule 2: syntactic + checksum validation with a cached verdict.
    async fn iban_rule(&self, raw: &str) -> Result<Option<RuleHit>, ShieldError> {
        match self.iban.check(raw).await {
            Ok(_) => Ok(None),
            Err(fault) => Ok(RuleHit::new(
                INVALID_IBAN_POINTS,
                format!("Invalid IBAN: {}", fault.reason()),
            )),
        }
    }

    /// Rule 3: registry lookup behind a 4 h cache; an IBAN missing from the
    /// registry is not risky. The caller hands in the normalized IBAN.
    async fn risky_iban_rule(&self, iban: &str) -> Result<Option<RuleHit>, ShieldError> {
        let cache_key = format!("fraud:risky:iban:{iban}");

        let risky = match self.kv.get(&cache_key).await {
            Ok(Some(cached)) => cached == "true",
            Ok(None) => self.registry_risky(iban, &cache_key).await?,
            Err(err) => {
                debug!(%err, "risky-iban cache read failed, consulting registry");
                self.registry_risky(iban, &cache_key).await?
            }
        };

        if risky {
            Ok(RuleHit::new(RISKY_IBAN_POINTS, RISKY_IBAN_FACTOR))
        } else {
            Ok(None)
        }
    }

    async fn registry_risky(&self, iban: &str, cache_key: &str) -> Result<bool, ShieldError> {
        let risky = self.registry.is_risky(iban).await?.unwrap_or(false);
        let cached = if risky { "true" } else { "false" };
        if let Err(err) = self
            .kv
            .set_ex(cache_key, cached, self.config.risky_cache_ttl)
            .await
        {
            debug!(%err, "risky-iban cache write failed");
        }
        Ok(risky)
    }

    /// Rule 4: pure decimal comparison, no state.
    async fn amount_rule(&self, amount: Decimal) -> Result<Option<RuleHit>, ShieldError> {
        if amount_near_threshold(amount) {
            Ok(RuleHit::new(AMOUNT_POINTS, AMOUNT_FACTOR))
        } else {
            Ok(None)
        }
    }

    /// Rule 5: windowed counts over the velocity ordered sets, with a durable
    /// count as fallback when the KV read fails. The two sources may drift
    /// slightly; availability wins.
    async fn velocity_rule(
        &self,
        request: &FraudCheckRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<RuleHit>, ShieldError> {
        let window_ms = self.config.velocity_window.as_millis() as i64;
        let window_start = now - chrono::Duration::milliseconds(window_ms);
        let window_start_ms = window_start.timestamp_millis();

        let iban_key = format!("fraud:velocity:iban:{}", request.iban);
        let iban_count = match self.kv.zcount(&iban_key, window_start_ms, i64::MAX).await {
            Ok(count) => count,
            Err(err) => {
                warn!(%err, "velocity cache read failed, using durable count");
                self.transactions
                    .count_for_iban_since(&request.iban, window_start)
                    .await?
            }
        };
        if iban_count >= self.config.iban_velocity_threshold {
            return Ok(RuleHit::new(VELOCITY_POINTS, VELOCITY_FACTOR));
        }

        let vendor_key = format!("fraud:velocity:vendor:{}", request.vendor_id);
        let vendor_count = match self.kv.zcount(&vendor_key, window_start_ms, i64::MAX).await {
            Ok(count) => count,
            Err(err) => {
                warn!(%err, "velocity cache read failed, using durable count");
                self.transactions
                    .count_for_vendor_since(request.vendor_id, window_start)
                    .await?
            }
        };
        if vendor_count >= self.config.vendor_velocity_threshold {
            return Ok(RuleHit::new(VELOCITY_POINTS, VELOCITY_FACTOR));
        }

        Ok(None)
    }

    async fn record_velocity(&self, request: &FraudCheckRequest, now: DateTime<Utc>) {
        let timestamp_ms = now.timestamp_millis();
        let keys = [
            format!("fraud:velocity:iban:{}", request.iban),
            format!("fraud:velocity:vendor:{}", request.vendor_id),
        ];
        for key in keys {
            if let Err(err) = self
                .kv
                .zadd(&key, &request.invoice_number, timestamp_ms)
                .await
            {
                warn!(%err, %key, "velocity marker write failed");
                continue;
            }
            if let Err(err) = self.kv.expire(&key, self.config.velocity_window).await {
                warn!(%err, %key, "velocity ttl refresh failed");
            }
        }
    }

    async fn persist(
        &self,
        request: &FraudCheckRequest,
        fraud_score: u8,
        decision: Decision,
        risk_factors: &[String],
    ) {
        let record = NewTransaction {
            transaction_ref: Uuid::new_v4().to_string(),
            iban: request.iban.clone(),
            amount: request.amount,
            vendor_id: Some(request.vendor_id),
            invoice_number: request.invoice_number.clone(),
            fraud_score,
            decision,
            risk_factors: risk_factors.to_vec(),
        };
        if let Err(err) = self.transactions.insert(&record).await {
            warn!(%err, "transaction persistence failed, response unaffected");
        }
    }
}

#[async_trait]
impl FraudChecker for FraudEngine {
    async fn check(&self, request: &FraudCheckRequest) -> Result<FraudCheckResponse, ShieldError> {
        Ok(FraudEngine::check(self, request).await)
    }
}

/// True when the amount falls in `[T - 50, T + 1)` for any known threshold.
/// Decimal compare throughout; binary floating point never enters.
pub fn amount_near_threshold(amount: Decimal) -> bool {
    AMOUNT_THRESHOLDS.iter().any(|threshold| {
        let threshold = Decimal::from(*threshold);
        amount >= threshold - Decimal::from(THRESHOLD_MARGIN_BELOW)
            && amount < threshold + Decimal::from(THRESHOLD_MARGIN_ABOVE)
    })
}

async fn bounded<F>(
    deadline: tokio::time::Instant,
    rule: &'static str,
    fut: F,
) -> Option<RuleHit>
where
    F: Future<Output = Result<Option<RuleHit>, ShieldError>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(Ok(hit)) => hit,
        Ok(Err(err)) => {
            warn!(rule, %err, "rule degraded, contributing no points");
            None
        }
        Err(_) => {
            warn!(rule, "rule missed the scoring deadline");
            None
        }
    }
}
