//! Scoring service HTTP surface: a thin binder over the fraud engine,
//! guarded by a pre-shared key on the internal channel.

#![deny(unsafe_code)]

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use payshield_adapters::API_KEY_HEADER;
use payshield_core::{FraudCheckRequest, FraudCheckResponse, FraudEngine};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct ScoringState {
    pub engine: Arc<FraudEngine>,
    pub api_key: String,
}

pub fn build_router(state: ScoringState) -> Router {
    Router::new()
        .route("/actuator/health", get(health))
        .route("/api/v1/invoices/validate", post(validate))
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    message: String,
    field_errors: Option<BTreeMap<String, String>>,
}

impl ApiError {
    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            error: "Unauthorized",
            message: message.into(),
            field_errors: None,
        }
    }

    fn validation(field_errors: BTreeMap<String, String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "Bad Request",
            message: "request validation failed".to_string(),
            field_errors: Some(field_errors),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "status": self.status.as_u16(),
            "error": self.error,
            "message": self.message,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Some(errors) = self.field_errors {
            body["errors"] = serde_json::json!(errors);
        }
        (self.status, Json(body)).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "UP" })
}

/// Loosely-bound request body so that missing or out-of-range fields produce
/// a per-field error map instead of a bare deserialization failure.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateInvoiceBody {
    iban: Option<String>,
    amount: Option<Decimal>,
    vendor_id: Option<i64>,
    invoice_number: Option<String>,
}

async fn validate(
    State(state): State<ScoringState>,
    headers: HeaderMap,
    Json(body): Json<ValidateInvoiceBody>,
) -> Result<Json<FraudCheckResponse>, ApiError> {
    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    if presented != Some(state.api_key.as_str()) {
        return Err(ApiError::unauthorized("invalid or missing API key"));
    }

    let request = FraudCheckRequest::from_parts(
        body.iban,
        body.amount,
        body.vendor_id,
        body.invoice_number,
    )
    .map_err(ApiError::validation)?;

    Ok(Json(state.engine.check(&request).await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use payshield_core::{
        FraudEngineConfig, MemoryIbanRegistry, MemoryKv, MemoryTransactionStore,
    };
    use tower::ServiceExt;

    const CLEAN_IBAN: &str = "BG80BNBG96611020345678";

    fn state() -> ScoringState {
        let registry = Arc::new(MemoryIbanRegistry::new());
        registry.insert(CLEAN_IBAN, false);
        let engine = FraudEngine::new(
            Arc::new(MemoryKv::new()),
            Arc::new(MemoryTransactionStore::new()),
            registry,
            FraudEngineConfig::default(),
        );
        ScoringState {
            engine: Arc::new(engine),
            api_key: "internal-test-key".to_string(),
        }
    }

    fn validate_request(api_key: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/v1/invoices/validate")
            .header("content-type", "application/json");
        if let Some(key) = api_key {
            builder = builder.header("X-API-KEY", key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn clean_body(invoice: &str) -> serde_json::Value {
        serde_json::json!({
            "iban": CLEAN_IBAN,
            "amount": "1500.00",
            "vendorId": 1,
            "invoiceNumber": invoice,
        })
    }

    #[tokio::test]
    async fn missing_api_key_is_unauthorized() {
        let app = build_router(state());

        let response = app
            .oneshot(validate_request(None, clean_body("INV-001")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_api_key_is_unauthorized() {
        let app = build_router(state());

        let response = app
            .oneshot(validate_request(Some("nope"), clean_body("INV-001")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn invalid_fields_return_a_per_field_error_map() {
        let app = build_router(state());
        let body = serde_json::json!({
            "iban": CLEAN_IBAN,
            "amount": "-5",
            "vendorId": 0,
        });

        let response = app
            .oneshot(validate_request(Some("internal-test-key"), body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let errors = value.get("errors").and_then(|v| v.as_object()).unwrap();
        assert_eq!(
            errors.get("amount").and_then(|v| v.as_str()),
            Some("amount must be positive")
        );
        assert_eq!(
            errors.get("vendorId").and_then(|v| v.as_str()),
            Some("vendorId must be positive")
        );
        assert!(errors.contains_key("invoiceNumber"));
        assert!(value.get("timestamp").is_some());
    }

    #[tokio::test]
    async fn clean_invoice_is_allowed_with_zero_score() {
        let app = build_router(state());

        let response = app
            .oneshot(validate_request(
                Some("internal-test-key"),
                clean_body("INV-001"),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["decision"], "ALLOW");
        assert_eq!(value["fraudScore"], 0);
        assert_eq!(value["riskFactors"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn repeated_invoice_is_flagged_as_duplicate() {
        let app = build_router(state());

        let first = app
            .clone()
            .oneshot(validate_request(
                Some("internal-test-key"),
                clean_body("INV-DUPLICATE"),
            ))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(validate_request(
                Some("internal-test-key"),
                clean_body("INV-DUPLICATE"),
            ))
            .await
            .unwrap();
        let bytes = to_bytes(second.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["decision"], "REVIEW");
        assert_eq!(value["fraudScore"], 50);
        assert_eq!(
            value["riskFactors"][0],
            "Duplicate invoice detected within 24 hours"
        );
    }

    #[tokio::test]
    async fn health_is_unauthenticated() {
        let app = build_router(state());

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/actuator/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["status"], "UP");
    }
}
