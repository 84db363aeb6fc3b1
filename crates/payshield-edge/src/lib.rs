//! Edge service HTTP surface: terminates user credentials, guards the public
//! validate endpoint, forwards validated calls to the scoring service, and
//! emits audit events off the request path.

#![deny(unsafe_code)]

use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use payshield_core::{
    AuditRecord, AuditSink, AuthService, ClientContext, FraudCheckRequest, FraudCheckResponse,
    FraudChecker, LoginOutcome, ShieldError, TokenAuthority, TokenKind,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
pub struct EdgeState {
    pub auth: Arc<AuthService>,
    pub tokens: Arc<TokenAuthority>,
    pub scoring: Arc<dyn FraudChecker>,
    pub audit: AuditSink,
}

pub fn build_router(state: EdgeState) -> Router {
    Router::new()
        .route("/actuator/health", get(health))
        .route("/api/v1/invoices/health", get(health))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/refresh", post(refresh))
        .route("/api/v1/invoices/validate", post(validate_invoice))
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
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "Bad Request",
            message: message.into(),
            field_errors: None,
        }
    }

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

impl From<ShieldError> for ApiError {
    fn from(err: ShieldError) -> Self {
        let (status, error, message) = match &err {
            ShieldError::InvalidInput(message) => {
                (StatusCode::BAD_REQUEST, "Bad Request", message.clone())
            }
            _ if err.is_unauthorized() => {
                (StatusCode::UNAUTHORIZED, "Unauthorized", err.to_string())
            }
            ShieldError::Upstream(_) => (StatusCode::BAD_GATEWAY, "Bad Gateway", err.to_string()),
            ShieldError::AuthUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service Unavailable",
                err.to_string(),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
                "An unexpected error occurred".to_string(),
            ),
        };
        Self {
            status,
            error,
            message,
            field_errors: None,
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

/// Client IP resolution prefers the first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then the peer address.
fn client_context(headers: &HeaderMap, peer: Option<SocketAddr>) -> ClientContext {
    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|hop| hop.trim().to_string())
        .filter(|hop| !hop.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
        .or_else(|| peer.map(|addr| addr.ip().to_string()));
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    ClientContext {
        client_ip,
        user_agent,
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "UP" })
}

#[derive(Debug, Clone, Deserialize)]
struct LoginRequest {
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    token_type: &'static str,
    expires_in: u64,
}

impl From<LoginOutcome> for TokenResponse {
    fn from(outcome: LoginOutcome) -> Self {
        Self {
            access_token: outcome.access_token,
            refresh_token: outcome.refresh_token,
            token_type: "Bearer",
            expires_in: outcome.expires_in_ms,
        }
    }
}

async fn login(
    State(state): State<EdgeState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let mut errors = BTreeMap::new();
    let username = match body.username.filter(|value| !value.trim().is_empty()) {
        Some(value) => Some(value),
        None => {
            errors.insert("username".to_string(), "username is required".to_string());
            None
        }
    };
    let password = match body.password.filter(|value| !value.is_empty()) {
        Some(value) => Some(value),
        None => {
            errors.insert("password".to_string(), "password is required".to_string());
            None
        }
    };
    let (username, password) = match (username, password) {
        (Some(username), Some(password)) if errors.is_empty() => (username, password),
        _ => return Err(ApiError::validation(errors)),
    };

    let ctx = client_context(&headers, peer.map(|info| info.0));
    let outcome = state.auth.login(&username, &password, &ctx).await?;
    Ok(Json(outcome.into()))
}

#[derive(Debug, Clone, Serialize)]
struct LogoutResponse {
    status: &'static str,
    message: &'static str,
}

async fn logout(
    State(state): State<EdgeState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Json<LogoutResponse>, ApiError> {
    let token = bearer_token(&headers)
        .ok_or_else(|| ApiError::bad_request("Authorization header is required"))?;

    let ctx = client_context(&headers, peer.map(|info| info.0));
    state.auth.logout(token, &ctx).await?;

    Ok(Json(LogoutResponse {
        status: "success",
        message: "Logged out successfully",
    }))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    refresh_token: Option<String>,
}

async fn refresh(
    State(state): State<EdgeState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let refresh_token = body
        .refresh_token
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("refreshToken is required"))?;

    let ctx = client_context(&headers, peer.map(|info| info.0));
    let outcome = state.auth.refresh(&refresh_token, &ctx).await?;
    Ok(Json(outcome.into()))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateInvoiceBody {
    iban: Option<String>,
    amount: Option<Decimal>,
    vendor_id: Option<i64>,
    invoice_number: Option<String>,
}

async fn validate_invoice(
    State(state): State<EdgeState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(body): Json<ValidateInvoiceBody>,
) -> Result<Json<FraudCheckResponse>, ApiError> {
    let token =
        bearer_token(&headers).ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
    let claims = state.tokens.validate(token).await?;
    if claims.kind() != Some(TokenKind::Access) {
        return Err(ApiError::unauthorized("access token required"));
    }

    let request = FraudCheckRequest::from_parts(
        body.iban,
        body.amount,
        body.vendor_id,
        body.invoice_number,
    )
    .map_err(ApiError::validation)?;

    let response = state.scoring.check(&request).await?;

    let ctx = client_context(&headers, peer.map(|info| info.0));
    state.audit.emit(AuditRecord::invoice(
        Some(claims.uid),
        &request.invoice_number,
        &ctx,
        serde_json::json!({
            "decision": response.decision.as_str(),
            "fraudScore": response.fraud_score,
            "riskFactors": response.risk_factors,
        }),
    ));

    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use payshield_core::{
        hash_password, Decision, FraudCheckResponse, MemoryAuditStore, MemoryKv, MemoryTokenStore,
        MemoryUserStore, TokenAuthorityConfig, User,
    };
    use std::time::Duration;
    use tower::ServiceExt;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    struct StubScoring {
        response: Option<FraudCheckResponse>,
    }

    #[async_trait]
    impl FraudChecker for StubScoring {
        async fn check(
            &self,
            _request: &FraudCheckRequest,
        ) -> Result<FraudCheckResponse, ShieldError> {
            self.response
                .clone()
                .ok_or_else(|| ShieldError::Upstream("connection refused".to_string()))
        }
    }

    struct Fixture {
        audit_store: Arc<MemoryAuditStore>,
        state: EdgeState,
    }

    fn fixture_with_scoring(response: Option<FraudCheckResponse>) -> Fixture {
        let users = Arc::new(MemoryUserStore::new());
        users.upsert(User {
            id: 7,
            username: "analyst".to_string(),
            email: "analyst@example.com".to_string(),
            password_hash: hash_password("s3cret-pass").unwrap(),
            display_name: "Analyst".to_string(),
            active: true,
            locked: false,
            failed_attempts: 0,
            last_login_at: None,
        });

        let tokens = Arc::new(
            TokenAuthority::new(
                TokenAuthorityConfig::with_secret(SECRET),
                Arc::new(MemoryKv::new()),
                Arc::new(MemoryTokenStore::new()),
            )
            .unwrap(),
        );
        let audit_store = Arc::new(MemoryAuditStore::new());
        let audit = AuditSink::spawn(audit_store.clone());
        let auth = Arc::new(AuthService::new(users, tokens.clone(), audit.clone()));

        Fixture {
            audit_store,
            state: EdgeState {
                auth,
                tokens,
                scoring: Arc::new(StubScoring { response }),
                audit,
            },
        }
    }

    fn fixture() -> Fixture {
        fixture_with_scoring(Some(FraudCheckResponse {
            decision: Decision::Allow,
            fraud_score: 0,
            risk_factors: Vec::new(),
        }))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_json_bearer(uri: &str, token: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn login_tokens(app: &Router) -> (String, String) {
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/auth/login",
                serde_json::json!({"username": "analyst", "password": "s3cret-pass"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        (
            body["accessToken"].as_str().unwrap().to_string(),
            body["refreshToken"].as_str().unwrap().to_string(),
        )
    }

    #[tokio::test]
    async fn login_returns_the_token_pair() {
        let app = build_router(fixture().state);

        let response = app
            .oneshot(post_json(
                "/api/auth/login",
                serde_json::json!({"username": "analyst", "password": "s3cret-pass"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["tokenType"], "Bearer");
        assert_eq!(body["expiresIn"], 900_000);
        assert!(body["accessToken"].as_str().is_some_and(|t| !t.is_empty()));
        assert!(body["refreshToken"].as_str().is_some_and(|t| !t.is_empty()));
    }

    #[tokio::test]
    async fn login_with_bad_password_is_unauthorized_with_error_shape() {
        let app = build_router(fixture().state);

        let response = app
            .oneshot(post_json(
                "/api/auth/login",
                serde_json::json!({"username": "analyst", "password": "wrong"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(response).await;
        assert_eq!(body["status"], 401);
        assert_eq!(body["error"], "Unauthorized");
        assert!(body["message"].as_str().is_some());
        assert!(body["timestamp"].as_str().is_some());
    }

    #[tokio::test]
    async fn login_with_missing_fields_maps_per_field_errors() {
        let app = build_router(fixture().state);

        let response = app
            .oneshot(post_json(
                "/api/auth/login",
                serde_json::json!({"username": ""}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        let errors = body["errors"].as_object().unwrap();
        assert!(errors.contains_key("username"));
        assert!(errors.contains_key("password"));
    }

    #[tokio::test]
    async fn logout_without_header_is_a_bad_request() {
        let app = build_router(fixture().state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/auth/logout")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn logout_revokes_the_access_token() {
        let app = build_router(fixture().state);
        let (access, _) = login_tokens(&app).await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/auth/logout")
                    .header("authorization", format!("Bearer {access}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "success");

        // The revoked token no longer opens the validate endpoint.
        let response = app
            .oneshot(post_json_bearer(
                "/api/v1/invoices/validate",
                &access,
                serde_json::json!({
                    "iban": "BG80BNBG96611020345678",
                    "amount": "1500.00",
                    "vendorId": 1,
                    "invoiceNumber": "INV-001",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn logout_with_garbage_token_is_unauthorized() {
        let app = build_router(fixture().state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/auth/logout")
                    .header("authorization", "Bearer not-a-jwt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn refresh_echoes_the_refresh_token_and_mints_a_new_access_token() {
        let app = build_router(fixture().state);
        let (_, refresh) = login_tokens(&app).await;

        let response = app
            .oneshot(post_json(
                "/api/auth/refresh",
                serde_json::json!({"refreshToken": refresh}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["refreshToken"].as_str().unwrap(), refresh);
        assert_eq!(body["tokenType"], "Bearer");
        assert!(body["accessToken"].as_str().is_some_and(|t| !t.is_empty()));
    }

    #[tokio::test]
    async fn validate_without_bearer_is_unauthorized() {
        let app = build_router(fixture().state);

        let response = app
            .oneshot(post_json(
                "/api/v1/invoices/validate",
                serde_json::json!({
                    "iban": "BG80BNBG96611020345678",
                    "amount": "1500.00",
                    "vendorId": 1,
                    "invoiceNumber": "INV-001",
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn validate_rejects_a_refresh_token() {
        let app = build_router(fixture().state);
        let (_, refresh) = login_tokens(&app).await;

        let response = app
            .oneshot(post_json_bearer(
                "/api/v1/invoices/validate",
                &refresh,
                serde_json::json!({
                    "iban": "BG80BNBG96611020345678",
                    "amount": "1500.00",
                    "vendorId": 1,
                    "invoiceNumber": "INV-001",
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn validate_forwards_to_scoring_and_audits_the_outcome() {
        let fixture = fixture();
        let audit_store = fixture.audit_store.clone();
        let app = build_router(fixture.state);
        let (access, _) = login_tokens(&app).await;

        let response = app
            .oneshot(post_json_bearer(
                "/api/v1/invoices/validate",
                &access,
                serde_json::json!({
                    "iban": "BG80BNBG96611020345678",
                    "amount": "1500.00",
                    "vendorId": 1,
                    "invoiceNumber": "INV-001",
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["decision"], "ALLOW");
        assert_eq!(body["fraudScore"], 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let records = audit_store.records();
        let invoice_event = records
            .iter()
            .find(|record| record.action == "INVOICE_VALIDATED")
            .expect("invoice audit event");
        assert_eq!(invoice_event.user_id, Some(7));
        assert_eq!(invoice_event.resource_id.as_deref(), Some("INV-001"));
    }

    #[tokio::test]
    async fn validate_with_bad_fields_returns_the_error_map() {
        let app = build_router(fixture().state);
        let (access, _) = login_tokens(&app).await;

        let response = app
            .oneshot(post_json_bearer(
                "/api/v1/invoices/validate",
                &access,
                serde_json::json!({"amount": "0", "vendorId": -3}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        let errors = body["errors"].as_object().unwrap();
        assert_eq!(errors.len(), 4);
    }

    #[tokio::test]
    async fn scoring_outage_maps_to_bad_gateway() {
        let fixture = fixture_with_scoring(None);
        let app = build_router(fixture.state);
        let (access, _) = login_tokens(&app).await;

        let response = app
            .oneshot(post_json_bearer(
                "/api/v1/invoices/validate",
                &access,
                serde_json::json!({
                    "iban": "BG80BNBG96611020345678",
                    "amount": "1500.00",
                    "vendorId": 1,
                    "invoiceNumber": "INV-001",
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn health_endpoints_are_open() {
        let app = build_router(fixture().state);

        for uri in ["/actuator/health", "/api/v1/invoices/health"] {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("GET")
                        .uri(uri)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[test]
    fn client_ip_prefers_forwarded_for_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "203.0.113.7, 10.0.0.1".parse().unwrap(),
        );
        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());

        let ctx = client_context(&headers, Some("192.0.2.1:443".parse().unwrap()));
        assert_eq!(ctx.client_ip.as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn client_ip_falls_back_to_real_ip_then_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());
        let ctx = client_context(&headers, Some("192.0.2.1:443".parse().unwrap()));
        assert_eq!(ctx.client_ip.as_deref(), Some("198.51.100.2"));

        let ctx = client_context(&HeaderMap::new(), Some("192.0.2.1:443".parse().unwrap()));
        assert_eq!(ctx.client_ip.as_deref(), Some("192.0.2.1"));
    }
}
