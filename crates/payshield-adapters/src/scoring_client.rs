//! HTTP client for the internal edge → scoring channel, authenticated with a
//! pre-shared key.

use async_trait::async_trait;
use payshield_core::{FraudCheckRequest, FraudCheckResponse, FraudChecker, ShieldError};
use std::time::Duration;

pub const API_KEY_HEADER: &str = "X-API-KEY";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpScoringClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpScoringClient {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, ShieldError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| ShieldError::Config(format!("scoring client build failed: {err}")))?;
        Ok(Self {
            http,
            endpoint: format!(
                "{}/api/v1/invoices/validate",
                base_url.trim_end_matches('/')
            ),
            api_key: api_key.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl FraudChecker for HttpScoringClient {
    async fn check(&self, request: &FraudCheckRequest) -> Result<FraudCheckResponse, ShieldError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header(API_KEY_HEADER, &self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|err| ShieldError::Upstream(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ShieldError::Upstream(format!(
                "scoring service answered {status}"
            )));
        }

        response
            .json()
            .await
            .map_err(|err| ShieldError::Upstream(format!("malformed scoring response: {err}")))
    }
}
