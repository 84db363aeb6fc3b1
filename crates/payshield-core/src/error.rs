use thiserror::Error;

/// PayShield runtime errors.
#[derive(Debug, Error)]
pub enum ShieldError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Account is inactive")]
    AccountInactive,

    #[error("Account is locked")]
    AccountLocked,

    #[error("Invalid token: {0}")]
    TokenInvalid(String),

    #[error("Token has expired")]
    TokenExpired,

    #[error("Token has been revoked")]
    TokenRevoked,

    #[error("Authentication temporarily unavailable: {0}")]
    AuthUnavailable(String),

    #[error("Scoring service unavailable: {0}")]
    Upstream(String),

    #[error("KV store error: {0}")]
    Kv(String),

    #[error("Durable store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShieldError {
    pub fn kv(err: impl std::fmt::Display) -> Self {
        Self::Kv(err.to_string())
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store(err.to_string())
    }

    /// True for every rejection that maps to an authentication failure (401).
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredentials
                | Self::AccountInactive
                | Self::AccountLocked
                | Self::TokenInvalid(_)
                | Self::TokenExpired
                | Self::TokenRevoked
        )
    }
}
