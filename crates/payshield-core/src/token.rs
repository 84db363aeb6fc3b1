//! Stateful JWT subsystem: dual-store issuance, layered validation, and a
//! blacklist overlay for instant revocation.
//!
//! The durable store provides survivability across restarts, the KV cache the
//! sub-millisecond read path, and the blacklist revocation without purging
//! either. Auth decisions are fail-closed: the only KV read allowed to degrade
//! is the token-cache read, which falls through to the durable store.

use crate::error::ShieldError;
use crate::kv::KvStore;
use crate::store::TokenStore;
use crate::types::{TokenKind, TokenRecord, User};
use chrono::{DateTime, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// HS256 requires at least a 256-bit key.
pub const MIN_SECRET_BYTES: usize = 32;

pub const DEFAULT_ACCESS_TTL: Duration = Duration::from_millis(900_000);
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_millis(604_800_000);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User login name.
    pub sub: String,
    /// Owning user id.
    pub uid: i64,
    /// Token kind, `ACCESS` or `REFRESH`.
    pub typ: String,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn kind(&self) -> Option<TokenKind> {
        TokenKind::parse(&self.typ)
    }
}

#[derive(Debug, Clone)]
pub struct TokenAuthorityConfig {
    pub secret: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl TokenAuthorityConfig {
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            access_ttl: DEFAULT_ACCESS_TTL,
            refresh_ttl: DEFAULT_REFRESH_TTL,
        }
    }
}

/// A freshly issued token together with its lifetime.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub lifetime: Duration,
}

pub struct TokenAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    claims_only: Validation,
    kv: Arc<dyn KvStore>,
    tokens: Arc<dyn TokenStore>,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenAuthority {
    pub fn new(
        config: TokenAuthorityConfig,
        kv: Arc<dyn KvStore>,
        tokens: Arc<dyn TokenStore>,
    ) -> Result<Self, ShieldError> {
        if config.secret.len() < MIN_SECRET_BYTES {
            return Err(ShieldError::Config(format!(
                "JWT secret must be at least {MIN_SECRET_BYTES} bytes"
            )));
        }

        // Expiry is strict and the algorithm pinned; a token declaring any
        // other algorithm is rejected outright.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = true;

        let mut claims_only = Validation::new(Algorithm::HS256);
        claims_only.leeway = 0;
        claims_only.validate_exp = false;

        Ok(Self {
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            claims_only,
            kv,
            tokens,
            access_ttl: config.access_ttl,
            refresh_ttl: config.refresh_ttl,
        })
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    /// Issue a signed token and record it in both stores. The durable write
    /// is the one that counts; a KV write failure only costs the fast path.
    pub async fn issue(&self, user: &User, kind: TokenKind) -> Result<IssuedToken, ShieldError> {
        let lifetime = match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        };
        let now = Utc::now();
        let expires_at = now + chrono::Duration::milliseconds(lifetime.as_millis() as i64);

        let claims = Claims {
            sub: user.username.clone(),
            uid: user.id,
            typ: kind.as_str().to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|err| ShieldError::Internal(format!("token signing failed: {err}")))?;

        let record = TokenRecord {
            token: token.clone(),
            user_id: user.id,
            kind,
            issued_at: now,
            expires_at,
            revoked: false,
            revoked_at: None,
        };
        self.tokens
            .insert(&record)
            .await
            .map_err(|err| ShieldError::AuthUnavailable(err.to_string()))?;

        if let Err(err) = self
            .kv
            .set_ex(&token_key(&token), &user.id.to_string(), lifetime)
            .await
        {
            warn!(%err, "token cache write failed, validation will use the durable store");
        }

        Ok(IssuedToken {
            token,
            expires_at,
            lifetime,
        })
    }

    /// Layered validation: blacklist, signature and expiry, token cache,
    /// durable store with cache re-population.
    pub async fn validate(&self, token: &str) -> Result<Claims, ShieldError> {
        match self.kv.exists(&blacklist_key(token)).await {
            Ok(true) => return Err(ShieldError::TokenRevoked),
            Ok(false) => {}
            Err(err) => {
                warn!(%err, "blacklist read failed, rejecting token");
                return Err(ShieldError::TokenInvalid(
                    "revocation state unavailable".to_string(),
                ));
            }
        }

        let claims = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => ShieldError::TokenExpired,
                _ => ShieldError::TokenInvalid(err.to_string()),
            })?
            .claims;

        match self.kv.get(&token_key(token)).await {
            Ok(Some(_)) => return Ok(claims),
            Ok(None) => {}
            Err(err) => {
                warn!(%err, "token cache read failed, falling back to durable store");
            }
        }

        let now = Utc::now();
        let record = self
            .tokens
            .find_valid(claims.uid, token, now)
            .await
            .map_err(|err| {
                warn!(%err, "durable token lookup failed, rejecting token");
                ShieldError::TokenInvalid("token store unavailable".to_string())
            })?
            .ok_or_else(|| ShieldError::TokenInvalid("token is not active".to_string()))?;

        let residual = (record.expires_at - now)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if !residual.is_zero() {
            if let Err(err) = self
                .kv
                .set_ex(&token_key(token), &record.user_id.to_string(), residual)
                .await
            {
                warn!(%err, "token cache re-population failed");
            }
        }

        Ok(claims)
    }

    /// Revoke a token. The blacklist write is authoritative; the KV and
    /// durable deletes are best-effort cleanup.
    pub async fn revoke(&self, token: &str) -> Result<(), ShieldError> {
        let claims = self.subject_of(token)?;

        let residual = claims.exp - Utc::now().timestamp();
        if residual > 0 {
            self.kv
                .set_ex(
                    &blacklist_key(token),
                    "revoked",
                    Duration::from_secs(residual as u64),
                )
                .await
                .map_err(|err| ShieldError::AuthUnavailable(err.to_string()))?;
        }

        if let Err(err) = self.kv.del(&token_key(token)).await {
            warn!(%err, "token cache delete failed during revocation");
        }
        if let Err(err) = self.tokens.delete(claims.uid, token).await {
            warn!(%err, "durable token delete failed during revocation");
        }
        Ok(())
    }

    /// Signature-verified claim extraction without expiry enforcement; used
    /// for logging and by revocation.
    pub fn subject_of(&self, token: &str) -> Result<Claims, ShieldError> {
        decode::<Claims>(token, &self.decoding, &self.claims_only)
            .map(|data| data.claims)
            .map_err(|err| ShieldError::TokenInvalid(err.to_string()))
    }
}

fn token_key(token: &str) -> String {
    format!("jwt:token:{token}")
}

fn blacklist_key(token: &str) -> String {
    format!("jwt:blacklist:{token}")
}
