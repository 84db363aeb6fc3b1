//! Login, refresh, and logout flows on top of the token authority.

use crate::audit::AuditSink;
use crate::error::ShieldError;
use crate::store::UserStore;
use crate::token::TokenAuthority;
use crate::types::{AuditRecord, ClientContext, TokenKind, User};
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

/// Consecutive failed logins before the account is locked.
pub const LOCKOUT_THRESHOLD: i32 = 5;

/// Hash a password into a PHC-format verifier.
pub fn hash_password(password: &str) -> Result<String, ShieldError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| ShieldError::Internal(format!("password hashing failed: {err}")))
}

fn verify_password(password: &str, verifier: &str) -> Result<bool, ShieldError> {
    let parsed = PasswordHash::new(verifier)
        .map_err(|err| ShieldError::Internal(format!("stored verifier is malformed: {err}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in_ms: u64,
}

pub struct AuthService {
    users: Arc<dyn UserStore>,
    tokens: Arc<TokenAuthority>,
    audit: AuditSink,
}

impl AuthService {
    pub fn new(users: Arc<dyn UserStore>, tokens: Arc<TokenAuthority>, audit: AuditSink) -> Self {
        Self {
            users,
            tokens,
            audit,
        }
    }

    pub fn tokens(&self) -> &TokenAuthority {
        &self.tokens
    }

    pub async fn login(
        &self,
        username: &str,
        password: &str,
        ctx: &ClientContext,
    ) -> Result<LoginOutcome, ShieldError> {
        let user = self
            .users
            .find_by_username(username)
            .await
            .map_err(|err| ShieldError::AuthUnavailable(err.to_string()))?;

        let Some(user) = user else {
            self.audit.emit(AuditRecord::anonymous_auth(
                "AUTH_LOGIN_FAILED",
                ctx,
                serde_json::json!({"username": username, "reason": "unknown user"}),
            ));
            return Err(ShieldError::InvalidCredentials);
        };

        if !user.active {
            self.emit_auth(&user, "AUTH_LOGIN_FAILED", ctx, "account inactive");
            return Err(ShieldError::AccountInactive);
        }
        if user.locked {
            self.emit_auth(&user, "AUTH_LOGIN_FAILED", ctx, "account locked");
            return Err(ShieldError::AccountLocked);
        }

        if !verify_password(password, &user.password_hash)? {
            match self.users.increment_failed_attempts(user.id).await {
                Ok(attempts) if attempts >= LOCKOUT_THRESHOLD => {
                    if let Err(err) = self.users.set_locked(user.id).await {
                        warn!(%err, user_id = user.id, "failed to lock account");
                    } else {
                        self.emit_auth(&user, "AUTH_ACCOUNT_LOCKED", ctx, "lockout threshold");
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(%err, user_id = user.id, "failed-attempt update failed"),
            }
            self.emit_auth(&user, "AUTH_LOGIN_FAILED", ctx, "bad password");
            return Err(ShieldError::InvalidCredentials);
        }

        let access = self.tokens.issue(&user, TokenKind::Access).await?;
        let refresh = self.tokens.issue(&user, TokenKind::Refresh).await?;

        if let Err(err) = self.users.record_login_success(user.id, Utc::now()).await {
            warn!(%err, user_id = user.id, "last-login update failed");
        }
        self.emit_auth(&user, "AUTH_LOGIN_SUCCESS", ctx, "ok");

        Ok(LoginOutcome {
            access_token: access.token,
            refresh_token: refresh.token,
            expires_in_ms: access.lifetime.as_millis() as u64,
        })
    }

    /// Validate the refresh token and mint a new access token. The refresh
    /// token is reused, not rotated.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        ctx: &ClientContext,
    ) -> Result<LoginOutcome, ShieldError> {
        let claims = self.tokens.validate(refresh_token).await?;
        if claims.kind() != Some(TokenKind::Refresh) {
            return Err(ShieldError::TokenInvalid(
                "not a refresh token".to_string(),
            ));
        }

        let user = self
            .users
            .find_by_username(&claims.sub)
            .await
            .map_err(|err| ShieldError::AuthUnavailable(err.to_string()))?
            .ok_or(ShieldError::InvalidCredentials)?;
        if !user.active {
            return Err(ShieldError::AccountInactive);
        }
        if user.locked {
            return Err(ShieldError::AccountLocked);
        }

        let access = self.tokens.issue(&user, TokenKind::Access).await?;
        self.emit_auth(&user, "AUTH_REFRESH", ctx, "ok");

        Ok(LoginOutcome {
            access_token: access.token,
            refresh_token: refresh_token.to_string(),
            expires_in_ms: access.lifetime.as_millis() as u64,
        })
    }

    pub async fn logout(&self, token: &str, ctx: &ClientContext) -> Result<(), ShieldError> {
        let user_id = self.tokens.subject_of(token).ok().map(|claims| claims.uid);
        self.tokens.revoke(token).await?;

        match user_id {
            Some(user_id) => self.audit.emit(AuditRecord::auth(
                user_id,
                "AUTH_LOGOUT",
                ctx,
                serde_json::json!({}),
            )),
            None => self.audit.emit(AuditRecord::anonymous_auth(
                "AUTH_LOGOUT",
                ctx,
                serde_json::json!({}),
            )),
        }
        Ok(())
    }

    fn emit_auth(&self, user: &User, action: &str, ctx: &ClientContext, reason: &str) {
        self.audit.emit(AuditRecord::auth(
            user.id,
            action,
            ctx,
            serde_json::json!({"username": user.username, "reason": reason}),
        ));
    }
}
