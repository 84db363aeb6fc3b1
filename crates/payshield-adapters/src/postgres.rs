//! Postgres durable stores behind a single shared pool.
//!
//! Schema invariants live with the tables: fraud_score 0..100, decision in
//! the three-tier set, IBANs exactly 22 characters. The audit log exposes no
//! update or delete operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use payshield_core::{
    AuditRecord, AuditStore, IbanRegistry, NewTransaction, ShieldError, TokenKind, TokenRecord,
    TokenStore, TransactionStore, User, UserStore,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id BIGSERIAL PRIMARY KEY,
        username TEXT NOT NULL UNIQUE CHECK (char_length(username) >= 3),
        email TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        display_name TEXT NOT NULL,
        active BOOLEAN NOT NULL DEFAULT TRUE,
        locked BOOLEAN NOT NULL DEFAULT FALSE,
        failed_attempts INTEGER NOT NULL DEFAULT 0,
        last_login_at TIMESTAMPTZ NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jwt_tokens (
        token TEXT PRIMARY KEY,
        user_id BIGINT NOT NULL REFERENCES users (id),
        kind TEXT NOT NULL CHECK (kind IN ('ACCESS', 'REFRESH')),
        issued_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        revoked BOOLEAN NOT NULL DEFAULT FALSE,
        revoked_at TIMESTAMPTZ NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jwt_tokens_user_id ON jwt_tokens (user_id)",
    r#"
    CREATE TABLE IF NOT EXISTS vendors (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        iban TEXT NOT NULL CHECK (char_length(iban) = 22),
        risk_bucket TEXT NOT NULL CHECK (risk_bucket IN ('LOW', 'MEDIUM', 'HIGH')),
        active BOOLEAN NOT NULL DEFAULT TRUE,
        total_count BIGINT NOT NULL DEFAULT 0,
        flagged_count BIGINT NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ibans (
        iban TEXT PRIMARY KEY CHECK (char_length(iban) = 22),
        risky BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
        id BIGSERIAL PRIMARY KEY,
        transaction_ref TEXT NOT NULL UNIQUE,
        iban TEXT NOT NULL CHECK (char_length(iban) = 22),
        amount NUMERIC(18, 2) NOT NULL CHECK (amount > 0),
        vendor_id BIGINT NULL,
        invoice_number TEXT NOT NULL,
        fraud_score SMALLINT NOT NULL CHECK (fraud_score BETWEEN 0 AND 100),
        decision TEXT NOT NULL CHECK (decision IN ('ALLOW', 'REVIEW', 'BLOCK')),
        risk_factors JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_transactions_iban_created ON transactions (iban, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_vendor_created ON transactions (vendor_id, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS audit_log (
        id BIGSERIAL PRIMARY KEY,
        user_id BIGINT NULL,
        action TEXT NOT NULL,
        resource_kind TEXT NOT NULL,
        resource_id TEXT NULL,
        client_ip TEXT NULL,
        user_agent TEXT NULL,
        detail JSONB NOT NULL,
        occurred_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
];

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect with a bounded pool; the initial connect doubles as the
    /// startup reachability probe.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, ShieldError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|err| ShieldError::Store(format!("postgres connect failed: {err}")))?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), ShieldError> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|err| ShieldError::Store(format!("schema bootstrap failed: {err}")))?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn user_from_row(row: &PgRow) -> Result<User, ShieldError> {
    Ok(User {
        id: row.try_get("id").map_err(ShieldError::store)?,
        username: row.try_get("username").map_err(ShieldError::store)?,
        email: row.try_get("email").map_err(ShieldError::store)?,
        password_hash: row.try_get("password_hash").map_err(ShieldError::store)?,
        display_name: row.try_get("display_name").map_err(ShieldError::store)?,
        active: row.try_get("active").map_err(ShieldError::store)?,
        locked: row.try_get("locked").map_err(ShieldError::store)?,
        failed_attempts: row.try_get("failed_attempts").map_err(ShieldError::store)?,
        last_login_at: row.try_get("last_login_at").map_err(ShieldError::store)?,
    })
}

fn token_from_row(row: &PgRow) -> Result<TokenRecord, ShieldError> {
    let kind: String = row.try_get("kind").map_err(ShieldError::store)?;
    let kind = TokenKind::parse(&kind)
        .ok_or_else(|| ShieldError::Store(format!("unknown token kind '{kind}'")))?;
    Ok(TokenRecord {
        token: row.try_get("token").map_err(ShieldError::store)?,
        user_id: row.try_get("user_id").map_err(ShieldError::store)?,
        kind,
        issued_at: row.try_get("issued_at").map_err(ShieldError::store)?,
        expires_at: row.try_get("expires_at").map_err(ShieldError::store)?,
        revoked: row.try_get("revoked").map_err(ShieldError::store)?,
        revoked_at: row.try_get("revoked_at").map_err(ShieldError::store)?,
    })
}

#[async_trait]
impl UserStore for PostgresStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, ShieldError> {
        let row = sqlx::query(
            r#"
            SELECT id, username, email, password_hash, display_name,
                   active, locked, failed_attempts, last_login_at
            FROM users
            WHERE username = $1
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(ShieldError::store)?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn record_login_success(
        &self,
        user_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), ShieldError> {
        sqlx::query("UPDATE users SET failed_attempts = 0, last_login_at = $2 WHERE id = $1")
            .bind(user_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(ShieldError::store)?;
        Ok(())
    }

    async fn increment_failed_attempts(&self, user_id: i64) -> Result<i32, ShieldError> {
        let row = sqlx::query(
            r#"
            UPDATE users
            SET failed_attempts = failed_attempts + 1
            WHERE id = $1
            RETURNING failed_attempts
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(ShieldError::store)?;
        row.try_get("failed_attempts").map_err(ShieldError::store)
    }

    async fn set_locked(&self, user_id: i64) -> Result<(), ShieldError> {
        sqlx::query("UPDATE users SET locked = TRUE WHERE id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(ShieldError::store)?;
        Ok(())
    }
}

#[async_trait]
impl TokenStore for PostgresStore {
    async fn insert(&self, record: &TokenRecord) -> Result<(), ShieldError> {
        sqlx::query(
            r#"
            INSERT INTO jwt_tokens (token, user_id, kind, issued_at, expires_at, revoked, revoked_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&record.token)
        .bind(record.user_id)
        .bind(record.kind.as_str())
        .bind(record.issued_at)
        .bind(record.expires_at)
        .bind(record.revoked)
        .bind(record.revoked_at)
        .execute(&self.pool)
        .await
        .map_err(ShieldError::store)?;
        Ok(())
    }

    async fn find_valid(
        &self,
        user_id: i64,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TokenRecord>, ShieldError> {
        let row = sqlx::query(
            r#"
            SELECT token, user_id, kind, issued_at, expires_at, revoked, revoked_at
            FROM jwt_tokens
            WHERE user_id = $1 AND token = $2 AND revoked = FALSE AND expires_at > $3
            "#,
        )
        .bind(user_id)
        .bind(token)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(ShieldError::store)?;

        row.as_ref().map(token_from_row).transpose()
    }

    async fn delete(&self, user_id: i64, token: &str) -> Result<(), ShieldError> {
        sqlx::query("DELETE FROM jwt_tokens WHERE user_id = $1 AND token = $2")
            .bind(user_id)
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(ShieldError::store)?;
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for PostgresStore {
    async fn insert(&self, transaction: &NewTransaction) -> Result<(), ShieldError> {
        let risk_factors = serde_json::to_value(&transaction.risk_factors)
            .map_err(|err| ShieldError::Serialization(err.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO transactions
                (transaction_ref, iban, amount, vendor_id, invoice_number,
                 fraud_score, decision, risk_factors)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&transaction.transaction_ref)
        .bind(&transaction.iban)
        .bind(transaction.amount)
        .bind(transaction.vendor_id)
        .bind(&transaction.invoice_number)
        .bind(i16::from(transaction.fraud_score))
        .bind(transaction.decision.as_str())
        .bind(risk_factors)
        .execute(&self.pool)
        .await
        .map_err(ShieldError::store)?;
        Ok(())
    }

    async fn count_for_iban_since(
        &self,
        iban: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, ShieldError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM transactions WHERE iban = $1 AND created_at >= $2",
        )
        .bind(iban)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(ShieldError::store)?;
        Ok(count.max(0) as u64)
    }

    async fn count_for_vendor_since(
        &self,
        vendor_id: i64,
        since: DateTime<Utc>,
    ) -> Result<u64, ShieldError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM transactions WHERE vendor_id = $1 AND created_at >= $2",
        )
        .bind(vendor_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(ShieldError::store)?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl IbanRegistry for PostgresStore {
    async fn is_risky(&self, iban: &str) -> Result<Option<bool>, ShieldError> {
        sqlx::query_scalar("SELECT risky FROM ibans WHERE iban = $1")
            .bind(iban)
            .fetch_optional(&self.pool)
            .await
            .map_err(ShieldError::store)
    }
}

#[async_trait]
impl AuditStore for PostgresStore {
    async fn append(&self, record: &AuditRecord) -> Result<(), ShieldError> {
        sqlx::query(
            r#"
            INSERT INTO audit_log
                (user_id, action, resource_kind, resource_id, client_ip,
                 user_agent, detail, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.user_id)
        .bind(&record.action)
        .bind(&record.resource_kind)
        .bind(&record.resource_id)
        .bind(&record.client_ip)
        .bind(&record.user_agent)
        .bind(&record.detail)
        .bind(record.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(ShieldError::store)?;
        Ok(())
    }
}
