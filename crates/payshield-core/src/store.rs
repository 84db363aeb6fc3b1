//! Durable-store contracts consumed by the two services, with in-memory
//! reference implementations.
//!
//! The edge service owns users and token records; the scoring service owns
//! transactions and the read-only IBAN registry. Audit appends are shared.

use crate::error::ShieldError;
use crate::types::{AuditRecord, NewTransaction, TokenRecord, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, ShieldError>;

    /// Reset the failed-attempt counter and stamp the last login.
    async fn record_login_success(
        &self,
        user_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), ShieldError>;

    /// Increment the failed-attempt counter; returns the new value.
    async fn increment_failed_attempts(&self, user_id: i64) -> Result<i32, ShieldError>;

    async fn set_locked(&self, user_id: i64) -> Result<(), ShieldError>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert(&self, record: &TokenRecord) -> Result<(), ShieldError>;

    /// Look up a non-revoked, non-expired record by owner and token string.
    async fn find_valid(
        &self,
        user_id: i64,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TokenRecord>, ShieldError>;

    async fn delete(&self, user_id: i64, token: &str) -> Result<(), ShieldError>;
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn insert(&self, transaction: &NewTransaction) -> Result<(), ShieldError>;

    /// Durable velocity fallback: transactions for an IBAN since `since`.
    async fn count_for_iban_since(
        &self,
        iban: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, ShieldError>;

    async fn count_for_vendor_since(
        &self,
        vendor_id: i64,
        since: DateTime<Utc>,
    ) -> Result<u64, ShieldError>;
}

#[async_trait]
pub trait IbanRegistry: Send + Sync {
    /// `None` when the IBAN is not in the registry at all.
    async fn is_risky(&self, iban: &str) -> Result<Option<bool>, ShieldError>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, record: &AuditRecord) -> Result<(), ShieldError>;
}

/// In-memory user store keyed by id, indexed by username.
#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<i64, User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<i64, User>>, ShieldError> {
        self.users
            .lock()
            .map_err(|_| ShieldError::Store("user store lock poisoned".to_string()))
    }

    pub fn upsert(&self, user: User) {
        self.users
            .lock()
            .expect("user lock poisoned")
            .insert(user.id, user);
    }

    pub fn get(&self, user_id: i64) -> Option<User> {
        self.users
            .lock()
            .expect("user lock poisoned")
            .get(&user_id)
            .cloned()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, ShieldError> {
        Ok(self
            .lock()?
            .values()
            .find(|user| user.username == username)
            .cloned())
    }

    async fn record_login_success(
        &self,
        user_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), ShieldError> {
        let mut users = self.lock()?;
        let user = users
            .get_mut(&user_id)
            .ok_or_else(|| ShieldError::Store(format!("unknown user {user_id}")))?;
        user.failed_attempts = 0;
        user.last_login_at = Some(at);
        Ok(())
    }

    async fn increment_failed_attempts(&self, user_id: i64) -> Result<i32, ShieldError> {
        let mut users = self.lock()?;
        let user = users
            .get_mut(&user_id)
            .ok_or_else(|| ShieldError::Store(format!("unknown user {user_id}")))?;
        user.failed_attempts += 1;
        Ok(user.failed_attempts)
    }

    async fn set_locked(&self, user_id: i64) -> Result<(), ShieldError> {
        let mut users = self.lock()?;
        let user = users
            .get_mut(&user_id)
            .ok_or_else(|| ShieldError::Store(format!("unknown user {user_id}")))?;
        user.locked = true;
        Ok(())
    }
}

/// In-memory token store keyed by token string.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, TokenRecord>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, TokenRecord>>, ShieldError> {
        self.tokens
            .lock()
            .map_err(|_| ShieldError::Store("token store lock poisoned".to_string()))
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().expect("token lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn insert(&self, record: &TokenRecord) -> Result<(), ShieldError> {
        let mut tokens = self.lock()?;
        if tokens.contains_key(&record.token) {
            return Err(ShieldError::Store("token already present".to_string()));
        }
        tokens.insert(record.token.clone(), record.clone());
        Ok(())
    }

    async fn find_valid(
        &self,
        user_id: i64,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TokenRecord>, ShieldError> {
        Ok(self
            .lock()?
            .get(token)
            .filter(|record| {
                record.user_id == user_id && !record.revoked && record.expires_at > now
            })
            .cloned())
    }

    async fn delete(&self, user_id: i64, token: &str) -> Result<(), ShieldError> {
        let mut tokens = self.lock()?;
        if tokens
            .get(token)
            .is_some_and(|record| record.user_id == user_id)
        {
            tokens.remove(token);
        }
        Ok(())
    }
}

/// In-memory transaction log.
#[derive(Default)]
pub struct MemoryTransactionStore {
    rows: Mutex<Vec<(NewTransaction, DateTime<Utc>)>>,
}

impl MemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backdate helper for velocity-fallback tests.
    pub fn insert_at(&self, transaction: NewTransaction, created_at: DateTime<Utc>) {
        self.rows
            .lock()
            .expect("transaction lock poisoned")
            .push((transaction, created_at));
    }

    pub fn rows(&self) -> Vec<NewTransaction> {
        self.rows
            .lock()
            .expect("transaction lock poisoned")
            .iter()
            .map(|(tx, _)| tx.clone())
            .collect()
    }
}

#[async_trait]
impl TransactionStore for MemoryTransactionStore {
    async fn insert(&self, transaction: &NewTransaction) -> Result<(), ShieldError> {
        self.insert_at(transaction.clone(), Utc::now());
        Ok(())
    }

    async fn count_for_iban_since(
        &self,
        iban: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, ShieldError> {
        Ok(self
            .rows
            .lock()
            .map_err(|_| ShieldError::Store("transaction store lock poisoned".to_string()))?
            .iter()
            .filter(|(tx, created_at)| tx.iban == iban && *created_at >= since)
            .count() as u64)
    }

    async fn count_for_vendor_since(
        &self,
        vendor_id: i64,
        since: DateTime<Utc>,
    ) -> Result<u64, ShieldError> {
        Ok(self
            .rows
            .lock()
            .map_err(|_| ShieldError::Store("transaction store lock poisoned".to_string()))?
            .iter()
            .filter(|(tx, created_at)| tx.vendor_id == Some(vendor_id) && *created_at >= since)
            .count() as u64)
    }
}

/// In-memory IBAN registry.
#[derive(Default)]
pub struct MemoryIbanRegistry {
    entries: Mutex<HashMap<String, bool>>,
}

impl MemoryIbanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, iban: impl Into<String>, risky: bool) {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .insert(iban.into(), risky);
    }
}

#[async_trait]
impl IbanRegistry for MemoryIbanRegistry {
    async fn is_risky(&self, iban: &str) -> Result<Option<bool>, ShieldError> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| ShieldError::Store("registry lock poisoned".to_string()))?
            .get(iban)
            .copied())
    }
}

/// In-memory append-only audit log.
#[derive(Default)]
pub struct MemoryAuditStore {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().expect("audit lock poisoned").clone()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, record: &AuditRecord) -> Result<(), ShieldError> {
        self.records
            .lock()
            .map_err(|_| ShieldError::Store("audit store lock poisoned".to_string()))?
            .push(record.clone());
        Ok(())
    }
}
