//! PayShield core: the fraud scoring engine and the stateful token authority,
//! parameterized by a KV-store contract and durable-store contracts.
//!
//! Concrete Redis/Postgres/HTTP backends live in `payshield-adapters`; the
//! two services wire everything together in their binaries.

#![deny(unsafe_code)]

pub mod account;
pub mod audit;
pub mod engine;
pub mod error;
pub mod iban;
pub mod kv;
pub mod store;
pub mod token;
pub mod types;

pub use account::{hash_password, AuthService, LoginOutcome, LOCKOUT_THRESHOLD};
pub use audit::{AuditSink, AUDIT_QUEUE_DEPTH};
pub use engine::{
    amount_near_threshold, FraudChecker, FraudEngine, FraudEngineConfig, AMOUNT_THRESHOLDS,
    THRESHOLD_MARGIN_ABOVE, THRESHOLD_MARGIN_BELOW,
};
pub use error::ShieldError;
pub use iban::{CachedIbanValidator, IbanFault, IBAN_LENGTH};
pub use kv::{FailingKv, KvStore, MemoryKv, StallKv};
pub use store::{
    AuditStore, IbanRegistry, MemoryAuditStore, MemoryIbanRegistry, MemoryTokenStore,
    MemoryTransactionStore, MemoryUserStore, TokenStore, TransactionStore, UserStore,
};
pub use token::{
    Claims, IssuedToken, TokenAuthority, TokenAuthorityConfig, DEFAULT_ACCESS_TTL,
    DEFAULT_REFRESH_TTL, MIN_SECRET_BYTES,
};
pub use types::{
    AuditRecord, ClientContext, Decision, FraudCheckRequest, FraudCheckResponse, NewTransaction,
    RiskBucket, TokenKind, TokenRecord, User, Vendor,
};
