//! Concrete backends for the PayShield contracts.

#![deny(unsafe_code)]

pub mod postgres;
pub mod redis_kv;
pub mod scoring_client;

pub use postgres::PostgresStore;
pub use redis_kv::RedisKv;
pub use scoring_client::{HttpScoringClient, API_KEY_HEADER};
