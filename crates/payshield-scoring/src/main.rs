use clap::Parser;
use payshield_adapters::{PostgresStore, RedisKv};
use payshield_core::{FraudEngine, FraudEngineConfig};
use payshield_scoring::{build_router, ScoringState};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "payshield-scoring", version, about = "PayShield scoring service")]
struct Cli {
    /// Socket address to bind, e.g. 127.0.0.1:8081
    #[arg(long, default_value = "127.0.0.1:8081", env = "SCORING_LISTEN")]
    listen: SocketAddr,
    /// Pre-shared key required on the internal validate endpoint.
    #[arg(long, env = "API_KEY")]
    api_key: String,
    /// PostgreSQL url for transactions, the IBAN registry, and audit rows.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
    /// Redis url for duplicate, risky-IBAN, and velocity state.
    #[arg(long, default_value = "redis://127.0.0.1:6379", env = "REDIS_URL")]
    redis_url: String,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 30, env = "PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "payshield_scoring=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();

    // The initial connects double as the startup reachability probe; a
    // failure here exits non-zero.
    let store = Arc::new(PostgresStore::connect(&cli.database_url, cli.pg_max_connections).await?);
    store.ensure_schema().await?;
    let kv = Arc::new(RedisKv::connect(&cli.redis_url).await?);

    let engine = FraudEngine::new(
        kv,
        store.clone(),
        store.clone(),
        FraudEngineConfig::default(),
    );
    let state = ScoringState {
        engine: Arc::new(engine),
        api_key: cli.api_key,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("payshield-scoring listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
