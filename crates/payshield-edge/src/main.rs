use clap::Parser;
use payshield_adapters::{HttpScoringClient, PostgresStore, RedisKv};
use payshield_core::{AuditSink, AuthService, TokenAuthority, TokenAuthorityConfig};
use payshield_edge::{build_router, EdgeState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "payshield-edge", version, about = "PayShield edge service")]
struct Cli {
    /// Socket address to bind, e.g. 127.0.0.1:8080
    #[arg(long, default_value = "127.0.0.1:8080", env = "EDGE_LISTEN")]
    listen: SocketAddr,
    /// Base url of the internal scoring service.
    #[arg(long, default_value = "http://127.0.0.1:8081", env = "SCORING_URL")]
    scoring_url: String,
    /// Pre-shared key presented on the internal scoring channel.
    #[arg(long, env = "API_KEY")]
    api_key: String,
    /// Symmetric JWT signing secret; must be at least 32 bytes.
    #[arg(long, env = "JWT_SECRET")]
    jwt_secret: String,
    /// Access-token lifetime in milliseconds.
    #[arg(long, default_value_t = 900_000, env = "JWT_ACCESS_EXPIRATION")]
    jwt_access_expiration: u64,
    /// Refresh-token lifetime in milliseconds.
    #[arg(long, default_value_t = 604_800_000, env = "JWT_REFRESH_EXPIRATION")]
    jwt_refresh_expiration: u64,
    /// PostgreSQL url for users, token records, and audit rows.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
    /// Redis url for the token cache and the blacklist.
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
            std::env::var("RUST_LOG").unwrap_or_else(|_| "payshield_edge=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();

    // Initial connects probe reachability; failure here exits non-zero.
    let store = Arc::new(PostgresStore::connect(&cli.database_url, cli.pg_max_connections).await?);
    store.ensure_schema().await?;
    let kv = Arc::new(RedisKv::connect(&cli.redis_url).await?);

    let tokens = Arc::new(TokenAuthority::new(
        TokenAuthorityConfig {
            secret: cli.jwt_secret,
            access_ttl: Duration::from_millis(cli.jwt_access_expiration),
            refresh_ttl: Duration::from_millis(cli.jwt_refresh_expiration),
        },
        kv,
        store.clone(),
    )?);
    let audit = AuditSink::spawn(store.clone());
    let auth = Arc::new(AuthService::new(store, tokens.clone(), audit.clone()));
    let scoring = Arc::new(HttpScoringClient::new(&cli.scoring_url, cli.api_key)?);

    let app = build_router(EdgeState {
        auth,
        tokens,
        scoring,
        audit,
    });

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("payshield-edge listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
