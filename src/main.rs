use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use diesel_migrations::MigrationHarness;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use letterdesk::auth::jwt::JwtService;
use letterdesk::config::AppConfig;
use letterdesk::db;
use letterdesk::routes;
use letterdesk::state::AppState;
use letterdesk::storage::S3Storage;
use letterdesk::MIGRATIONS;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "api",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        server_host = %config.server_host,
        server_port = config.server_port,
        public_base_url = %config.public_base_url,
        s3_bucket = %config.s3_bucket,
        "loaded letterdesk configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    {
        let mut conn = pool.get().context("failed to get database connection")?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        tracing::info!(applied = applied.len(), "database migrations checked");
    }

    let storage = Arc::new(S3Storage::from_config(&config).await?);
    let jwt = JwtService::from_config(&config)?;

    let listen_addr: SocketAddr =
        format!("{}:{}", config.server_host, config.server_port).parse()?;
    let state = AppState::new(pool, config, storage, jwt);
    let router = routes::create_router(state);

    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!("listening on {}", listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("received shutdown signal");
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
