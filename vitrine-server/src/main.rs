use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vitrine_core::persistence::postgres::{
    ensure_schema, postgres_repositories,
};
use vitrine_server::{build_router, build_state, Config};

const EXIT_CONFIG: u8 = 1;
const EXIT_STORE_UNREACHABLE: u8 = 2;
const EXIT_NO_CACHE_ROOT: u8 = 3;

/// Command line arguments for the Vitrine image server.
#[derive(Parser, Debug)]
#[command(name = "vitrine-server")]
#[command(about = "Image collection server with cached derived artifacts")]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long, env = "VITRINE_CONFIG")]
    config: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(short, long, env = "VITRINE_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "VITRINE_HOST")]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // .env is optional; a missing file is not an error.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }

    let pool = match PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(
            config.database.connect_timeout_secs,
        ))
        .connect(&config.database.url)
        .await
    {
        Ok(pool) => pool,
        Err(err) => {
            error!("metadata store unreachable: {err}");
            return ExitCode::from(EXIT_STORE_UNREACHABLE);
        }
    };
    if let Err(err) = ensure_schema(&pool).await {
        error!("schema bootstrap failed: {err}");
        return ExitCode::from(EXIT_STORE_UNREACHABLE);
    }
    info!("metadata store ready");

    let repos = postgres_repositories(pool);
    let longpath =
        vitrine_core::LongPath::new(config.path.safe_limit);
    match vitrine_server::startup::sync_cache_roots(
        &config, &repos, longpath,
    )
    .await
    {
        Ok(0) => {
            error!("no usable cache root; configure [[cache.roots]]");
            return ExitCode::from(EXIT_NO_CACHE_ROOT);
        }
        Ok(count) => info!(count, "active cache roots"),
        Err(err) => {
            error!("cache root sync failed: {err}");
            return ExitCode::from(EXIT_NO_CACHE_ROOT);
        }
    }

    let state = build_state(&config, repos).await;
    if let Err(err) = state.pool.recover().await {
        error!("job recovery failed: {err}");
    }

    let addr: SocketAddr = match format!(
        "{}:{}",
        config.server.host, config.server.port
    )
    .parse()
    {
        Ok(addr) => addr,
        Err(err) => {
            error!("invalid bind address: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {addr}: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    info!("listening on {addr}");

    let worker_pool = state.pool.clone();
    let router = build_router(state);
    let serve = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal());
    if let Err(err) = serve.await {
        error!("server error: {err}");
    }

    info!("draining worker pool");
    worker_pool.shutdown().await;
    info!("shutdown complete");
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
