/// swarmd — coordination daemon for a fleet of coding agents.
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use swarm_core::{Engine, EngineConfig, SqliteStore};
use swarm_daemon::bridge::LoggingBridge;
use swarm_daemon::http::{router, AppState};
use swarm_daemon::ticker;
use swarm_daemon::tools::ToolRegistry;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "swarmd",
    about = "Coordination daemon for a swarm of coding agents",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// Bind address for the HTTP surface
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// HTTP port
    #[arg(short, long, default_value_t = 4500)]
    port: u16,

    /// Scheduler tick period in seconds
    #[arg(long, default_value_t = 5)]
    tick_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(args.log_level.parse()?))
        .with_target(false)
        .init();

    let config = EngineConfig::from_env();
    info!(db = %config.database_path.display(), "opening store");
    let store = SqliteStore::open(&config.database_path).await?;
    let engine = Engine::new(store);

    let tools = Arc::new(ToolRegistry::new(
        engine.clone(),
        config.capabilities.clone(),
        Arc::new(LoggingBridge),
    ));
    info!(tools = tools.tool_names().len(), "tool surface registered");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ticker_handle = tokio::spawn(ticker::run(
        engine.clone(),
        Duration::from_secs(args.tick_secs.max(1)),
        shutdown_rx,
    ));

    let app = router(AppState {
        engine: engine.clone(),
        tools,
    });
    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    // Drain the scheduler's current tick before closing the store.
    let _ = shutdown_tx.send(true);
    let _ = ticker_handle.await;
    engine.store().close().await;
    info!("bye");
    Ok(())
}
