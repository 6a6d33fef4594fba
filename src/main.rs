// src/main.rs

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use flaketrack::analytics::kusto::KustoClient;
use flaketrack::analytics::QueryContext;
use flaketrack::azdo::client::AzDoConnector;
use flaketrack::config::Config;
use flaketrack::loader::{DataLoader, LoaderOptions};
use flaketrack::snapshot::{ReadinessGate, SnapshotStore};
use flaketrack::state::AppState;
use flaketrack::store;
use flaketrack::sync::{SyncOptions, SyncOrchestrator};
use flaketrack::web;

#[derive(Parser)]
#[command(name = "flaketrack", about = "CI test-run health tracker")]
struct Cli {
    /// Run a single sync cycle and exit (no server, no data loader).
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(Config::from_env()?);

    let level = config.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("starting flaketrack");
    if config.pipelines.is_empty() {
        warn!("no pipelines configured; the sync engine will idle");
    } else {
        info!("tracking {} pipelines", config.pipelines.len());
    }

    let pool = store::open_pool(&config.database_url, config.sqlite_max_connections).await?;
    store::init_schema(&pool).await?;

    let connector = Arc::new(AzDoConnector::new(
        &config.organization_url,
        &config.access_token,
    ));
    let orchestrator =
        SyncOrchestrator::new(pool.clone(), connector, SyncOptions::from_config(&config));

    if cli.once {
        orchestrator.run_cycle().await?;
        return Ok(());
    }

    let token = CancellationToken::new();
    let snapshot = Arc::new(SnapshotStore::new());
    let readiness = ReadinessGate::new();

    let backend = Arc::new(KustoClient::from_config(&config)?);
    let context = Arc::new(QueryContext::new(backend));
    let loader = Arc::new(DataLoader::new(
        context,
        snapshot.clone(),
        readiness.clone(),
        LoaderOptions::from_config(&config),
    ));

    // First load per configured mode: blocking failures abort start-up,
    // detached failures surface through the readiness gate.
    loader.clone().initial_load(&token).await?;

    let sync_task = tokio::spawn({
        let token = token.clone();
        async move { orchestrator.run(token).await }
    });

    let _loader_task = tokio::spawn({
        let token = token.clone();
        let readiness = readiness.clone();
        async move {
            match loader.run(token).await {
                Ok(()) => info!("data loader exited"),
                Err(e) => {
                    error!("data loader failed: {:#}", e);
                    readiness.set_failed(format!("{e:#}"));
                }
            }
        }
    });

    let state = AppState::new(config.clone(), pool, snapshot, readiness);
    let app = web::router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    info!("http surface listening on {}", config.bind_address());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            token.cancel();
        }
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!("server error: {}", e);
            }
            token.cancel();
        }
        result = sync_task => {
            token.cancel();
            match result {
                Ok(Ok(())) => info!("sync orchestrator exited"),
                Ok(Err(e)) => {
                    // No retry at this layer: surface the failure and let
                    // process supervision restart us.
                    error!("sync orchestrator failed: {:#}", e);
                    return Err(e);
                }
                Err(e) => error!("sync orchestrator panicked: {}", e),
            }
        }
    }

    Ok(())
}
