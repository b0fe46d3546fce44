//! Mobile Supervisor - cell/location telemetry ingestion service
//!
//! # Usage
//!
//! ```bash
//! # Run with broker credentials from the environment (or .env)
//! MQTT_HOST=broker.example.com MQTT_USER=svc MQTT_PASS=... cargo run --release
//!
//! # Serve history and status only, without connecting to the broker
//! cargo run --release -- --no-ingest
//!
//! # Load tower metadata into the station tree
//! cargo run --release -- import-stations --file stations.json
//! ```
//!
//! # Environment Variables
//!
//! - `SUPERVISOR_CONFIG`: Path to the TOML config file (default: ./supervisor.toml)
//! - `MQTT_HOST`, `MQTT_PORT`, `MQTT_USER`, `MQTT_PASS`: Broker connection
//! - `SUPERVISOR_ADDR`: HTTP bind address (default: 0.0.0.0:3000)
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mobile_supervisor::acquisition::{self, ControlPublisher, TransportStatus};
use mobile_supervisor::api::{create_app, ApiState};
use mobile_supervisor::config::{self, defaults, SupervisorConfig};
use mobile_supervisor::pipeline::{
    work_queue, BackpressureController, DrainWorker, IngestListener, PipelineStats,
};
use mobile_supervisor::reconcile::ReconcilerHub;
use mobile_supervisor::storage::SledStore;
use mobile_supervisor::types::Station;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "mobile-supervisor")]
#[command(about = "Cell/location telemetry ingestion and position reconciliation")]
#[command(version)]
struct CliArgs {
    /// Path to a supervisor TOML config (overrides SUPERVISOR_CONFIG)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the server address (default: "0.0.0.0:3000")
    #[arg(short, long)]
    addr: Option<String>,

    /// Do not connect to the broker even when credentials are present
    #[arg(long)]
    no_ingest: bool,

    #[command(subcommand)]
    command: Option<SubCommand>,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Load a JSON array of station records into the station tree
    ImportStations {
        /// Path to the JSON file
        #[arg(long)]
        file: PathBuf,
    },
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    HttpServer,
    ReconcilerHub,
    MqttTransport,
    IngestListener,
    DrainWorker,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::HttpServer => write!(f, "HttpServer"),
            TaskName::ReconcilerHub => write!(f, "ReconcilerHub"),
            TaskName::MqttTransport => write!(f, "MqttTransport"),
            TaskName::IngestListener => write!(f, "IngestListener"),
            TaskName::DrainWorker => write!(f, "DrainWorker"),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

fn load_config(args: &CliArgs) -> Result<SupervisorConfig> {
    let mut supervisor_config = match &args.config {
        Some(path) => {
            let mut loaded = SupervisorConfig::load_from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            loaded.apply_env_overrides();
            loaded
        }
        None => SupervisorConfig::load(),
    };

    if let Some(addr) = &args.addr {
        supervisor_config.server.addr = addr.clone();
    }

    supervisor_config
        .validate()
        .context("Invalid supervisor configuration")?;
    Ok(supervisor_config)
}

// ============================================================================
// Station Import
// ============================================================================

fn import_stations(file: &PathBuf, store: &SledStore) -> Result<()> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let stations: Vec<Station> = serde_json::from_str(&contents)
        .with_context(|| format!("{} is not a JSON array of stations", file.display()))?;

    let written = store.upsert_stations(&stations)?;
    let (_, _, total) = store.counts();
    info!(written, total, "Station import complete");
    Ok(())
}

// ============================================================================
// Task Spawning
// ============================================================================

/// Spawn the HTTP server task into the JoinSet.
fn spawn_http_server(
    task_set: &mut JoinSet<Result<TaskName>>,
    listener: tokio::net::TcpListener,
    app: axum::Router,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        info!("[HttpServer] Task starting");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                info!("[HttpServer] Received shutdown signal");
            })
            .await;

        match result {
            Ok(()) => {
                info!("[HttpServer] Graceful shutdown complete");
                Ok(TaskName::HttpServer)
            }
            Err(e) => {
                error!("[HttpServer] Server error: {}", e);
                Err(anyhow::anyhow!("HTTP server error: {}", e))
            }
        }
    });
}

/// Wire transport → listener → queue → drain worker and spawn each stage.
///
/// Returns the publisher and transport status for the API.
fn spawn_ingest(
    task_set: &mut JoinSet<Result<TaskName>>,
    supervisor_config: &SupervisorConfig,
    store: Arc<SledStore>,
    stats: Arc<PipelineStats>,
    reconciler: mobile_supervisor::ReconcilerHandle,
    cancel_token: &CancellationToken,
) -> Option<(Arc<dyn ControlPublisher>, Arc<TransportStatus>)> {
    let Some(credentials) = supervisor_config.mqtt.credentials() else {
        warn!("MQTT_HOST / MQTT_USER / MQTT_PASS not set: running without ingestion");
        return None;
    };

    let (transport, publisher) = acquisition::connect(&supervisor_config.mqtt, credentials);
    let status = transport.status();
    let publisher: Arc<dyn ControlPublisher> = Arc::new(publisher);

    let ingest = &supervisor_config.ingest;
    let (inbox_tx, inbox_rx) = mpsc::channel(ingest.inbox_capacity);
    let (queue_tx, queue_rx) = work_queue(ingest.queue_capacity, ingest.overflow_policy);

    let listener = IngestListener::new(
        queue_tx,
        BackpressureController::new(&supervisor_config.backpressure),
        Arc::clone(&publisher),
        Arc::clone(&stats),
    )
    .with_reconciler(reconciler)
    .with_topic_filter(supervisor_config.mqtt.telemetry_topic.clone());
    let drain = DrainWorker::new(queue_rx, store, stats);

    let cancel = cancel_token.clone();
    task_set.spawn(async move {
        transport.run(inbox_tx, cancel).await;
        Ok(TaskName::MqttTransport)
    });

    let cancel = cancel_token.clone();
    task_set.spawn(async move {
        listener.run(inbox_rx, cancel).await;
        Ok(TaskName::IngestListener)
    });

    let cancel = cancel_token.clone();
    task_set.spawn(async move {
        drain.run(cancel).await;
        Ok(TaskName::DrainWorker)
    });

    info!(
        queue_capacity = ingest.queue_capacity,
        overflow_policy = ?ingest.overflow_policy,
        "Ingestion pipeline started"
    );
    Some((publisher, status))
}

/// Run the supervisor loop: monitor tasks, cancel on failure.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("Supervisor: all tasks spawned, monitoring");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("Supervisor: shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("Supervisor: task {} completed", task_name);
                    }
                    Some(Ok(Err(e))) => {
                        error!("Supervisor: task failed with error: {}", e);
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!("Supervisor: task panicked: {}", e);
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => {
                        info!("Supervisor: all tasks completed");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    let supervisor_config = load_config(&args)?;
    config::init(supervisor_config);
    let cfg = config::get();

    let store = Arc::new(
        SledStore::open(&cfg.storage.db_path)
            .with_context(|| format!("Failed to open {}", cfg.storage.db_path.display()))?,
    );

    if let Some(SubCommand::ImportStations { file }) = &args.command {
        import_stations(file, &store)?;
        store.flush()?;
        return Ok(());
    }

    let (locations, cells, stations) = store.counts();
    info!(
        db = %cfg.storage.db_path.display(),
        locations, cells, stations,
        "Sample store opened"
    );

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    let stats = Arc::new(PipelineStats::new(cfg.backpressure.baseline_interval_secs));
    let (hub, reconciler) = ReconcilerHub::new(
        cfg.reconciler.clone(),
        store.clone(),
        Arc::clone(&stats),
        defaults::RECONCILER_INBOX_CAPACITY,
        defaults::OBSERVER_CHANNEL_CAPACITY,
    );

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    let hub_cancel = cancel_token.clone();
    task_set.spawn(async move {
        hub.run(hub_cancel).await;
        Ok(TaskName::ReconcilerHub)
    });

    let ingest = if args.no_ingest {
        info!("Ingestion disabled by --no-ingest");
        None
    } else {
        spawn_ingest(
            &mut task_set,
            cfg,
            store.clone(),
            Arc::clone(&stats),
            reconciler.clone(),
            &cancel_token,
        )
    };
    let (publisher, transport) = match ingest {
        Some((publisher, status)) => (Some(publisher), Some(status)),
        None => (None, None),
    };

    let state = ApiState {
        stats,
        reconciler,
        history: store.clone(),
        stations: store.clone(),
        publisher,
        transport,
        started_at: Utc::now(),
    };
    let app = create_app(state, &cfg.server.cors_origins);

    let listener = tokio::net::TcpListener::bind(&cfg.server.addr)
        .await
        .with_context(|| format!("Failed to bind to {}", cfg.server.addr))?;
    info!("HTTP server listening on {}", cfg.server.addr);
    spawn_http_server(&mut task_set, listener, app, cancel_token.clone());

    let outcome = run_supervisor(&mut task_set, cancel_token.clone()).await;

    // Let every stage observe cancellation before the final flush.
    cancel_token.cancel();
    while let Some(result) = task_set.join_next().await {
        match result {
            Ok(Ok(task_name)) => info!("Task {} stopped", task_name),
            Ok(Err(e)) => warn!("Task stopped with error: {}", e),
            Err(e) => warn!("Task panicked during shutdown: {}", e),
        }
    }

    if let Err(e) = store.flush() {
        warn!(error = %e, "Final store flush failed");
    }

    info!("Mobile Supervisor shutdown complete");
    outcome
}
