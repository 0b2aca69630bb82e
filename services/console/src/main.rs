// console: Camera event console client.
//
// Runtime event loop: wires together the event store, ingestion worker,
// batch writer, session manager, broker client, and shutdown coordinator.

use console::config::{CameraConfig, ConsoleConfig};
use console::ingest::{IngestQueue, IngestSinks, run_ingest};
use console::persist::run_batch_writer;
use console::pubsub::run_broker_loop;
use console::read_model::{EventCache, ReadModel};
use console::session::{ProcessFactory, SessionManager, run_session_manager};
use console::shutdown::{ShutdownCoordinator, WorkerHandles};
use console::storage::store::EventStore;
use console::ui_events::ConsoleUiEvent;
use console::ui_log::UiLogger;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Duration;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Topic filters this process subscribes to: the three camera channels for
/// every enabled camera, plus the control topic.
fn subscriptions_for(cameras: &[CameraConfig], control_topic: &str) -> Vec<String> {
    let mut topics = Vec::new();
    for camera in cameras.iter().filter(|c| c.enabled) {
        topics.push(format!("camera/{}/events", camera.id));
        topics.push(format!("camera/{}/status", camera.id));
        topics.push(format!("camera/{}/alert", camera.id));
    }
    topics.push(control_topic.to_owned());
    topics
}

/// Stand-in presentation loop.
///
/// A real GUI would observe the same broadcast channel on its own thread.
/// Read-model refreshes are executed here — on the presentation side —
/// never on the worker that requested them.
async fn run_presentation_loop(
    mut ui_rx: broadcast::Receiver<ConsoleUiEvent>,
    read_model: ReadModel,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
            event = ui_rx.recv() => match event {
                Ok(ConsoleUiEvent::RefreshCounts) => read_model.refresh(),
                Ok(ConsoleUiEvent::SessionStatus { text, connected }) => {
                    debug!(connected, "session status: {}", text);
                }
                Ok(ConsoleUiEvent::DeviceNotice { device, text }) => {
                    debug!(device = %device, "device notice: {}", text);
                }
                Ok(ConsoleUiEvent::LogEntry { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // A lagged UI observer just recomputes; counters are
                    // derived state, nothing is lost.
                    warn!(missed, "presentation loop lagged, refreshing");
                    read_model.refresh();
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber for structured logging to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "console starting");

    // Parse optional --config <path> argument.
    // Defaults to /etc/camwatch/console.toml when not supplied.
    let args: Vec<String> = std::env::args().collect();
    let config_path = match args.iter().position(|a| a == "--config") {
        Some(i) => match args.get(i + 1) {
            Some(p) => std::path::PathBuf::from(p),
            None => {
                eprintln!("FATAL: --config requires a path argument");
                std::process::exit(1);
            }
        },
        None => std::path::PathBuf::from("/etc/camwatch/console.toml"),
    };

    let cfg: ConsoleConfig = match console::config::load_config_from_path(&config_path) {
        Ok(cfg) => {
            info!(
                broker = %cfg.broker.url,
                cameras = cfg.cameras.len(),
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    // Open the event store.
    let store = match EventStore::open(std::path::Path::new(&cfg.store.sqlite_path)) {
        Ok(s) => {
            info!(path = %cfg.store.sqlite_path, "event store opened");
            s
        }
        Err(e) => {
            eprintln!("FATAL: failed to open event store: {}", e);
            std::process::exit(1);
        }
    };

    // Seed the in-memory cache and counters from the store.
    let cache = EventCache::new();
    match store.events_by_time_desc() {
        Ok(events) => {
            info!(events = events.len(), "event cache seeded");
            cache.seed(events);
        }
        Err(e) => {
            warn!(error = %e, "failed to seed event cache, starting empty");
        }
    }
    let read_model = ReadModel::new(cache.clone());
    read_model.refresh();

    // Channels.
    let (ui_tx, _) = broadcast::channel(256);
    let logger = UiLogger::new(ui_tx.clone());
    let (ingest_queue, ingest_rx) = IngestQueue::new();
    let (persist_tx, persist_rx) = mpsc::unbounded_channel();
    let (session_tx, session_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let (shutdown_request_tx, mut shutdown_request_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = watch::channel(false);

    // Presentation stand-in (executes read-model refreshes).
    tokio::spawn(run_presentation_loop(
        ui_tx.subscribe(),
        read_model.clone(),
        stop_rx.clone(),
    ));

    // Ingestion worker.
    let ingest_handle = tokio::spawn(run_ingest(
        ingest_rx,
        cfg.broker.control_topic.clone(),
        IngestSinks {
            cache: cache.clone(),
            persist_tx,
            session_tx: session_tx.clone(),
            status_tx: status_tx.clone(),
            shutdown_request_tx,
            ui_tx: ui_tx.clone(),
            logger: logger.clone(),
        },
        stop_rx.clone(),
    ));

    // Batch writer (sole owner of the store from here on).
    let writer_handle = tokio::spawn(run_batch_writer(
        persist_rx,
        store,
        cfg.persist.clone(),
        ui_tx.clone(),
        logger.clone(),
        stop_rx.clone(),
    ));

    // Session manager actor.
    let manager = SessionManager::new(
        Box::new(ProcessFactory),
        cfg.cameras.clone(),
        ui_tx.clone(),
        status_tx.clone(),
        logger.clone(),
        session_tx.clone(),
    );
    let session_handle = tokio::spawn(run_session_manager(manager, session_rx, stop_rx.clone()));

    // Broker loop.
    let subscriptions = subscriptions_for(&cfg.cameras, &cfg.broker.control_topic);
    let broker_handle = tokio::spawn(run_broker_loop(
        cfg.broker.clone(),
        subscriptions,
        ingest_queue,
        status_rx,
        logger.clone(),
        stop_rx.clone(),
    ));

    let coordinator = Arc::new(ShutdownCoordinator::new(
        stop_tx,
        Duration::from_secs(cfg.shutdown.deadline_secs),
        WorkerHandles {
            ingest: ingest_handle,
            writer: writer_handle,
            session_actor: session_handle,
            broker: broker_handle,
        },
    ));

    logger.log(format!(
        "console v{} initialized — all workers running",
        env!("CARGO_PKG_VERSION")
    ));

    // Wait for the first shutdown trigger: SIGINT, SIGTERM, or a control
    // topic request.
    #[cfg(unix)]
    let mut sigterm = {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("FATAL: failed to install SIGTERM handler: {}", e);
                std::process::exit(1);
            }
        }
    };

    #[cfg(unix)]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => logger.log("shutdown: SIGINT received"),
        _ = sigterm.recv() => logger.log("shutdown: SIGTERM received"),
        _ = shutdown_request_rx.recv() => logger.log("shutdown: requested via control topic"),
    }

    #[cfg(not(unix))]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => logger.log("shutdown: Ctrl-C received"),
        _ = shutdown_request_rx.recv() => logger.log("shutdown: requested via control topic"),
    }

    let graceful = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.shutdown().await })
    };

    // A second trigger while teardown runs forces immediate termination.
    #[cfg(unix)]
    tokio::select! {
        _ = graceful => {}
        _ = tokio::signal::ctrl_c() => coordinator.shutdown().await,
        _ = sigterm.recv() => coordinator.shutdown().await,
        _ = shutdown_request_rx.recv() => coordinator.shutdown().await,
    }

    #[cfg(not(unix))]
    tokio::select! {
        _ = graceful => {}
        _ = tokio::signal::ctrl_c() => coordinator.shutdown().await,
        _ = shutdown_request_rx.recv() => coordinator.shutdown().await,
    }

    info!("console stopped");
}
