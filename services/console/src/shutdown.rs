//! Shutdown coordinator.
//!
//! Drives orderly termination of the ingestion worker, batch writer,
//! session manager, and broker loop under one global deadline.  The first
//! `shutdown` call runs the graceful path; any call while teardown is
//! already in progress forces immediate termination instead of queueing a
//! second graceful attempt.  Deadline expiry also forces termination —
//! hanging past the deadline is the only failure here allowed to be fatal.
//!
//! The OS signal task holds the only `Arc` reference; there is no ambient
//! global state.

use crate::storage::store::EventStore;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tracing::{error, info, warn};

/// Called instead of returning when termination must be immediate.
/// Defaults to `std::process::exit`; injectable so tests can observe it.
pub type ExitHook = Box<dyn Fn(i32) + Send + Sync>;

/// Task handles collected at startup, consumed by the first shutdown pass.
pub struct WorkerHandles {
    pub ingest: JoinHandle<()>,
    /// The batch writer returns the store handle so it can be closed last.
    pub writer: JoinHandle<EventStore>,
    pub session_actor: JoinHandle<()>,
    pub broker: JoinHandle<()>,
}

pub struct ShutdownCoordinator {
    stop_tx: watch::Sender<bool>,
    deadline: Duration,
    in_progress: AtomicBool,
    handles: Mutex<Option<WorkerHandles>>,
    exit: ExitHook,
}

impl ShutdownCoordinator {
    pub fn new(stop_tx: watch::Sender<bool>, deadline: Duration, handles: WorkerHandles) -> Self {
        Self::with_exit_hook(
            stop_tx,
            deadline,
            handles,
            Box::new(|code| std::process::exit(code)),
        )
    }

    /// Construct with a custom exit hook (tests).
    pub fn with_exit_hook(
        stop_tx: watch::Sender<bool>,
        deadline: Duration,
        handles: WorkerHandles,
        exit: ExitHook,
    ) -> Self {
        Self {
            stop_tx,
            deadline,
            in_progress: AtomicBool::new(false),
            handles: Mutex::new(Some(handles)),
            exit,
        }
    }

    /// Whether a shutdown pass has started.
    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Run the shutdown sequence.
    ///
    /// Idempotent in the strong sense: the first call tears down, any
    /// overlapping or repeated call forces immediate termination.
    pub async fn shutdown(&self) {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            warn!("shutdown already in progress, forcing termination");
            (self.exit)(1);
            return;
        }

        info!("shutdown: signaling workers");
        let _ = self.stop_tx.send(true);

        let Some(handles) = self.handles.lock().unwrap().take() else {
            return;
        };

        // One global deadline over the whole teardown, not per worker.
        let result = timeout(self.deadline, async move {
            let store = match handles.writer.await {
                Ok(store) => Some(store),
                Err(e) => {
                    error!(error = %e, "batch writer join failed");
                    None
                }
            };
            if let Err(e) = handles.ingest.await {
                error!(error = %e, "ingest worker join failed");
            }
            // The session actor observes the stop flag, tears down any live
            // session, and exits.
            if let Err(e) = handles.session_actor.await {
                error!(error = %e, "session manager join failed");
            }
            // The broker loop publishes its goodbye and exits on the flag.
            if let Err(e) = handles.broker.await {
                error!(error = %e, "broker loop join failed");
            }
            // Close the store once nothing can write anymore.
            drop(store);
        })
        .await;

        if result.is_err() {
            error!(
                deadline_secs = self.deadline.as_secs(),
                "shutdown deadline elapsed, forcing termination"
            );
            (self.exit)(1);
            return;
        }

        info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Instant;

    /// Spawn a stand-in worker that returns once the stop flag flips.
    fn obedient_worker(mut rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
    }

    fn obedient_writer(mut rx: watch::Receiver<bool>) -> JoinHandle<EventStore> {
        tokio::spawn(async move {
            let store = EventStore::open_in_memory().unwrap();
            loop {
                if *rx.borrow() {
                    return store;
                }
                if rx.changed().await.is_err() {
                    return store;
                }
            }
        })
    }

    fn coordinator_with(
        stop_tx: watch::Sender<bool>,
        deadline: Duration,
        handles: WorkerHandles,
    ) -> (Arc<ShutdownCoordinator>, Arc<AtomicUsize>) {
        let exits = Arc::new(AtomicUsize::new(0));
        let hook_exits = exits.clone();
        let coordinator = Arc::new(ShutdownCoordinator::with_exit_hook(
            stop_tx,
            deadline,
            handles,
            Box::new(move |_code| {
                hook_exits.fetch_add(1, Ordering::SeqCst);
            }),
        ));
        (coordinator, exits)
    }

    fn handles_for(rx: &watch::Receiver<bool>) -> WorkerHandles {
        WorkerHandles {
            ingest: obedient_worker(rx.clone()),
            writer: obedient_writer(rx.clone()),
            session_actor: obedient_worker(rx.clone()),
            broker: obedient_worker(rx.clone()),
        }
    }

    #[tokio::test]
    async fn graceful_shutdown_completes_within_deadline() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handles = handles_for(&stop_rx);
        let (coordinator, exits) = coordinator_with(stop_tx, Duration::from_secs(5), handles);

        let started = Instant::now();
        coordinator.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(6));
        assert_eq!(exits.load(Ordering::SeqCst), 0, "graceful path must not exit");
        assert!(coordinator.in_progress());
    }

    #[tokio::test]
    async fn second_invocation_forces_termination() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handles = handles_for(&stop_rx);
        let (coordinator, exits) = coordinator_with(stop_tx, Duration::from_secs(5), handles);

        coordinator.shutdown().await;
        assert_eq!(exits.load(Ordering::SeqCst), 0);

        // Repeated trigger (e.g. a second interrupt) forces termination.
        coordinator.shutdown().await;
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_invocations_do_not_deadlock() {
        let (stop_tx, stop_rx) = watch::channel(false);
        // A sluggish writer keeps the first pass busy for a moment.
        let slow_writer: JoinHandle<EventStore> = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            EventStore::open_in_memory().unwrap()
        });
        let handles = WorkerHandles {
            ingest: obedient_worker(stop_rx.clone()),
            writer: slow_writer,
            session_actor: obedient_worker(stop_rx.clone()),
            broker: obedient_worker(stop_rx.clone()),
        };
        let (coordinator, exits) = coordinator_with(stop_tx, Duration::from_secs(5), handles);

        let first = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Second trigger while teardown is running: forced, returns at once.
        let started = Instant::now();
        coordinator.shutdown().await;
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(exits.load(Ordering::SeqCst), 1);

        tokio::time::timeout(Duration::from_secs(2), first)
            .await
            .expect("first shutdown must still complete")
            .expect("join");
    }

    #[tokio::test]
    async fn deadline_expiry_forces_termination() {
        let (stop_tx, stop_rx) = watch::channel(false);
        // A worker that ignores the stop flag entirely.
        let stuck: JoinHandle<EventStore> = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            EventStore::open_in_memory().unwrap()
        });
        let handles = WorkerHandles {
            ingest: obedient_worker(stop_rx.clone()),
            writer: stuck,
            session_actor: obedient_worker(stop_rx.clone()),
            broker: obedient_worker(stop_rx.clone()),
        };
        let (coordinator, exits) =
            coordinator_with(stop_tx, Duration::from_millis(200), handles);

        let started = Instant::now();
        coordinator.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(exits.load(Ordering::SeqCst), 1, "deadline must force exit");
    }
}
