//! Persistence queue and batch writer.
//!
//! Single consumer of the persistence queue and sole owner of the store
//! handle.  Each wake drains a bounded batch, commits events one by one,
//! and requests a read-model refresh per successful insert.  A failed
//! insert is logged and skipped — no retry, no dead-letter (fire-and-forget
//! durability, matching the camera firmware's at-least-once redelivery).

use crate::config::PersistConfig;
use crate::storage::store::{CameraEvent, EventStore};
use crate::ui_events::{ConsoleUiEvent, UiSender};
use crate::ui_log::{UiLogLevel, UiLogger};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, sleep};
use tracing::{debug, info};

/// Batch writer loop.
///
/// Returns the store handle on exit so the shutdown path can close it
/// after both workers are joined.
pub async fn run_batch_writer(
    mut rx: mpsc::UnboundedReceiver<CameraEvent>,
    mut store: EventStore,
    cfg: PersistConfig,
    ui_tx: UiSender,
    logger: UiLogger,
    mut shutdown_rx: watch::Receiver<bool>,
) -> EventStore {
    loop {
        // Block until the queue is non-empty or stop is signaled.
        let first = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            maybe = rx.recv() => match maybe {
                None => break,
                Some(event) => event,
            },
        };

        let batch = drain_into_batch(&mut rx, first, cfg.batch_max_events);
        let drained = batch.len();
        let mut committed = 0usize;

        for event in batch {
            match store.insert_event(&event) {
                Ok(()) => {
                    committed += 1;
                    // Refresh is executed by the presentation loop, never here.
                    let _ = ui_tx.send(ConsoleUiEvent::RefreshCounts);
                }
                Err(e) => {
                    logger.log_at(
                        UiLogLevel::Warn,
                        format!("event for {} not journaled: {}", event.device_id, e),
                    );
                }
            }
        }

        debug!(drained, committed, "batch pass complete");

        // Pause between drain passes to bound write amplification from
        // bursty arrivals.
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = sleep(Duration::from_millis(cfg.flush_pause_ms)) => {}
        }
    }

    info!("batch writer stopping (shutdown)");
    store
}

/// Drain up to `max` events (including `first`) without waiting.
fn drain_into_batch(
    rx: &mut mpsc::UnboundedReceiver<CameraEvent>,
    first: CameraEvent,
    max: usize,
) -> Vec<CameraEvent> {
    let mut batch = vec![first];
    while batch.len() < max.max(1) {
        match rx.try_recv() {
            Ok(event) => batch.push(event),
            Err(_) => break,
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;
    use tokio::time::timeout;

    fn ev(device: &str, seq: u32) -> CameraEvent {
        CameraEvent {
            device_id: device.to_owned(),
            timestamp: format!("2026-08-06 10:{:02}:00", seq),
            artifact_ref: format!("/videos/{device}_{seq}.mp4"),
            viewed: false,
        }
    }

    fn test_cfg() -> PersistConfig {
        PersistConfig {
            batch_max_events: 10,
            flush_pause_ms: 5,
        }
    }

    #[test]
    fn drain_into_batch_is_bounded() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..25 {
            tx.send(ev("shed", i)).unwrap();
        }
        let first = rx.try_recv().unwrap();
        let batch = drain_into_batch(&mut rx, first, 10);
        assert_eq!(batch.len(), 10);
        assert_eq!(rx.len(), 15);
    }

    #[test]
    fn drain_into_batch_treats_zero_max_as_one() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(ev("shed", 1)).unwrap();
        let batch = drain_into_batch(&mut rx, ev("shed", 0), 0);
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn commits_all_queued_events() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ui_tx, _) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let store = EventStore::open_in_memory().unwrap();
        let logger = UiLogger::new(ui_tx.clone());

        for i in 0..25 {
            tx.send(ev("shed", i)).unwrap();
        }

        let writer = tokio::spawn(run_batch_writer(
            rx,
            store,
            test_cfg(),
            ui_tx,
            logger,
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        let store = timeout(Duration::from_secs(2), writer)
            .await
            .expect("writer shutdown timeout")
            .expect("writer join");

        assert_eq!(store.total_count().unwrap(), 25);
    }

    #[tokio::test]
    async fn failed_insert_does_not_abort_the_batch() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ui_tx, mut ui_rx) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let store = EventStore::open_in_memory().unwrap();
        let logger = UiLogger::new(ui_tx.clone());

        tx.send(ev("shed", 1)).unwrap();
        tx.send(ev("shed", 1)).unwrap(); // duplicate identity, insert fails
        tx.send(ev("shed", 2)).unwrap();

        let writer = tokio::spawn(run_batch_writer(
            rx,
            store,
            test_cfg(),
            ui_tx,
            logger,
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        let store = timeout(Duration::from_secs(2), writer)
            .await
            .expect("writer shutdown timeout")
            .expect("writer join");

        assert_eq!(store.total_count().unwrap(), 2);

        // One refresh request and one log entry per outcome: 2 commits, 1 failure.
        let mut refreshes = 0;
        let mut warn_entries = 0;
        while let Ok(event) = ui_rx.try_recv() {
            match event {
                ConsoleUiEvent::RefreshCounts => refreshes += 1,
                ConsoleUiEvent::LogEntry { .. } => warn_entries += 1,
                _ => {}
            }
        }
        assert_eq!(refreshes, 2);
        assert_eq!(warn_entries, 1);
    }

    #[tokio::test]
    async fn stop_unblocks_an_idle_writer() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let (ui_tx, _) = broadcast::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let store = EventStore::open_in_memory().unwrap();
        let logger = UiLogger::new(ui_tx.clone());

        let writer = tokio::spawn(run_batch_writer(
            rx,
            store,
            test_cfg(),
            ui_tx,
            logger,
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(1), writer)
            .await
            .expect("writer should stop promptly")
            .expect("writer join");
    }
}
