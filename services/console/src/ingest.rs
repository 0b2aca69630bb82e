//! Event ingestion queue and worker.
//!
//! `IngestQueue::enqueue` is called from the broker delivery context and
//! must not block or parse — it only appends to the queue and wakes the
//! worker.  All classification and parsing happens on the worker task.
//!
//! Stop takes priority over draining: deliveries still queued when the stop
//! flag is observed are dropped, and the drop count is logged.

use crate::read_model::EventCache;
use crate::session::SessionCommand;
use crate::storage::store::CameraEvent;
use crate::ui_events::{ConsoleUiEvent, UiSender};
use crate::ui_log::{UiLogLevel, UiLogger};
use chrono::Local;
use cw_protocol::{ControlCommand, EventNotice, StatusNotice, TopicKind, classify_topic};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// A raw delivery handed over by the pub/sub client.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub payload: String,
}

/// Producer handle for the ingestion queue.
#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl IngestQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Append a delivery and wake the worker.  Never blocks.
    pub fn enqueue(&self, topic: impl Into<String>, payload: impl Into<String>) {
        let delivery = Delivery {
            topic: topic.into(),
            payload: payload.into(),
        };
        if self.tx.send(delivery).is_err() {
            debug!("ingest worker gone, delivery dropped");
        }
    }
}

/// Everything the ingestion worker hands classified messages to.
pub struct IngestSinks {
    pub cache: EventCache,
    pub persist_tx: mpsc::UnboundedSender<CameraEvent>,
    pub session_tx: mpsc::UnboundedSender<SessionCommand>,
    /// Status texts to republish on the broker's status topic.
    pub status_tx: mpsc::UnboundedSender<String>,
    /// Orderly-shutdown requests (control topic `shutdown` action).
    pub shutdown_request_tx: mpsc::UnboundedSender<()>,
    pub ui_tx: UiSender,
    pub logger: UiLogger,
}

/// Ingestion worker loop: drain the queue, classify, fan out.
pub async fn run_ingest(
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    control_topic: String,
    sinks: IngestSinks,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // Periodic wake used only for diagnostics, not for correctness.
    let mut diag = interval(Duration::from_secs(5));
    diag.set_missed_tick_behavior(MissedTickBehavior::Delay);
    diag.reset();

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let abandoned = rx.len();
                    if abandoned > 0 {
                        warn!(abandoned, "ingest worker stopping with queued deliveries");
                    } else {
                        info!("ingest worker stopping (shutdown)");
                    }
                    return;
                }
            }
            maybe = rx.recv() => {
                match maybe {
                    None => {
                        info!("ingest queue closed, worker stopping");
                        return;
                    }
                    Some(delivery) => process_delivery(delivery, &control_topic, &sinks),
                }
            }
            _ = diag.tick() => {
                debug!(pending = rx.len(), "ingest worker alive");
            }
        }
    }
}

fn process_delivery(delivery: Delivery, control_topic: &str, sinks: &IngestSinks) {
    match classify_topic(&delivery.topic, control_topic) {
        TopicKind::Event { device } => handle_event(&device, &delivery.payload, sinks),
        TopicKind::Status { device } => handle_notice(&device, &delivery.payload, false, sinks),
        TopicKind::Alert { device } => handle_notice(&device, &delivery.payload, true, sinks),
        TopicKind::Control => handle_control(&delivery.payload, sinks),
        TopicKind::Other => {
            debug!(topic = %delivery.topic, "ignoring unclassified topic");
        }
    }
}

fn handle_event(device: &str, payload: &str, sinks: &IngestSinks) {
    let notice: EventNotice = match serde_json::from_str(payload) {
        Ok(n) => n,
        Err(e) => {
            sinks.logger.log_at(
                UiLogLevel::Warn,
                format!("camera {} sent malformed event payload: {}", device, e),
            );
            return;
        }
    };

    let timestamp = if notice.timestamp.is_empty() {
        // Firmware omitted the stamp; use arrival time.
        Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
    } else {
        notice.timestamp
    };

    let event = CameraEvent {
        device_id: device.to_owned(),
        timestamp,
        artifact_ref: notice.video_path,
        viewed: notice.viewed,
    };

    debug!(
        device = %event.device_id,
        artifact = %event.artifact_ref,
        kind = %notice.event_type,
        "event accepted"
    );

    // Prepend to the cache first so the read model sees the event even if
    // the durable commit lags (or fails).
    sinks.cache.prepend(event.clone());
    if sinks.persist_tx.send(event).is_err() {
        warn!("persistence queue closed, event not journaled");
    }
}

fn handle_notice(device: &str, payload: &str, alert: bool, sinks: &IngestSinks) {
    // Status text is display-only; fall back to the raw payload when it is
    // not the structured notice shape.
    let text = match serde_json::from_str::<StatusNotice>(payload) {
        Ok(n) if !n.status.is_empty() => n.status,
        Ok(n) => n.notice_type,
        Err(_) => payload.trim().to_owned(),
    };
    let text = if alert {
        format!("alert: {}", text)
    } else {
        text
    };
    let _ = sinks.ui_tx.send(ConsoleUiEvent::DeviceNotice {
        device: device.to_owned(),
        text,
    });
}

fn handle_control(payload: &str, sinks: &IngestSinks) {
    let command: ControlCommand = match serde_json::from_str(payload) {
        Ok(c) => c,
        Err(e) => {
            sinks.logger.log_at(
                UiLogLevel::Warn,
                format!("malformed control command dropped: {}", e),
            );
            return;
        }
    };
    match command {
        ControlCommand::Connect { device } => {
            sinks.logger.log(format!("control: connect {}", device));
            let _ = sinks.session_tx.send(SessionCommand::Connect { device });
        }
        ControlCommand::Disconnect => {
            sinks.logger.log("control: disconnect");
            let _ = sinks.session_tx.send(SessionCommand::Disconnect);
        }
        ControlCommand::Shutdown => {
            sinks.logger.log("control: shutdown requested");
            let _ = sinks.shutdown_request_tx.send(());
        }
        ControlCommand::Ping => {
            let _ = sinks.status_tx.send("running".to_owned());
        }
    }
}
