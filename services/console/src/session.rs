//! Connection session manager.
//!
//! Owns at most one live stream session.  `connect` tears down any existing
//! session first, then tries the device's candidate strategies in config
//! order, stopping at the first that reaches the active state.  Candidate
//! strategies are data ([`crate::config::CandidateConfig`]); adding one
//! never adds control flow here.
//!
//! The manager runs as a single actor task consuming [`SessionCommand`]s,
//! which serializes connect/disconnect requests from the UI and the control
//! topic.  A fatal asynchronous error from the active connection arrives as
//! a `Fault` command tagged with the session sequence number, so a stale
//! fault from an already-replaced session is ignored.  No automatic retry
//! is performed — reconnecting is the caller's decision.

use crate::config::{CameraConfig, CandidateConfig};
use crate::ui_events::{ConsoleUiEvent, UiSender};
use crate::ui_log::{UiLogLevel, UiLogger};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Connection capability
// ---------------------------------------------------------------------------

/// Error from a single connection attempt stage.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("construct: {0}")]
    Construct(String),
    #[error("ready: {0}")]
    Ready(String),
    #[error("active: {0}")]
    Active(String),
}

/// Handle to a display surface extracted from a connection.
///
/// The presentation layer may re-skin any surface returned here; when a
/// candidate has no embeddable sink the manager degrades to a placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplaySurface {
    pub sink: String,
    pub placeholder: bool,
}

impl DisplaySurface {
    pub fn placeholder() -> Self {
        Self {
            sink: String::new(),
            placeholder: true,
        }
    }
}

/// An opaque media connection in the hands of the session manager.
///
/// Lifecycle: `set_ready` → `set_active` → (`stop`).  A failure at any
/// stage discards the connection and the manager moves to the next
/// candidate.
pub trait StreamConnection: Send {
    fn set_ready(&mut self) -> Result<(), PipelineError>;
    fn set_active(&mut self) -> Result<(), PipelineError>;
    /// Stop the connection and wait for the stop to complete.
    fn stop(&mut self);
    /// Best-effort surface extraction; `None` degrades to a placeholder.
    fn extract_display_surface(&mut self) -> Option<DisplaySurface>;
    /// One-shot signal fired on a fatal asynchronous error.  Taken once,
    /// after activation; connections without async fault reporting return
    /// `None`.
    fn take_fault_signal(&mut self) -> Option<oneshot::Receiver<String>> {
        None
    }
}

/// Builds connections from candidate descriptors.
pub trait ConnectionFactory: Send {
    fn construct(
        &self,
        candidate: &CandidateConfig,
    ) -> Result<Box<dyn StreamConnection>, PipelineError>;
}

// ---------------------------------------------------------------------------
// Process-backed connection (default factory)
// ---------------------------------------------------------------------------

/// Factory spawning the candidate's launch text as a child process.
///
/// The launch text is split on whitespace into argv; the child runs the
/// actual media pipeline (ffmpeg or similar) and its exit is the fault
/// signal.
pub struct ProcessFactory;

impl ConnectionFactory for ProcessFactory {
    fn construct(
        &self,
        candidate: &CandidateConfig,
    ) -> Result<Box<dyn StreamConnection>, PipelineError> {
        let argv: Vec<String> = candidate
            .launch
            .split_whitespace()
            .map(str::to_owned)
            .collect();
        if argv.is_empty() {
            return Err(PipelineError::Construct("empty launch text".to_owned()));
        }
        Ok(Box::new(ProcessConnection {
            argv,
            sink: candidate.sink.clone(),
            child: Arc::new(Mutex::new(None)),
            watcher_armed: false,
        }))
    }
}

struct ProcessConnection {
    argv: Vec<String>,
    sink: String,
    child: Arc<Mutex<Option<std::process::Child>>>,
    watcher_armed: bool,
}

impl StreamConnection for ProcessConnection {
    fn set_ready(&mut self) -> Result<(), PipelineError> {
        let mut cmd = std::process::Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        let spawned = cmd
            .spawn()
            .map_err(|e| PipelineError::Ready(format!("spawn '{}': {}", self.argv[0], e)))?;
        *self.child.lock().unwrap() = Some(spawned);
        Ok(())
    }

    fn set_active(&mut self) -> Result<(), PipelineError> {
        let mut guard = self.child.lock().unwrap();
        let Some(child) = guard.as_mut() else {
            return Err(PipelineError::Active("pipeline was never ready".to_owned()));
        };
        match child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(PipelineError::Active(format!(
                "pipeline exited during startup: {}",
                status
            ))),
            Err(e) => Err(PipelineError::Active(e.to_string())),
        }
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.lock().unwrap().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn extract_display_surface(&mut self) -> Option<DisplaySurface> {
        if self.sink.is_empty() {
            None
        } else {
            Some(DisplaySurface {
                sink: self.sink.clone(),
                placeholder: false,
            })
        }
    }

    fn take_fault_signal(&mut self) -> Option<oneshot::Receiver<String>> {
        if self.watcher_armed {
            return None;
        }
        self.watcher_armed = true;
        let (tx, rx) = oneshot::channel();
        let child = Arc::clone(&self.child);
        // Polling watcher: `Child::wait` would need exclusive ownership and
        // block `stop`; try_wait under the shared lock keeps both paths live.
        std::thread::spawn(move || {
            let reason = loop {
                std::thread::sleep(std::time::Duration::from_millis(200));
                let mut guard = child.lock().unwrap();
                match guard.as_mut() {
                    // Stopped by the manager; nothing to report.
                    None => return,
                    Some(c) => match c.try_wait() {
                        Ok(Some(status)) => break format!("pipeline exited: {}", status),
                        Ok(None) => {}
                        Err(e) => break format!("pipeline wait failed: {}", e),
                    },
                }
            };
            let _ = tx.send(reason);
        });
        Some(rx)
    }
}

// ---------------------------------------------------------------------------
// Session manager
// ---------------------------------------------------------------------------

/// Commands consumed by the session manager actor.
#[derive(Debug)]
pub enum SessionCommand {
    Connect { device: String },
    Disconnect,
    /// Internal: fatal asynchronous error from the active connection.
    Fault { session_seq: u64, reason: String },
}

/// Why `connect` returned without an installed session.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
    #[error("device '{0}' is disabled")]
    DeviceDisabled(String),
    #[error("all {attempts} candidates failed for '{device}'")]
    Exhausted { device: String, attempts: usize },
}

struct ActiveSession {
    device_id: String,
    strategy_index: usize,
    connection: Box<dyn StreamConnection>,
    surface: DisplaySurface,
    seq: u64,
}

pub struct SessionManager {
    factory: Box<dyn ConnectionFactory>,
    cameras: HashMap<String, CameraConfig>,
    ui_tx: UiSender,
    /// Status texts republished on the broker's status topic.
    status_tx: mpsc::UnboundedSender<String>,
    logger: UiLogger,
    /// Own command sender, used to route fault signals back into the actor.
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    session: Option<ActiveSession>,
    next_seq: u64,
}

impl SessionManager {
    pub fn new(
        factory: Box<dyn ConnectionFactory>,
        cameras: Vec<CameraConfig>,
        ui_tx: UiSender,
        status_tx: mpsc::UnboundedSender<String>,
        logger: UiLogger,
        cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    ) -> Self {
        Self {
            factory,
            cameras: cameras.into_iter().map(|c| (c.id.clone(), c)).collect(),
            ui_tx,
            status_tx,
            logger,
            cmd_tx,
            session: None,
            next_seq: 0,
        }
    }

    /// The active (device_id, strategy_index), if a session is installed.
    pub fn active(&self) -> Option<(&str, usize)> {
        self.session
            .as_ref()
            .map(|s| (s.device_id.as_str(), s.strategy_index))
    }

    /// The active session's surface, if any.
    pub fn surface(&self) -> Option<&DisplaySurface> {
        self.session.as_ref().map(|s| &s.surface)
    }

    /// Sequence number of the active session (fault routing).
    pub fn current_seq(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.seq)
    }

    pub fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect { device } => {
                if let Err(e) = self.connect(&device) {
                    debug!(device = %device, error = %e, "connect request failed");
                }
            }
            SessionCommand::Disconnect => self.disconnect(),
            SessionCommand::Fault {
                session_seq,
                reason,
            } => self.handle_fault(session_seq, &reason),
        }
    }

    /// Connect the stream for `device_id`, trying candidates in order.
    ///
    /// Returns the zero-based index of the winning candidate.  On failure no
    /// session is installed; individual candidate failures are logged and
    /// only exhaustion surfaces as a status update.
    pub fn connect(&mut self, device_id: &str) -> Result<usize, ConnectError> {
        // Never two live sessions: tear down before trying anything.
        self.disconnect();

        let Some(camera) = self.cameras.get(device_id).cloned() else {
            self.logger.log_at(
                UiLogLevel::Warn,
                format!("connect requested for unknown device '{}'", device_id),
            );
            return Err(ConnectError::UnknownDevice(device_id.to_owned()));
        };
        if !camera.enabled {
            self.logger
                .log(format!("camera '{}' is disabled, not connecting", camera.name));
            return Err(ConnectError::DeviceDisabled(device_id.to_owned()));
        }

        self.announce(format!("Connecting to {}...", camera.name), false);

        for (index, candidate) in camera.candidates.iter().enumerate() {
            match self.try_candidate(candidate) {
                Ok((connection, surface, fault)) => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    if let Some(fault_rx) = fault {
                        let cmd_tx = self.cmd_tx.clone();
                        tokio::spawn(async move {
                            if let Ok(reason) = fault_rx.await {
                                let _ = cmd_tx.send(SessionCommand::Fault {
                                    session_seq: seq,
                                    reason,
                                });
                            }
                        });
                    }
                    info!(
                        device = %camera.id,
                        strategy = index,
                        sink = %surface.sink,
                        "session active"
                    );
                    self.session = Some(ActiveSession {
                        device_id: camera.id.clone(),
                        strategy_index: index,
                        connection,
                        surface,
                        seq,
                    });
                    self.announce(format!("Connected to {}", camera.name), true);
                    return Ok(index);
                }
                Err(e) => {
                    // Not user-visible until every candidate has failed.
                    warn!(
                        device = %camera.id,
                        strategy = index,
                        error = %e,
                        "candidate failed, trying next"
                    );
                }
            }
        }

        let attempts = camera.candidates.len();
        self.announce(format!("Connection failed: {}", camera.name), false);
        Err(ConnectError::Exhausted {
            device: device_id.to_owned(),
            attempts,
        })
    }

    /// Tear down the active session, if any.  No-op when idle.
    pub fn disconnect(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        info!(device = %session.device_id, "stopping session");
        // Waits for the stop to complete; the surface is released with the
        // session struct.
        session.connection.stop();
        self.announce("Disconnected", false);
    }

    fn try_candidate(
        &mut self,
        candidate: &CandidateConfig,
    ) -> Result<
        (
            Box<dyn StreamConnection>,
            DisplaySurface,
            Option<oneshot::Receiver<String>>,
        ),
        PipelineError,
    > {
        let mut connection = self.factory.construct(candidate)?;
        connection.set_ready()?;
        // Best-effort; a candidate without an embeddable sink still wins.
        let surface = connection
            .extract_display_surface()
            .unwrap_or_else(DisplaySurface::placeholder);
        if let Err(e) = connection.set_active() {
            connection.stop();
            return Err(e);
        }
        let fault = connection.take_fault_signal();
        Ok((connection, surface, fault))
    }

    /// A fatal asynchronous error arrived from a connection.
    ///
    /// Treated as a spontaneous disconnect; stale signals from replaced
    /// sessions are ignored.
    pub fn handle_fault(&mut self, session_seq: u64, reason: &str) {
        match &self.session {
            Some(s) if s.seq == session_seq => {}
            _ => {
                debug!(session_seq, "ignoring fault for replaced session");
                return;
            }
        }
        let mut session = self.session.take().expect("checked above");
        warn!(device = %session.device_id, reason, "session fault");
        session.connection.stop();
        self.announce(format!("Stream error: {}", reason), false);
    }

    fn announce(&self, text: impl Into<String>, connected: bool) {
        let text = text.into();
        let _ = self.ui_tx.send(ConsoleUiEvent::SessionStatus {
            text: text.clone(),
            connected,
        });
        let _ = self.status_tx.send(text);
    }
}

/// Session manager actor loop.
pub async fn run_session_manager(
    mut manager: SessionManager,
    mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            maybe = cmd_rx.recv() => match maybe {
                None => break,
                Some(command) => manager.handle_command(command),
            }
        }
    }
    // Tear down any live session before exiting.
    manager.disconnect();
    info!("session manager stopping (shutdown)");
}
