//! Console configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/camwatch/console.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `broker.url`
//! - At least one `[[cameras]]` entry, each with at least one
//!   `[[cameras.candidates]]` connection strategy
//!
//! Candidate order is preference order: the session manager tries them
//! top to bottom and stops at the first that reaches the active state.

use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level console configuration.
#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    pub schema_version: u32,
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub persist: PersistConfig,
    pub shutdown: ShutdownConfig,
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// WebSocket URL of the broker endpoint, e.g. `ws://10.0.4.40:1883/ws`.
    pub url: String,
    /// Advisory client identity; a random one is generated when empty.
    pub client_id: String,
    /// Topic this process publishes its status updates to.
    pub status_topic: String,
    /// Topic filter for control commands addressed to this process.
    pub control_topic: String,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub sqlite_path: String,
}

#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Max events committed per drain pass.
    pub batch_max_events: usize,
    /// Pause between drain passes, bounding write amplification.
    pub flush_pause_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Overall graceful-teardown deadline before forced termination.
    pub deadline_secs: u64,
}

#[derive(Debug, Clone)]
pub struct CameraConfig {
    /// Device identifier, matching the `camera/<id>/...` topic segment.
    pub id: String,
    /// Human-readable name for status lines.
    pub name: String,
    pub enabled: bool,
    /// Ordered connection strategies, most robust first.
    pub candidates: Vec<CandidateConfig>,
}

/// One candidate connection strategy.
#[derive(Debug, Clone)]
pub struct CandidateConfig {
    /// Opaque pipeline/launch text handed to the connection factory.
    pub launch: String,
    /// Sink marker used to extract a display surface; empty means the
    /// candidate renders externally and the UI shows a placeholder.
    pub sink: String,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    broker: Option<RawBrokerConfig>,
    store: Option<RawStoreConfig>,
    persist: Option<RawPersistConfig>,
    shutdown: Option<RawShutdownConfig>,
    cameras: Option<Vec<RawCameraConfig>>,
}

#[derive(Debug, Deserialize)]
struct RawBrokerConfig {
    url: Option<String>,
    client_id: Option<String>,
    status_topic: Option<String>,
    control_topic: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStoreConfig {
    sqlite_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPersistConfig {
    batch_max_events: Option<usize>,
    flush_pause_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawShutdownConfig {
    deadline_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawCameraConfig {
    id: Option<String>,
    name: Option<String>,
    enabled: Option<bool>,
    candidates: Option<Vec<RawCandidateConfig>>,
}

#[derive(Debug, Deserialize)]
struct RawCandidateConfig {
    launch: Option<String>,
    sink: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load console config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<ConsoleConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load console config from the default path `/etc/camwatch/console.toml`.
pub fn load_config() -> Result<ConsoleConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/camwatch/console.toml"))
}

/// Load console config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<ConsoleConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    // Validate schema_version
    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    // Validate broker
    let raw_broker = raw
        .broker
        .ok_or_else(|| ConfigError::MissingField("broker".to_owned()))?;
    let url = raw_broker
        .url
        .ok_or_else(|| ConfigError::MissingField("broker.url".to_owned()))?;
    let broker = BrokerConfig {
        url,
        client_id: raw_broker.client_id.unwrap_or_default(),
        status_topic: raw_broker
            .status_topic
            .unwrap_or_else(|| "console/status".to_owned()),
        control_topic: raw_broker
            .control_topic
            .unwrap_or_else(|| "console/control".to_owned()),
    };

    // Store defaults
    let store = StoreConfig {
        sqlite_path: raw
            .store
            .and_then(|s| s.sqlite_path)
            .unwrap_or_else(|| "/var/lib/camwatch/events.sqlite3".to_owned()),
    };

    // Persist defaults
    let persist = match raw.persist {
        Some(p) => PersistConfig {
            batch_max_events: p.batch_max_events.unwrap_or(10),
            flush_pause_ms: p.flush_pause_ms.unwrap_or(100),
        },
        None => PersistConfig {
            batch_max_events: 10,
            flush_pause_ms: 100,
        },
    };
    if persist.batch_max_events == 0 {
        return Err(ConfigError::InvalidValue(
            "persist.batch_max_events must be at least 1".to_owned(),
        ));
    }

    // Shutdown defaults
    let shutdown = ShutdownConfig {
        deadline_secs: raw.shutdown.and_then(|s| s.deadline_secs).unwrap_or(5),
    };

    // Validate cameras
    let raw_cameras = raw
        .cameras
        .ok_or_else(|| ConfigError::MissingField("cameras".to_owned()))?;
    if raw_cameras.is_empty() {
        return Err(ConfigError::InvalidValue(
            "at least one [[cameras]] entry is required".to_owned(),
        ));
    }
    let mut cameras = Vec::with_capacity(raw_cameras.len());
    for (i, c) in raw_cameras.into_iter().enumerate() {
        let id = c
            .id
            .ok_or_else(|| ConfigError::MissingField(format!("cameras[{}].id", i)))?;
        let raw_candidates = c
            .candidates
            .ok_or_else(|| ConfigError::MissingField(format!("cameras[{}].candidates", i)))?;
        if raw_candidates.is_empty() {
            return Err(ConfigError::InvalidValue(format!(
                "cameras[{}] ('{}') needs at least one candidate",
                i, id
            )));
        }
        let mut candidates = Vec::with_capacity(raw_candidates.len());
        for (j, cand) in raw_candidates.into_iter().enumerate() {
            let launch = cand.launch.ok_or_else(|| {
                ConfigError::MissingField(format!("cameras[{}].candidates[{}].launch", i, j))
            })?;
            candidates.push(CandidateConfig {
                launch,
                sink: cand.sink.unwrap_or_default(),
            });
        }
        cameras.push(CameraConfig {
            name: c.name.unwrap_or_else(|| id.clone()),
            id,
            enabled: c.enabled.unwrap_or(true),
            candidates,
        });
    }

    Ok(ConsoleConfig {
        schema_version,
        broker,
        store,
        persist,
        shutdown,
        cameras,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        schema_version = 1

        [broker]
        url = "ws://10.0.4.40:1883/ws"

        [[cameras]]
        id = "shed"

        [[cameras.candidates]]
        launch = "ffmpeg -i rtsp://10.0.4.67:8554/stream1 -f rawvideo -"
        sink = "embedded"
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = load_config_from_str(MINIMAL).unwrap();
        assert_eq!(cfg.broker.status_topic, "console/status");
        assert_eq!(cfg.broker.control_topic, "console/control");
        assert_eq!(cfg.persist.batch_max_events, 10);
        assert_eq!(cfg.persist.flush_pause_ms, 100);
        assert_eq!(cfg.shutdown.deadline_secs, 5);
        assert_eq!(cfg.cameras.len(), 1);
        assert!(cfg.cameras[0].enabled);
        assert_eq!(cfg.cameras[0].name, "shed");
    }

    #[test]
    fn missing_schema_version_is_rejected() {
        let result = load_config_from_str("[broker]\nurl = \"ws://x\"\n");
        assert!(matches!(result, Err(ConfigError::MissingField(f)) if f == "schema_version"));
    }

    #[test]
    fn wrong_schema_version_is_rejected() {
        let result = load_config_from_str("schema_version = 2\n");
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn missing_broker_url_is_rejected() {
        let toml = "schema_version = 1\n[broker]\n";
        let result = load_config_from_str(toml);
        assert!(matches!(result, Err(ConfigError::MissingField(f)) if f == "broker.url"));
    }

    #[test]
    fn camera_without_candidates_is_rejected() {
        let toml = r#"
            schema_version = 1
            [broker]
            url = "ws://x"
            [[cameras]]
            id = "shed"
            candidates = []
        "#;
        let result = load_config_from_str(toml);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let toml = r#"
            schema_version = 1
            [broker]
            url = "ws://x"
            [persist]
            batch_max_events = 0
            [[cameras]]
            id = "shed"
            [[cameras.candidates]]
            launch = "x"
        "#;
        let result = load_config_from_str(toml);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn candidate_order_is_preserved() {
        let toml = r#"
            schema_version = 1
            [broker]
            url = "ws://x"
            [[cameras]]
            id = "shed"
            [[cameras.candidates]]
            launch = "primary"
            sink = "embedded"
            [[cameras.candidates]]
            launch = "fallback"
        "#;
        let cfg = load_config_from_str(toml).unwrap();
        let cands = &cfg.cameras[0].candidates;
        assert_eq!(cands.len(), 2);
        assert_eq!(cands[0].launch, "primary");
        assert_eq!(cands[1].launch, "fallback");
        assert!(cands[1].sink.is_empty());
    }
}
