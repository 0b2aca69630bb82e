// cw-protocol: Camwatch broker protocol types and serialization.
//
// All broker frames use a top-level `kind` field for discriminated
// deserialization.  Payloads are carried as opaque JSON text; the payload
// schemas further down are parsed only at the ingestion boundary, where a
// malformed payload is dropped rather than failing the transport.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Broker frames
// ---------------------------------------------------------------------------

/// Client hello message, sent as the first frame after connecting.
///
/// `subscriptions` is a list of topic filters (see [`topic_matches`]); the
/// broker begins delivering matching publishes as soon as the session is
/// granted.  Does NOT carry `session_id` -- the session_id is assigned by
/// the broker and returned in the first `heartbeat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    /// Advisory identity for this client process.
    pub client_id: String,
    /// Topic filters to deliver to this session.
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

/// Heartbeat message (broker -> client).
///
/// The *initial* broker heartbeat grants the session: it carries the
/// assigned `session_id` together with the resolved `client_id`.  Later
/// heartbeats are keepalives and may be ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub session_id: String,
    pub client_id: String,
}

/// A published message, in either direction.
///
/// `acked = true` requests at-least-once delivery: the receiving side must
/// answer with a [`PubAck`] for `message_id` once the message is safely
/// handed off.  `acked = false` is fire-and-forget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publish {
    /// Correlation ID for the ack; opaque to the broker.
    pub message_id: String,
    pub topic: String,
    /// Raw payload text (JSON by convention, but not validated here).
    pub payload: String,
    #[serde(default)]
    pub acked: bool,
}

/// Acknowledgement of an acked [`Publish`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubAck {
    pub message_id: String,
}

/// Protocol error frame (broker -> client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

// ---------------------------------------------------------------------------
// Top-level discriminated union
// ---------------------------------------------------------------------------

/// All broker frame kinds.
///
/// Serializes/deserializes using the `kind` field as a tag.
///
/// ```json
/// { "kind": "publish", "message_id": "...", "topic": "...", ... }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum BrokerMessage {
    ClientHello(ClientHello),
    Heartbeat(Heartbeat),
    Publish(Publish),
    PubAck(PubAck),
    Error(ErrorMessage),
}

// ---------------------------------------------------------------------------
// Camera payload schemas
// ---------------------------------------------------------------------------

/// An event notification payload, published on `camera/<device>/events`.
///
/// Field names follow the camera firmware's JSON.  Unknown fields are
/// ignored; `timestamp` and `viewed` are optional so older firmware that
/// omits them still parses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventNotice {
    /// E.g. "motion_detected".
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub camera_name: String,
    /// Local time, `%Y-%m-%d %H:%M:%S`.  Empty means "stamp on arrival".
    #[serde(default)]
    pub timestamp: String,
    /// Reference to the recorded artifact (e.g. a video path).
    pub video_path: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Clip length in seconds.
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub viewed: bool,
}

/// A status or alert payload, published on `camera/<device>/status` or
/// `camera/<device>/alert`.  Displayed, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusNotice {
    #[serde(rename = "type", default)]
    pub notice_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub timestamp: String,
}

/// A control command addressed to this client process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    /// Connect the live stream for a device.
    Connect { device: String },
    /// Tear down the active stream session, if any.
    Disconnect,
    /// Request an orderly process shutdown.
    Shutdown,
    /// Liveness probe; answered with a status publish.
    Ping,
}

// ---------------------------------------------------------------------------
// Topic classification
// ---------------------------------------------------------------------------

/// What a concrete topic means to the ingestion worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    /// `camera/<device>/events`
    Event { device: String },
    /// `camera/<device>/status`
    Status { device: String },
    /// `camera/<device>/alert`
    Alert { device: String },
    /// The configured control topic for this process.
    Control,
    /// Anything else delivered to the session.
    Other,
}

/// Classify a delivered topic against the camera topic scheme.
///
/// `control_topic` is the process control topic from the config; it is
/// matched as a filter, so `console/control/+` style filters work.
pub fn classify_topic(topic: &str, control_topic: &str) -> TopicKind {
    if topic_matches(control_topic, topic) {
        return TopicKind::Control;
    }
    let mut parts = topic.split('/');
    if parts.next() != Some("camera") {
        return TopicKind::Other;
    }
    let (Some(device), Some(channel), None) = (parts.next(), parts.next(), parts.next()) else {
        return TopicKind::Other;
    };
    if device.is_empty() {
        return TopicKind::Other;
    }
    let device = device.to_owned();
    match channel {
        "events" => TopicKind::Event { device },
        "status" => TopicKind::Status { device },
        "alert" => TopicKind::Alert { device },
        _ => TopicKind::Other,
    }
}

/// Return true when `filter` matches `topic`.
///
/// Filters use `/`-separated levels with the usual pub/sub wildcards:
/// `+` matches exactly one level, a trailing `#` matches any remainder
/// (including none).  `#` anywhere else does not match.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (None, None) => return true,
            (Some("#"), _) => return f.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(fl), Some(tl)) if fl == tl => {}
            _ => return false,
        }
    }
}
