use serde::Serialize;

/// Events marshaled onto the presentation loop.
///
/// Workers never touch presentation state directly; everything crosses this
/// broadcast channel and is handled on the UI's own thread of control.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsoleUiEvent {
    /// Stream session state changed (connect progress, active, failed, idle).
    SessionStatus { text: String, connected: bool },
    /// A status or alert notice arrived for a device; display only.
    DeviceNotice { device: String, text: String },
    /// The durable event set changed; the presentation loop should refresh
    /// the read-model counters.
    RefreshCounts,
    LogEntry { entry: String },
}

pub type UiSender = tokio::sync::broadcast::Sender<ConsoleUiEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_status_serializes_with_type_tag() {
        let event = ConsoleUiEvent::SessionStatus {
            text: "Connected to Shed Camera".to_owned(),
            connected: true,
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session_status");
        assert_eq!(json["connected"], true);
    }

    #[test]
    fn device_notice_serializes_with_type_tag() {
        let event = ConsoleUiEvent::DeviceNotice {
            device: "shed".to_owned(),
            text: "battery low".to_owned(),
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "device_notice");
        assert_eq!(json["device"], "shed");
    }

    #[test]
    fn refresh_counts_serializes_with_type_tag() {
        let json: serde_json::Value = serde_json::to_value(ConsoleUiEvent::RefreshCounts).unwrap();
        assert_eq!(json["type"], "refresh_counts");
    }
}
