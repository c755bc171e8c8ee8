use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::SessionId;

/// Events pushed to viewers on the stream channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum StreamEvent {
    Frame(FramePayload),
    BrowserUpdate(BrowserUpdatePayload),
}

impl StreamEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Frame(frame) => &frame.session_id,
            Self::BrowserUpdate(update) => &update.session_id,
        }
    }
}

/// One emitted screencast frame. Sequence numbers are per-pipeline
/// monotonic; gaps mean dropped frames.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FramePayload {
    pub seq: u64,
    pub session_id: SessionId,
    pub received_ts: f64,
    pub emitted_ts: f64,
    pub latency_ms: f64,
    pub data_base64: String,
    pub metadata: Value,
}

/// Fallback screenshot-mode update (no screencast running).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrowserUpdatePayload {
    pub session_id: SessionId,
    pub timestamp: f64,
    pub mime_type: String,
    pub image_base64: String,
    pub metadata: Value,
}

/// Events pushed to viewers on the control channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum CtrlServerEvent {
    ControlState(ControlSnapshot),
}

/// Snapshot of who holds control, pushed on connect and after every
/// successful mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlSnapshot {
    pub holder_sid: Option<String>,
    pub held_since_ts: Option<f64>,
    pub paused: bool,
    pub active_session_id: Option<SessionId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_event_wire_shape() {
        let event = StreamEvent::Frame(FramePayload {
            seq: 3,
            session_id: SessionId::from_raw("sess_1"),
            received_ts: 100.0,
            emitted_ts: 100.25,
            latency_ms: 250.0,
            data_base64: "aGk=".into(),
            metadata: json!({"cdp_session_id": "abc"}),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "frame");
        assert_eq!(json["payload"]["seq"], 3);
        assert_eq!(json["payload"]["latency_ms"], 250.0);
        assert_eq!(json["payload"]["metadata"]["cdp_session_id"], "abc");
    }

    #[test]
    fn control_state_wire_shape() {
        let event = CtrlServerEvent::ControlState(ControlSnapshot {
            holder_sid: Some("viewer-1".into()),
            held_since_ts: Some(1.5),
            paused: true,
            active_session_id: Some(SessionId::from_raw("sess_1")),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "control_state");
        assert_eq!(json["payload"]["holder_sid"], "viewer-1");
        assert_eq!(json["payload"]["paused"], true);
    }

    #[test]
    fn stream_event_session_id_accessor() {
        let event = StreamEvent::BrowserUpdate(BrowserUpdatePayload {
            session_id: SessionId::from_raw("sess_9"),
            timestamp: 5.0,
            mime_type: "image/png".into(),
            image_base64: String::new(),
            metadata: json!({}),
        });
        assert_eq!(event.session_id().as_str(), "sess_9");
    }
}
