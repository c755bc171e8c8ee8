//! Control channel protocol: take/release/pause/resume plus remote
//! input events gated on holder identity and pause state.

use std::sync::Arc;
use std::time::Duration;

use glimpse_cdp::InputDispatcher;
use glimpse_core::errors::CdpError;
use glimpse_core::events::CtrlServerEvent;
use glimpse_stream::{ControlState, SessionSource};
use glimpse_telemetry::AuditSink;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::client::{ClientId, ClientRegistry, Namespace};
use crate::security::FixedWindowRateLimiter;

const DISPATCH_RETRY_DELAY: Duration = Duration::from_millis(50);

/// One inbound command frame: `{"event": "...", "payload": {...}}`.
#[derive(Deserialize)]
struct CtrlCommand {
    event: String,
    #[serde(default)]
    payload: Value,
}

struct InputState {
    dispatcher: Arc<InputDispatcher>,
    cdp_session_id: String,
}

/// Serverside half of the control channel. One instance serves every
/// ctrl viewer; per-viewer identity rides in the `sid`.
pub struct CtrlChannel {
    control: Arc<ControlState>,
    registry: Arc<ClientRegistry>,
    audit: Arc<AuditSink>,
    limiter: FixedWindowRateLimiter,
    source: Arc<dyn SessionSource>,
    input: Mutex<Option<InputState>>,
}

impl CtrlChannel {
    pub fn new(
        control: Arc<ControlState>,
        registry: Arc<ClientRegistry>,
        audit: Arc<AuditSink>,
        limiter: FixedWindowRateLimiter,
        source: Arc<dyn SessionSource>,
    ) -> Self {
        Self {
            control,
            registry,
            audit,
            limiter,
            source,
            input: Mutex::new(None),
        }
    }

    /// Push the current control snapshot to one newly-connected viewer.
    pub fn on_connect(&self, sid: &ClientId) {
        if let Some(state) = self.serialized_state() {
            self.registry.send_to(sid, state);
        }
    }

    /// Holder disconnects drop control so the driver cannot stay
    /// paused with nobody attached.
    pub fn on_disconnect(&self, sid: &ClientId) {
        if self.control.is_holder(&sid.0) {
            self.control.clear();
            self.broadcast_state();
        }
    }

    pub async fn handle_message(&self, sid: &ClientId, raw: &str) {
        let command: CtrlCommand = match serde_json::from_str(raw) {
            Ok(command) => command,
            Err(_) => {
                self.audit.record(
                    "ctrl_invalid_payload",
                    json!({"namespace": Namespace::Ctrl.as_str(), "sid": sid.0, "event": null}),
                );
                return;
            }
        };

        if !self.allow_event(sid, &command.event) {
            return;
        }

        match command.event.as_str() {
            "take_control" => {
                let holder = self.control.current_holder_sid();
                match holder {
                    None => {
                        self.control.take_control(&sid.0);
                    }
                    Some(holder) if holder != sid.0 => {
                        self.audit.record(
                            "ctrl_already_held",
                            json!({
                                "namespace": Namespace::Ctrl.as_str(),
                                "sid": sid.0,
                                "holder_sid": holder,
                            }),
                        );
                    }
                    Some(_) => {} // already the holder
                }
                self.broadcast_state();
            }
            "release_control" => {
                if !self.control.release_control(&sid.0) {
                    self.audit_not_holder(sid, "release_control");
                }
                self.broadcast_state();
            }
            "pause_agent" => {
                if !self.control.pause_if_holder(&sid.0) {
                    self.audit_not_holder(sid, "pause_agent");
                }
                self.broadcast_state();
            }
            "resume_agent" => {
                if !self.control.resume_if_holder(&sid.0) {
                    self.audit_not_holder(sid, "resume_agent");
                }
                self.broadcast_state();
            }
            event if is_input_event(event) => {
                self.handle_input(sid, event, &command.payload).await;
            }
            other => {
                tracing::debug!(sid = %sid, event = other, "unknown ctrl event");
            }
        }
    }

    async fn handle_input(&self, sid: &ClientId, event: &str, payload: &Value) {
        if !self.control.is_holder(&sid.0) {
            self.audit_not_holder(sid, event);
            return;
        }
        if !self.control.is_paused() {
            self.audit.record(
                "ctrl_not_paused",
                json!({"namespace": Namespace::Ctrl.as_str(), "sid": sid.0, "event": event}),
            );
            return;
        }
        if !validate_input_payload(event, payload) {
            self.audit.record(
                "ctrl_invalid_payload",
                json!({"namespace": Namespace::Ctrl.as_str(), "sid": sid.0, "event": event}),
            );
            return;
        }

        if let Err(error) = self.dispatch_input(event, payload).await {
            let reason = if error.is_detach() {
                "ctrl_target_unavailable"
            } else {
                "ctrl_dispatch_error"
            };
            self.audit.record(
                reason,
                json!({
                    "namespace": Namespace::Ctrl.as_str(),
                    "sid": sid.0,
                    "event": event,
                    "error": error.to_string(),
                    "error_kind": error.error_kind(),
                }),
            );
        }
    }

    /// Dispatch against the cached target, retrying once against a
    /// freshly acquired one if the command hits a detached session.
    async fn dispatch_input(&self, event: &str, payload: &Value) -> Result<(), CdpError> {
        let (dispatcher, cdp_id) = self.acquire_dispatcher(false).await?;
        match dispatcher.dispatch(event, payload, Some(&cdp_id)).await {
            Err(error) if error.is_detach() => {
                tokio::time::sleep(DISPATCH_RETRY_DELAY).await;
                let (dispatcher, cdp_id) = self.acquire_dispatcher(true).await?;
                dispatcher.dispatch(event, payload, Some(&cdp_id)).await
            }
            result => result,
        }
    }

    async fn acquire_dispatcher(
        &self,
        refresh: bool,
    ) -> Result<(Arc<InputDispatcher>, String), CdpError> {
        if !refresh {
            if let Some(state) = self.input.lock().as_ref() {
                return Ok((Arc::clone(&state.dispatcher), state.cdp_session_id.clone()));
            }
        }
        let (session, cdp_session_id) = self.source.acquire().await?;
        let mut input = self.input.lock();
        match input.as_mut() {
            Some(state) => {
                // Keep the dispatcher so held modifiers survive the swap.
                state.dispatcher.replace_session(session);
                state.cdp_session_id = cdp_session_id.clone();
                Ok((Arc::clone(&state.dispatcher), cdp_session_id))
            }
            None => {
                let dispatcher = Arc::new(InputDispatcher::new(session));
                *input = Some(InputState {
                    dispatcher: Arc::clone(&dispatcher),
                    cdp_session_id: cdp_session_id.clone(),
                });
                Ok((dispatcher, cdp_session_id))
            }
        }
    }

    fn allow_event(&self, sid: &ClientId, event: &str) -> bool {
        let key = format!("{}:{}", Namespace::Ctrl.as_str(), sid.0);
        if self.limiter.allow(&key) {
            return true;
        }
        self.audit.record(
            "rate_limited_event",
            json!({"namespace": Namespace::Ctrl.as_str(), "sid": sid.0, "event": event}),
        );
        false
    }

    fn audit_not_holder(&self, sid: &ClientId, event: &str) {
        self.audit.record(
            "ctrl_not_holder",
            json!({
                "namespace": Namespace::Ctrl.as_str(),
                "sid": sid.0,
                "event": event,
                "holder_sid": self.control.current_holder_sid(),
            }),
        );
    }

    fn serialized_state(&self) -> Option<String> {
        let event = CtrlServerEvent::ControlState(self.control.snapshot());
        serde_json::to_string(&event).ok()
    }

    /// Snapshot to every ctrl viewer, after every handled command.
    pub fn broadcast_state(&self) {
        if let Some(state) = self.serialized_state() {
            self.registry.broadcast(Namespace::Ctrl, &state);
        }
    }
}

fn is_input_event(event: &str) -> bool {
    matches!(
        event,
        "input_move"
            | "input_click"
            | "input_wheel"
            | "input_keydown"
            | "input_keyup"
            | "input_type"
    )
}

fn validate_input_payload(event: &str, payload: &Value) -> bool {
    let Some(map) = payload.as_object() else {
        return false;
    };
    let num = |snake: &str, camel: &str| {
        map.get(snake).is_some_and(Value::is_number) || map.get(camel).is_some_and(Value::is_number)
    };
    match event {
        "input_move" | "input_click" => num("x", "x") && num("y", "y"),
        "input_wheel" => {
            num("x", "x")
                && num("y", "y")
                && num("delta_x", "deltaX")
                && num("delta_y", "deltaY")
        }
        "input_keydown" => map
            .get("key")
            .and_then(Value::as_str)
            .is_some_and(|k| !k.is_empty()),
        "input_keyup" => map.get("key").is_some_and(Value::is_string),
        "input_type" => map.get("text").is_some_and(Value::is_string),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use glimpse_cdp::{CdpSession, MockSession};

    struct StaticSource {
        sessions: Mutex<Vec<Arc<MockSession>>>,
        cdp_id: String,
    }

    impl StaticSource {
        fn new(sessions: Vec<Arc<MockSession>>, cdp_id: &str) -> Self {
            Self {
                sessions: Mutex::new(sessions),
                cdp_id: cdp_id.to_string(),
            }
        }
    }

    #[async_trait]
    impl SessionSource for StaticSource {
        async fn acquire(&self) -> Result<(Arc<dyn CdpSession>, String), CdpError> {
            let mut sessions = self.sessions.lock();
            let session = if sessions.len() > 1 {
                sessions.remove(0)
            } else {
                sessions
                    .first()
                    .cloned()
                    .ok_or_else(|| CdpError::Detached("no session".into()))?
            };
            Ok((session as Arc<dyn CdpSession>, self.cdp_id.clone()))
        }
    }

    struct Fixture {
        channel: CtrlChannel,
        control: Arc<ControlState>,
        audit: Arc<AuditSink>,
        registry: Arc<ClientRegistry>,
        session: Arc<MockSession>,
    }

    fn fixture_with_sessions(sessions: Vec<Arc<MockSession>>, events_per_minute: u32) -> Fixture {
        let control = Arc::new(ControlState::new());
        let registry = Arc::new(ClientRegistry::new(32));
        let audit = Arc::new(AuditSink::in_memory());
        let session = sessions[0].clone();
        let source = Arc::new(StaticSource::new(sessions, "cdp-1"));
        let channel = CtrlChannel::new(
            Arc::clone(&control),
            Arc::clone(&registry),
            Arc::clone(&audit),
            FixedWindowRateLimiter::per_minute(events_per_minute),
            source,
        );
        Fixture {
            channel,
            control,
            audit,
            registry,
            session,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_sessions(vec![Arc::new(MockSession::new())], 1000)
    }

    fn sid(name: &str) -> ClientId {
        ClientId(name.to_string())
    }

    async fn take_pause(fixture: &Fixture, holder: &ClientId) {
        fixture
            .channel
            .handle_message(holder, r#"{"event":"take_control"}"#)
            .await;
        fixture
            .channel
            .handle_message(holder, r#"{"event":"pause_agent"}"#)
            .await;
    }

    #[tokio::test]
    async fn take_control_first_wins_and_broadcasts_state() {
        let fixture = fixture();
        let (viewer, mut rx) = fixture.registry.register(Namespace::Ctrl);

        fixture
            .channel
            .handle_message(&viewer, r#"{"event":"take_control"}"#)
            .await;
        assert_eq!(fixture.control.current_holder_sid(), Some(viewer.0.clone()));

        let state: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(state["event"], "control_state");
        assert_eq!(state["payload"]["holder_sid"], viewer.0);

        // A second viewer cannot preempt.
        let rival = sid("rival");
        fixture
            .channel
            .handle_message(&rival, r#"{"event":"take_control"}"#)
            .await;
        assert_eq!(fixture.control.current_holder_sid(), Some(viewer.0));
        assert_eq!(fixture.audit.reasons(), vec!["ctrl_already_held"]);
    }

    #[tokio::test]
    async fn pause_resume_release_require_holder() {
        let fixture = fixture();
        let holder = sid("holder");
        let rival = sid("rival");

        fixture
            .channel
            .handle_message(&holder, r#"{"event":"take_control"}"#)
            .await;
        fixture
            .channel
            .handle_message(&rival, r#"{"event":"pause_agent"}"#)
            .await;
        fixture
            .channel
            .handle_message(&rival, r#"{"event":"release_control"}"#)
            .await;

        assert!(!fixture.control.is_paused());
        assert_eq!(fixture.control.current_holder_sid(), Some(holder.0.clone()));
        assert_eq!(
            fixture.audit.reasons(),
            vec!["ctrl_not_holder", "ctrl_not_holder"]
        );
    }

    #[tokio::test]
    async fn input_requires_holder_and_pause() {
        let fixture = fixture();
        let holder = sid("holder");
        let rival = sid("rival");

        fixture
            .channel
            .handle_message(&holder, r#"{"event":"take_control"}"#)
            .await;

        // Not the holder.
        fixture
            .channel
            .handle_message(&rival, r#"{"event":"input_move","payload":{"x":1,"y":2}}"#)
            .await;
        // Holder but not paused.
        fixture
            .channel
            .handle_message(&holder, r#"{"event":"input_move","payload":{"x":1,"y":2}}"#)
            .await;
        assert_eq!(
            fixture.audit.reasons(),
            vec!["ctrl_not_holder", "ctrl_not_paused"]
        );
        assert!(fixture.session.commands().is_empty());

        // Paused holder dispatches.
        fixture
            .channel
            .handle_message(&holder, r#"{"event":"pause_agent"}"#)
            .await;
        fixture
            .channel
            .handle_message(&holder, r#"{"event":"input_move","payload":{"x":1,"y":2}}"#)
            .await;
        let sent = fixture.session.sent("Input.dispatchMouseEvent");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].session_id.as_deref(), Some("cdp-1"));
    }

    #[tokio::test]
    async fn invalid_payloads_are_rejected_without_dispatch() {
        let fixture = fixture();
        let holder = sid("holder");
        take_pause(&fixture, &holder).await;

        let invalid = [
            r#"{"event":"input_click","payload":{"y":20.25}}"#,
            r#"{"event":"input_move","payload":"not-a-dict"}"#,
            r#"{"event":"input_wheel","payload":{"x":1,"y":2,"delta_y":"nope"}}"#,
            r#"{"event":"input_keydown","payload":{}}"#,
            r#"{"event":"input_keyup","payload":{"key":123}}"#,
            r#"{"event":"input_type","payload":{"text":1}}"#,
        ];
        for raw in invalid {
            fixture.channel.handle_message(&holder, raw).await;
        }

        assert!(fixture.session.commands().is_empty());
        assert_eq!(
            fixture.audit.reasons(),
            vec!["ctrl_invalid_payload"; invalid.len()]
        );
    }

    #[tokio::test]
    async fn valid_payload_shapes_dispatch() {
        let fixture = fixture();
        let holder = sid("holder");
        take_pause(&fixture, &holder).await;

        let valid = [
            r#"{"event":"input_click","payload":{"x":10.5,"y":20.25,"button":"left","click_count":1}}"#,
            r#"{"event":"input_wheel","payload":{"x":1,"y":2,"delta_x":0,"delta_y":120}}"#,
            r#"{"event":"input_keydown","payload":{"key":"a","code":"KeyA"}}"#,
            r#"{"event":"input_keyup","payload":{"key":"a","code":"KeyA"}}"#,
            r#"{"event":"input_type","payload":{"text":"hi"}}"#,
        ];
        for raw in valid {
            fixture.channel.handle_message(&holder, raw).await;
        }

        assert!(fixture.audit.reasons().is_empty());
        // Click is pressed+released; type sends one char event per rune.
        assert_eq!(fixture.session.sent("Input.dispatchMouseEvent").len(), 3);
        assert!(fixture.session.sent("Input.dispatchKeyEvent").len() >= 4);
    }

    #[tokio::test]
    async fn detached_target_retries_against_fresh_session() {
        let stale = Arc::new(MockSession::new());
        stale.script(
            "Input.dispatchMouseEvent",
            Err(CdpError::Detached("target closed".into())),
        );
        let fresh = Arc::new(MockSession::new());
        let fixture = fixture_with_sessions(vec![stale.clone(), fresh.clone()], 1000);

        let holder = sid("holder");
        take_pause(&fixture, &holder).await;
        fixture
            .channel
            .handle_message(&holder, r#"{"event":"input_move","payload":{"x":1,"y":2}}"#)
            .await;

        assert_eq!(stale.sent("Input.dispatchMouseEvent").len(), 1);
        assert_eq!(fresh.sent("Input.dispatchMouseEvent").len(), 1);
        assert!(fixture.audit.reasons().is_empty());
    }

    #[tokio::test]
    async fn dispatch_error_is_audited_with_classification() {
        let session = Arc::new(MockSession::new());
        session.script(
            "Input.dispatchMouseEvent",
            Err(CdpError::Protocol("Invalid parameters".into())),
        );
        let fixture = fixture_with_sessions(vec![session], 1000);

        let holder = sid("holder");
        take_pause(&fixture, &holder).await;
        fixture
            .channel
            .handle_message(&holder, r#"{"event":"input_move","payload":{"x":1,"y":2}}"#)
            .await;

        assert_eq!(fixture.audit.reasons(), vec!["ctrl_dispatch_error"]);
        let entry = &fixture.audit.entries()[0];
        assert_eq!(entry.fields["error_kind"], "protocol");
        assert_eq!(entry.fields["error"], "protocol error: Invalid parameters");
    }

    #[tokio::test]
    async fn held_modifiers_survive_session_swap() {
        let stale = Arc::new(MockSession::new());
        let fresh = Arc::new(MockSession::new());
        let fixture = fixture_with_sessions(vec![stale.clone(), fresh.clone()], 1000);

        let holder = sid("holder");
        take_pause(&fixture, &holder).await;
        fixture
            .channel
            .handle_message(&holder, r#"{"event":"input_keydown","payload":{"key":"Shift"}}"#)
            .await;

        // Next command detaches mid-stream and retries on the fresh session.
        stale.script(
            "Input.dispatchMouseEvent",
            Err(CdpError::Detached("detached".into())),
        );
        fixture
            .channel
            .handle_message(
                &holder,
                r#"{"event":"input_click","payload":{"x":5,"y":6}}"#,
            )
            .await;

        let sent = fresh.sent("Input.dispatchMouseEvent");
        assert_eq!(sent.len(), 2);
        for command in sent {
            let params = command.params.unwrap();
            assert_eq!(params["modifiers"], 8);
        }
    }

    #[tokio::test]
    async fn rate_limited_events_are_audited_not_handled() {
        let fixture = fixture_with_sessions(vec![Arc::new(MockSession::new())], 2);
        let viewer = sid("viewer");

        fixture
            .channel
            .handle_message(&viewer, r#"{"event":"take_control"}"#)
            .await;
        fixture
            .channel
            .handle_message(&viewer, r#"{"event":"pause_agent"}"#)
            .await;
        fixture
            .channel
            .handle_message(&viewer, r#"{"event":"resume_agent"}"#)
            .await;

        assert_eq!(fixture.audit.reasons(), vec!["rate_limited_event"]);
        // The third command was dropped, so the pause stands.
        assert!(fixture.control.is_paused());
    }

    #[tokio::test]
    async fn holder_disconnect_clears_control() {
        let fixture = fixture();
        let (watcher, mut rx) = fixture.registry.register(Namespace::Ctrl);
        let holder = sid("holder");

        fixture
            .channel
            .handle_message(&holder, r#"{"event":"take_control"}"#)
            .await;
        let _ = rx.try_recv();

        fixture.channel.on_disconnect(&holder);
        assert!(fixture.control.current_holder_sid().is_none());

        let state: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(state["payload"]["holder_sid"], Value::Null);

        // Non-holder disconnects leave state alone.
        fixture
            .channel
            .handle_message(&watcher, r#"{"event":"take_control"}"#)
            .await;
        fixture.channel.on_disconnect(&sid("someone-else"));
        assert_eq!(fixture.control.current_holder_sid(), Some(watcher.0));
    }

    #[tokio::test]
    async fn connect_pushes_snapshot_to_new_viewer() {
        let fixture = fixture();
        let session = glimpse_core::ids::SessionId::from_raw("sess_live");
        fixture.control.set_active_session(Some(session));

        let (viewer, mut rx) = fixture.registry.register(Namespace::Ctrl);
        fixture.channel.on_connect(&viewer);

        let state: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(state["event"], "control_state");
        assert_eq!(state["payload"]["active_session_id"], "sess_live");
        assert_eq!(state["payload"]["paused"], false);
    }

    #[tokio::test]
    async fn unparseable_frame_is_invalid_payload() {
        let fixture = fixture();
        fixture.channel.handle_message(&sid("v"), "not json").await;
        assert_eq!(fixture.audit.reasons(), vec!["ctrl_invalid_payload"]);
    }
}
