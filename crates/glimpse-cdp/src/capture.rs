//! Taps Runtime/Network protocol events into the run event store.
//!
//! Response bodies are never captured; request URLs are stripped of
//! query and fragment before they are stored.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use glimpse_core::ids::SessionId;
use glimpse_core::time::now_ts;
use glimpse_store::RunEventStore;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use url::Url;

use crate::session::CdpSession;

const DEFAULT_MAX_PENDING: usize = 2000;

fn safe_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(parsed) if parsed.has_host() => {
            let mut stripped = parsed;
            stripped.set_query(None);
            stripped.set_fragment(None);
            stripped.into()
        }
        _ => raw.to_string(),
    }
}

fn format_console_args(args: Option<&Vec<Value>>) -> String {
    let Some(args) = args else {
        return String::new();
    };
    let mut parts: Vec<String> = Vec::with_capacity(args.len());
    for arg in args {
        let Some(obj) = arg.as_object() else {
            parts.push(arg.to_string());
            continue;
        };
        if let Some(value) = obj.get("value").filter(|v| !v.is_null()) {
            parts.push(match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
            continue;
        }
        if let Some(description) = obj.get("description").and_then(Value::as_str) {
            parts.push(description.to_string());
            continue;
        }
        if let Some(arg_type) = obj.get("type").and_then(Value::as_str) {
            parts.push(format!("<{arg_type}>"));
            continue;
        }
        parts.push("<arg>".to_string());
    }
    parts.join(" ").trim().to_string()
}

/// Source location from the top frame of a stack trace. Protocol line
/// and column numbers are zero-based; stored values are one-based.
fn stack_location(stack: Option<&Value>) -> Option<Value> {
    let frame = stack?.get("callFrames")?.as_array()?.first()?.as_object()?;
    let mut location = Map::new();
    if let Some(url) = frame.get("url").and_then(Value::as_str).filter(|u| !u.is_empty()) {
        location.insert("url".into(), Value::String(safe_url(url)));
    }
    if let Some(function) = frame
        .get("functionName")
        .and_then(Value::as_str)
        .filter(|f| !f.is_empty())
    {
        location.insert("function".into(), Value::String(function.to_string()));
    }
    if let Some(line) = frame.get("lineNumber").and_then(Value::as_u64) {
        location.insert("line".into(), Value::from(line + 1));
    }
    if let Some(column) = frame.get("columnNumber").and_then(Value::as_u64) {
        location.insert("column".into(), Value::from(column + 1));
    }
    if location.is_empty() {
        None
    } else {
        Some(Value::Object(location))
    }
}

struct PendingRequest {
    method: String,
    url: String,
    start_ts: Option<f64>,
    status: Option<u16>,
}

/// Insert-ordered request map with a hard capacity; oldest entries are
/// evicted so a chatty page cannot grow it without bound.
struct PendingMap {
    entries: HashMap<String, PendingRequest>,
    order: VecDeque<String>,
    cap: usize,
}

impl PendingMap {
    fn new(cap: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn insert(&mut self, request_id: String, entry: PendingRequest) {
        if self.entries.insert(request_id.clone(), entry).is_some() {
            self.order.retain(|id| id != &request_id);
        }
        self.order.push_back(request_id);
        while self.cap > 0 && self.entries.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn get_mut(&mut self, request_id: &str) -> Option<&mut PendingRequest> {
        self.entries.get_mut(request_id)
    }

    fn remove(&mut self, request_id: &str) -> Option<PendingRequest> {
        let entry = self.entries.remove(request_id)?;
        self.order.retain(|id| id != request_id);
        Some(entry)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Subscribes to console and network protocol events for one run
/// session and records bounded run events.
pub struct RunEventCapture {
    store: Arc<RunEventStore>,
    session_id: SessionId,
    pending: Mutex<PendingMap>,
}

impl RunEventCapture {
    pub fn new(store: Arc<RunEventStore>, session_id: SessionId) -> Self {
        Self::with_capacity(store, session_id, DEFAULT_MAX_PENDING)
    }

    pub fn with_capacity(
        store: Arc<RunEventStore>,
        session_id: SessionId,
        max_pending: usize,
    ) -> Self {
        Self {
            store,
            session_id,
            pending: Mutex::new(PendingMap::new(max_pending)),
        }
    }

    /// Register handlers on the session. `Runtime.enable` and
    /// `Network.enable` are the caller's responsibility.
    pub fn attach(self: &Arc<Self>, session: &dyn CdpSession) {
        let capture = Arc::clone(self);
        session.on(
            "Runtime.consoleAPICalled",
            Arc::new(move |params, _| capture.on_console_api_called(&params)),
        );
        let capture = Arc::clone(self);
        session.on(
            "Runtime.exceptionThrown",
            Arc::new(move |params, _| capture.on_exception_thrown(&params)),
        );
        let capture = Arc::clone(self);
        session.on(
            "Network.requestWillBeSent",
            Arc::new(move |params, _| capture.on_request_will_be_sent(&params)),
        );
        let capture = Arc::clone(self);
        session.on(
            "Network.responseReceived",
            Arc::new(move |params, _| capture.on_response_received(&params)),
        );
        let capture = Arc::clone(self);
        session.on(
            "Network.loadingFinished",
            Arc::new(move |params, _| capture.on_loading_finished(&params)),
        );
        let capture = Arc::clone(self);
        session.on(
            "Network.loadingFailed",
            Arc::new(move |params, _| capture.on_loading_failed(&params)),
        );
    }

    fn on_console_api_called(&self, event: &Value) {
        let level = event.get("type").and_then(Value::as_str).unwrap_or("log");
        let message = format_console_args(event.get("args").and_then(Value::as_array));
        let location = stack_location(event.get("stackTrace"));
        self.store
            .record_console(&self.session_id, now_ts(), level, &message, location);
    }

    fn on_exception_thrown(&self, event: &Value) {
        let details = event
            .get("exceptionDetails")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let mut message = details
            .get("text")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .unwrap_or("Unhandled exception")
            .to_string();
        if let Some(exception) = details.get("exception").and_then(Value::as_object) {
            let description = exception
                .get("description")
                .filter(|v| !v.is_null())
                .or_else(|| exception.get("value").filter(|v| !v.is_null()));
            if let Some(description) = description {
                let text = match description {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                message = format!("{message}: {text}");
            }
        }

        let mut location = Map::new();
        if let Some(url) = details.get("url").and_then(Value::as_str).filter(|u| !u.is_empty()) {
            location.insert("url".into(), Value::String(safe_url(url)));
        }
        if let Some(line) = details.get("lineNumber").and_then(Value::as_u64) {
            location.insert("line".into(), Value::from(line + 1));
        }
        if let Some(column) = details.get("columnNumber").and_then(Value::as_u64) {
            location.insert("column".into(), Value::from(column + 1));
        }
        if let Some(Value::Object(stack)) = stack_location(details.get("stackTrace")) {
            location.extend(stack);
        }
        let location = if location.is_empty() {
            None
        } else {
            Some(Value::Object(location))
        };

        self.store
            .record_console(&self.session_id, now_ts(), "exception", &message, location);
    }

    fn on_request_will_be_sent(&self, event: &Value) {
        let Some(request_id) = event.get("requestId").and_then(Value::as_str) else {
            return;
        };
        let Some(request) = event.get("request").and_then(Value::as_object) else {
            return;
        };
        let url = request.get("url").and_then(Value::as_str).unwrap_or("");
        let method = request.get("method").and_then(Value::as_str).unwrap_or("");
        self.pending.lock().insert(
            request_id.to_string(),
            PendingRequest {
                method: method.to_string(),
                url: safe_url(url),
                start_ts: event.get("timestamp").and_then(Value::as_f64),
                status: None,
            },
        );
    }

    fn on_response_received(&self, event: &Value) {
        let Some(request_id) = event.get("requestId").and_then(Value::as_str) else {
            return;
        };
        let Some(response) = event.get("response").and_then(Value::as_object) else {
            return;
        };
        let mut pending = self.pending.lock();
        if let Some(entry) = pending.get_mut(request_id) {
            entry.status = response
                .get("status")
                .and_then(Value::as_u64)
                .and_then(|s| u16::try_from(s).ok());
        }
    }

    fn on_loading_finished(&self, event: &Value) {
        let Some((entry, duration_ms)) = self.take_completed(event) else {
            return;
        };
        self.store.record_network(
            &self.session_id,
            now_ts(),
            &entry.method,
            &entry.url,
            entry.status,
            duration_ms,
            None,
        );
    }

    fn on_loading_failed(&self, event: &Value) {
        let Some((entry, duration_ms)) = self.take_completed(event) else {
            return;
        };
        let error = event
            .get("errorText")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .or_else(|| event.get("blockedReason").and_then(Value::as_str))
            .unwrap_or("failed");
        self.store.record_network(
            &self.session_id,
            now_ts(),
            &entry.method,
            &entry.url,
            entry.status,
            duration_ms,
            Some(error),
        );
    }

    fn take_completed(&self, event: &Value) -> Option<(PendingRequest, Option<f64>)> {
        let request_id = event.get("requestId").and_then(Value::as_str)?;
        let entry = self.pending.lock().remove(request_id)?;
        let end_ts = event.get("timestamp").and_then(Value::as_f64);
        let duration_ms = match (entry.start_ts, end_ts) {
            (Some(start), Some(end)) => Some(((end - start) * 1000.0).max(0.0)),
            _ => None,
        };
        Some((entry, duration_ms))
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MockSession;
    use glimpse_store::run_events::{RunEventKind, RunEventQuery};
    use serde_json::json;

    fn capture() -> (Arc<RunEventCapture>, Arc<RunEventStore>, SessionId) {
        let store = Arc::new(RunEventStore::default());
        let session_id = SessionId::from_raw("sess_capture");
        store.register_session(&session_id, 0.0);
        let capture = Arc::new(RunEventCapture::new(Arc::clone(&store), session_id.clone()));
        (capture, store, session_id)
    }

    fn query_all(store: &RunEventStore, session_id: &SessionId) -> Vec<glimpse_store::RunEvent> {
        store
            .query(&RunEventQuery {
                session_id: Some(session_id.clone()),
                include_details: true,
                last_n: 200,
                ..Default::default()
            })
            .events
    }

    #[test]
    fn console_event_formats_args_and_location() {
        let (capture, store, session_id) = capture();
        let mock = MockSession::new();
        capture.attach(&mock);

        mock.emit(
            "Runtime.consoleAPICalled",
            json!({
                "type": "error",
                "args": [
                    {"type": "string", "value": "boom"},
                    {"type": "object", "description": "TypeError: x is not a function"},
                    {"type": "function"}
                ],
                "stackTrace": {"callFrames": [
                    {"url": "https://app.example/app.js?v=2", "functionName": "handler",
                     "lineNumber": 10, "columnNumber": 4}
                ]}
            }),
            None,
        );

        let events = query_all(&store, &session_id);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].summary,
            "boom TypeError: x is not a function <function>"
        );
        assert!(events[0].has_error);
        let location = &events[0].details.as_ref().unwrap()["location"];
        assert_eq!(location["url"], "https://app.example/app.js");
        assert_eq!(location["line"], 11);
    }

    #[test]
    fn exception_combines_text_and_description() {
        let (capture, store, session_id) = capture();
        let mock = MockSession::new();
        capture.attach(&mock);

        mock.emit(
            "Runtime.exceptionThrown",
            json!({
                "exceptionDetails": {
                    "text": "Uncaught",
                    "exception": {"description": "ReferenceError: y is not defined"},
                    "lineNumber": 0,
                    "columnNumber": 2
                }
            }),
            None,
        );

        let events = query_all(&store, &session_id);
        assert_eq!(
            events[0].summary,
            "Uncaught: ReferenceError: y is not defined"
        );
        assert_eq!(events[0].details.as_ref().unwrap()["level"], "exception");
    }

    #[test]
    fn request_lifecycle_records_duration_and_status() {
        let (capture, store, session_id) = capture();
        let mock = MockSession::new();
        capture.attach(&mock);

        mock.emit(
            "Network.requestWillBeSent",
            json!({
                "requestId": "r1",
                "timestamp": 100.0,
                "request": {"method": "GET", "url": "https://app.example/api?token=x"}
            }),
            None,
        );
        mock.emit(
            "Network.responseReceived",
            json!({"requestId": "r1", "response": {"status": 503}}),
            None,
        );
        mock.emit(
            "Network.loadingFinished",
            json!({"requestId": "r1", "timestamp": 100.25}),
            None,
        );

        let events = query_all(&store, &session_id);
        assert_eq!(events.len(), 1);
        let details = events[0].details.as_ref().unwrap();
        assert_eq!(details["url"], "https://app.example/api");
        assert_eq!(details["status"], 503);
        assert_eq!(details["duration_ms"], 250.0);
        assert!(events[0].has_error);
        assert_eq!(capture.pending_len(), 0);
    }

    #[test]
    fn loading_failed_uses_error_text() {
        let (capture, store, session_id) = capture();
        let mock = MockSession::new();
        capture.attach(&mock);

        mock.emit(
            "Network.requestWillBeSent",
            json!({
                "requestId": "r2",
                "request": {"method": "GET", "url": "https://ads.example/pixel"}
            }),
            None,
        );
        mock.emit(
            "Network.loadingFailed",
            json!({"requestId": "r2", "errorText": "net::ERR_BLOCKED_BY_CLIENT"}),
            None,
        );

        let events = query_all(&store, &session_id);
        let details = events[0].details.as_ref().unwrap();
        assert_eq!(details["error"], "net::ERR_BLOCKED_BY_CLIENT");
        assert!(events[0].has_error);
    }

    #[test]
    fn orphan_completion_events_are_ignored() {
        let (capture, store, session_id) = capture();
        let mock = MockSession::new();
        capture.attach(&mock);

        mock.emit("Network.loadingFinished", json!({"requestId": "ghost"}), None);
        assert!(query_all(&store, &session_id).is_empty());
    }

    #[test]
    fn pending_map_evicts_oldest_at_capacity() {
        let store = Arc::new(RunEventStore::default());
        let session_id = SessionId::from_raw("sess_cap2");
        store.register_session(&session_id, 0.0);
        let capture = Arc::new(RunEventCapture::with_capacity(
            Arc::clone(&store),
            session_id.clone(),
            2,
        ));
        let mock = MockSession::new();
        capture.attach(&mock);

        for i in 0..3 {
            mock.emit(
                "Network.requestWillBeSent",
                json!({
                    "requestId": format!("r{i}"),
                    "request": {"method": "GET", "url": "https://app.example/x"}
                }),
                None,
            );
        }
        assert_eq!(capture.pending_len(), 2);

        // r0 was evicted; completing it records nothing.
        mock.emit("Network.loadingFinished", json!({"requestId": "r0"}), None);
        let events = store
            .query(&RunEventQuery {
                session_id: Some(session_id),
                kinds: Some(vec![RunEventKind::Network]),
                ..Default::default()
            })
            .events;
        assert!(events.is_empty());
    }
}
