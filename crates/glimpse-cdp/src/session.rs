use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use glimpse_core::errors::CdpError;
use parking_lot::Mutex;
use serde_json::Value;

/// Event callback: raw event params plus the CDP session id the browser
/// tagged the event with (flat-mode sessions).
pub type EventHandler = Arc<dyn Fn(Value, Option<&str>) + Send + Sync>;

/// Minimal adapter surface over a DevTools connection. One trait covers
/// the real WebSocket transport and the in-process mock.
#[async_trait]
pub trait CdpSession: Send + Sync {
    /// Send a command, optionally scoped to a flattened session id.
    async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<&str>,
    ) -> Result<Value, CdpError>;

    /// Subscribe to a protocol event. Handlers stack; all registered
    /// handlers for an event fire in registration order.
    fn on(&self, event: &str, handler: EventHandler);
}

/// One command recorded by [`MockSession`].
#[derive(Clone, Debug, PartialEq)]
pub struct SentCommand {
    pub method: String,
    pub params: Option<Value>,
    pub session_id: Option<String>,
}

/// In-process session for tests: records every command and lets the
/// caller fire protocol events into registered handlers.
#[derive(Default)]
pub struct MockSession {
    commands: Mutex<Vec<SentCommand>>,
    handlers: Mutex<HashMap<String, Vec<EventHandler>>>,
    scripted: Mutex<HashMap<String, VecDeque<Result<Value, CdpError>>>>,
}

impl MockSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next call to `method`. Unscripted
    /// commands succeed with `Value::Null`.
    pub fn script(&self, method: &str, result: Result<Value, CdpError>) {
        self.scripted
            .lock()
            .entry(method.to_string())
            .or_default()
            .push_back(result);
    }

    /// All commands sent so far, in order.
    pub fn commands(&self) -> Vec<SentCommand> {
        self.commands.lock().clone()
    }

    /// Commands matching one method.
    pub fn sent(&self, method: &str) -> Vec<SentCommand> {
        self.commands
            .lock()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Fire a protocol event at every handler registered for it.
    pub fn emit(&self, event: &str, params: Value, session_id: Option<&str>) {
        let handlers: Vec<EventHandler> = self
            .handlers
            .lock()
            .get(event)
            .map(|v| v.to_vec())
            .unwrap_or_default();
        for handler in handlers {
            handler(params.clone(), session_id);
        }
    }
}

#[async_trait]
impl CdpSession for MockSession {
    async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<&str>,
    ) -> Result<Value, CdpError> {
        self.commands.lock().push(SentCommand {
            method: method.to_string(),
            params,
            session_id: session_id.map(str::to_string),
        });
        if let Some(queue) = self.scripted.lock().get_mut(method) {
            if let Some(result) = queue.pop_front() {
                return result;
            }
        }
        Ok(Value::Null)
    }

    fn on(&self, event: &str, handler: EventHandler) {
        self.handlers
            .lock()
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }
}
