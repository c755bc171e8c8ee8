//! Live target acquisition against a browser remote-debugging endpoint.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use glimpse_cdp::{CdpSession, WsTransport};
use glimpse_core::errors::CdpError;
use serde_json::{json, Value};

use crate::pipeline::SessionSource;

#[derive(Default)]
struct SourceState {
    transport: Option<Arc<WsTransport>>,
    // target id -> attached cdp session id
    sessions: HashMap<String, String>,
}

/// Connects lazily to a debugger endpoint and attaches to the current
/// page target. Attachments are cached per target so repeated polls
/// return a stable session id until the target goes away.
pub struct DebuggerSource {
    endpoint: String,
    state: tokio::sync::Mutex<SourceState>,
}

impl DebuggerSource {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: tokio::sync::Mutex::new(SourceState::default()),
        }
    }
}

/// First real page in a `Target.getTargets` response.
fn pick_page_target(targets: &Value) -> Option<String> {
    let infos = targets.get("targetInfos")?.as_array()?;
    infos.iter().find_map(|info| {
        let kind = info.get("type")?.as_str()?;
        let url = info.get("url").and_then(Value::as_str).unwrap_or("");
        if kind == "page" && !url.starts_with("devtools://") {
            info.get("targetId")?.as_str().map(str::to_string)
        } else {
            None
        }
    })
}

fn listed_target_ids(targets: &Value) -> HashSet<String> {
    targets
        .get("targetInfos")
        .and_then(Value::as_array)
        .map(|infos| {
            infos
                .iter()
                .filter_map(|info| info.get("targetId").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl SessionSource for DebuggerSource {
    async fn acquire(&self) -> Result<(Arc<dyn CdpSession>, String), CdpError> {
        let mut state = self.state.lock().await;

        let transport = match &state.transport {
            Some(transport) => Arc::clone(transport),
            None => {
                let ws_url = WsTransport::discover_ws_url(&self.endpoint).await?;
                let transport = Arc::new(WsTransport::connect(&ws_url).await?);
                state.sessions.clear();
                state.transport = Some(Arc::clone(&transport));
                transport
            }
        };

        let targets = match transport.send("Target.getTargets", None, None).await {
            Ok(targets) => targets,
            Err(error) => {
                // A dead transport is rebuilt on the next poll.
                state.transport = None;
                state.sessions.clear();
                return Err(error);
            }
        };

        let live = listed_target_ids(&targets);
        state.sessions.retain(|target_id, _| live.contains(target_id));

        let target_id = pick_page_target(&targets)
            .ok_or_else(|| CdpError::Detached("no page target available".into()))?;

        if let Some(session_id) = state.sessions.get(&target_id) {
            return Ok((transport as Arc<dyn CdpSession>, session_id.clone()));
        }

        let attached = transport
            .send(
                "Target.attachToTarget",
                Some(json!({"targetId": target_id, "flatten": true})),
                None,
            )
            .await?;
        let session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| CdpError::Protocol("attachToTarget returned no sessionId".into()))?
            .to_string();

        state.sessions.insert(target_id, session_id.clone());
        Ok((transport as Arc<dyn CdpSession>, session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_first_real_page() {
        let targets = json!({"targetInfos": [
            {"targetId": "t0", "type": "background_page", "url": "chrome-extension://x"},
            {"targetId": "t1", "type": "page", "url": "devtools://devtools/inspector.html"},
            {"targetId": "t2", "type": "page", "url": "https://app.example/cart"},
            {"targetId": "t3", "type": "page", "url": "https://other.example"},
        ]});
        assert_eq!(pick_page_target(&targets).as_deref(), Some("t2"));
    }

    #[test]
    fn no_page_target_is_none() {
        assert!(pick_page_target(&json!({"targetInfos": []})).is_none());
        assert!(pick_page_target(&json!({})).is_none());
    }

    #[test]
    fn listed_ids_collects_all_targets() {
        let targets = json!({"targetInfos": [
            {"targetId": "a", "type": "page", "url": ""},
            {"targetId": "b", "type": "iframe", "url": ""},
        ]});
        let ids = listed_target_ids(&targets);
        assert!(ids.contains("a") && ids.contains("b"));
    }
}
