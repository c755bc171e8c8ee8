//! Records driver step updates into the screenshot and run event
//! stores, plus the screenshot-mode fallback publisher.

use std::sync::Arc;

use base64::Engine;
use glimpse_core::events::{BrowserUpdatePayload, StreamEvent};
use glimpse_core::ids::SessionId;
use glimpse_core::time::now_ts;
use glimpse_store::{NewScreenshot, RunEventStore, ScreenshotKind, ScreenshotStore};
use serde_json::{json, Value};
use tokio::sync::broadcast;

/// One driver step observation crossing the runtime boundary.
#[derive(Clone, Debug)]
pub struct StepUpdate {
    pub session_id: SessionId,
    pub step: Option<u32>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub summary: String,
    pub screenshot_base64: Option<String>,
    pub browser_errors: Vec<String>,
}

/// Persists each step as an `AgentStep` screenshot plus an agent run
/// event. A bad or missing screenshot never loses the run event.
pub struct StepRecorder {
    screenshots: Arc<ScreenshotStore>,
    run_events: Arc<RunEventStore>,
}

impl StepRecorder {
    pub fn new(screenshots: Arc<ScreenshotStore>, run_events: Arc<RunEventStore>) -> Self {
        Self {
            screenshots,
            run_events,
        }
    }

    pub fn record(&self, update: &StepUpdate) {
        let captured_at = now_ts();
        let has_error = !update.browser_errors.is_empty();

        if let Some(encoded) = &update.screenshot_base64 {
            match base64::engine::general_purpose::STANDARD.decode(encoded) {
                Ok(image) => {
                    let mut shot = NewScreenshot::new(ScreenshotKind::AgentStep);
                    shot.image = Some(image);
                    shot.mime_type = Some("image/png".to_string());
                    shot.session_id = Some(update.session_id.clone());
                    shot.captured_at = Some(captured_at);
                    shot.has_error = has_error;
                    shot.metadata = json!({
                        "title": update.title.clone().unwrap_or_default(),
                        "browser_errors": update.browser_errors,
                    });
                    shot.url = update.url.clone();
                    shot.step = update.step;
                    self.screenshots.record(shot);
                }
                Err(error) => {
                    tracing::debug!(
                        session_id = %update.session_id,
                        step = update.step,
                        error = %error,
                        "failed to decode step screenshot"
                    );
                }
            }
        }

        self.run_events.record_agent_step(
            &update.session_id,
            captured_at,
            update.step,
            update.url.as_deref(),
            update.title.as_deref(),
            &update.summary,
            has_error,
        );
    }
}

/// Pushes full screenshots to stream viewers when no screencast is
/// running, recording each one in the store alongside.
pub struct BrowserUpdatePublisher {
    screenshots: Arc<ScreenshotStore>,
    events: broadcast::Sender<StreamEvent>,
}

impl BrowserUpdatePublisher {
    pub fn new(screenshots: Arc<ScreenshotStore>, events: broadcast::Sender<StreamEvent>) -> Self {
        Self {
            screenshots,
            events,
        }
    }

    pub fn publish(
        &self,
        session_id: &SessionId,
        image: &[u8],
        mime_type: &str,
        metadata: Value,
    ) {
        let timestamp = now_ts();
        let image_base64 = base64::engine::general_purpose::STANDARD.encode(image);

        let mut shot = NewScreenshot::new(ScreenshotKind::BrowserUpdate);
        shot.image = Some(image.to_vec());
        shot.mime_type = Some(mime_type.to_string());
        shot.session_id = Some(session_id.clone());
        shot.captured_at = Some(timestamp);
        shot.metadata = merge_streaming_mode(metadata.clone());
        self.screenshots.record(shot);

        // No subscribers just means no viewers right now.
        let _ = self.events.send(StreamEvent::BrowserUpdate(BrowserUpdatePayload {
            session_id: session_id.clone(),
            timestamp,
            mime_type: mime_type.to_string(),
            image_base64,
            metadata,
        }));
    }
}

fn merge_streaming_mode(metadata: Value) -> Value {
    let mut map = metadata.as_object().cloned().unwrap_or_default();
    map.insert("streaming_mode".to_string(), json!("screenshot"));
    Value::Object(map)
}
