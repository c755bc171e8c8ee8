use std::collections::VecDeque;

use base64::Engine;
use glimpse_core::ids::SessionId;
use glimpse_core::time::now_ts;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Why a screenshot was captured.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenshotKind {
    AgentStep,
    StreamSample,
    BrowserUpdate,
}

impl std::fmt::Display for ScreenshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AgentStep => f.write_str("agent_step"),
            Self::StreamSample => f.write_str("stream_sample"),
            Self::BrowserUpdate => f.write_str("browser_update"),
        }
    }
}

/// A stored screenshot. Immutable after creation; evicted FIFO.
#[derive(Clone, Debug)]
pub struct Screenshot {
    pub id: String,
    pub captured_at: f64,
    pub kind: ScreenshotKind,
    pub session_id: Option<SessionId>,
    pub has_error: bool,
    pub metadata: Value,
    pub image: Option<Vec<u8>>,
    pub mime_type: Option<String>,
    pub url: Option<String>,
    pub step: Option<u32>,
}

impl Screenshot {
    /// Listing payload; binary data is base64-encoded only when asked for.
    pub fn to_public(&self, include_images: bool) -> Value {
        let mut payload = json!({
            "id": self.id,
            "timestamp": self.captured_at,
            "type": self.kind,
            "session_id": self.session_id,
            "has_error": self.has_error,
            "metadata": self.metadata,
            "mime_type": self.mime_type,
            "url": self.url,
            "step": self.step,
        });
        if include_images {
            if let Some(image) = &self.image {
                payload["image_data"] =
                    Value::String(base64::engine::general_purpose::STANDARD.encode(image));
            }
        }
        payload
    }
}

/// Inputs for recording one screenshot.
#[derive(Clone, Debug)]
pub struct NewScreenshot {
    pub kind: ScreenshotKind,
    pub image: Option<Vec<u8>>,
    pub mime_type: Option<String>,
    pub session_id: Option<SessionId>,
    pub captured_at: Option<f64>,
    pub has_error: bool,
    pub metadata: Value,
    pub url: Option<String>,
    pub step: Option<u32>,
}

impl NewScreenshot {
    pub fn new(kind: ScreenshotKind) -> Self {
        Self {
            kind,
            image: None,
            mime_type: None,
            session_id: None,
            captured_at: None,
            has_error: false,
            metadata: json!({}),
            url: None,
            step: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ScreenshotStoreConfig {
    /// Global FIFO cap across all kinds and sessions.
    pub max_screenshots: usize,
    /// Independent cap on `AgentStep` records per session.
    pub max_agent_steps_per_session: usize,
}

impl Default for ScreenshotStoreConfig {
    fn default() -> Self {
        Self {
            max_screenshots: 500,
            max_agent_steps_per_session: 50,
        }
    }
}

/// Filters for listing screenshots.
#[derive(Clone, Debug, Default)]
pub struct ScreenshotQuery {
    pub last_n: usize,
    pub kind: Option<ScreenshotKind>,
    pub session_id: Option<SessionId>,
    pub from_timestamp: Option<f64>,
    pub has_error: Option<bool>,
    pub include_images: bool,
}

struct Inner {
    items: VecDeque<Screenshot>,
    total_size_bytes: usize,
}

/// Bounded, thread-safe screenshot ring. Writers construct records fully
/// before insertion; the lock covers only the buffer mutation.
pub struct ScreenshotStore {
    config: ScreenshotStoreConfig,
    inner: Mutex<Inner>,
}

impl Default for ScreenshotStore {
    fn default() -> Self {
        Self::new(ScreenshotStoreConfig::default())
    }
}

impl ScreenshotStore {
    pub fn new(config: ScreenshotStoreConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                total_size_bytes: 0,
            }),
        }
    }

    /// Record a screenshot, evicting per capacity policy. Returns the
    /// stored record's id.
    pub fn record(&self, new: NewScreenshot) -> String {
        let shot = Screenshot {
            id: Uuid::now_v7().to_string(),
            captured_at: new.captured_at.unwrap_or_else(now_ts),
            kind: new.kind,
            session_id: new.session_id,
            has_error: new.has_error,
            metadata: new.metadata,
            image: new.image,
            mime_type: new.mime_type,
            url: new.url,
            step: new.step,
        };
        let id = shot.id.clone();

        let mut inner = self.inner.lock();
        if let Some(image) = &shot.image {
            inner.total_size_bytes += image.len();
        }
        let session = shot.session_id.clone();
        let is_step = shot.kind == ScreenshotKind::AgentStep;
        inner.items.push_back(shot);

        if is_step {
            if let Some(session) = session {
                self.evict_session_steps(&mut inner, &session);
            }
        }
        while inner.items.len() > self.config.max_screenshots {
            if let Some(evicted) = inner.items.pop_front() {
                if let Some(image) = &evicted.image {
                    inner.total_size_bytes =
                        inner.total_size_bytes.saturating_sub(image.len());
                }
            }
        }
        id
    }

    /// Evict the oldest `AgentStep` records for one session past its cap,
    /// leaving other sessions and kinds untouched.
    fn evict_session_steps(&self, inner: &mut Inner, session: &SessionId) {
        let cap = self.config.max_agent_steps_per_session;
        if cap == 0 {
            return;
        }
        loop {
            let count = inner
                .items
                .iter()
                .filter(|s| {
                    s.kind == ScreenshotKind::AgentStep && s.session_id.as_ref() == Some(session)
                })
                .count();
            if count <= cap {
                return;
            }
            let oldest = inner.items.iter().position(|s| {
                s.kind == ScreenshotKind::AgentStep && s.session_id.as_ref() == Some(session)
            });
            if let Some(index) = oldest {
                if let Some(evicted) = inner.items.remove(index) {
                    if let Some(image) = &evicted.image {
                        inner.total_size_bytes =
                            inner.total_size_bytes.saturating_sub(image.len());
                    }
                }
            } else {
                return;
            }
        }
    }

    /// List matching screenshots, oldest-first, capped to the last `last_n`.
    pub fn query(&self, query: &ScreenshotQuery) -> Vec<Value> {
        if query.last_n == 0 {
            return Vec::new();
        }
        let items: Vec<Screenshot> = {
            let inner = self.inner.lock();
            inner.items.iter().cloned().collect()
        };

        let filtered: Vec<&Screenshot> = items
            .iter()
            .filter(|shot| {
                if let Some(kind) = query.kind {
                    if shot.kind != kind {
                        return false;
                    }
                }
                if let Some(session) = &query.session_id {
                    if shot.session_id.as_ref() != Some(session) {
                        return false;
                    }
                }
                if let Some(from) = query.from_timestamp {
                    if shot.captured_at < from {
                        return false;
                    }
                }
                if let Some(has_error) = query.has_error {
                    if shot.has_error != has_error {
                        return false;
                    }
                }
                true
            })
            .collect();

        let skip = filtered.len().saturating_sub(query.last_n);
        filtered
            .into_iter()
            .skip(skip)
            .map(|shot| shot.to_public(query.include_images))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_size_bytes(&self) -> usize {
        self.inner.lock().total_size_bytes
    }
}
