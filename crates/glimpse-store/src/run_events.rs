use std::collections::{HashMap, VecDeque};

use glimpse_core::ids::SessionId;
use glimpse_core::truncate::truncate_with_ellipsis;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Run event categories. Capacity is tracked per (session, kind).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    Agent,
    Console,
    Network,
}

impl std::fmt::Display for RunEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => f.write_str("agent"),
            Self::Console => f.write_str("console"),
            Self::Network => f.write_str("network"),
        }
    }
}

impl std::str::FromStr for RunEventKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "agent" => Ok(Self::Agent),
            "console" => Ok(Self::Console),
            "network" => Ok(Self::Network),
            other => Err(format!("unknown run event type: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunEventConfig {
    pub max_sessions: usize,
    pub max_agent_events: usize,
    pub max_console_events: usize,
    pub max_network_events: usize,
    pub max_url_len: usize,
    pub max_message_len: usize,
    pub max_summary_len: usize,
}

impl Default for RunEventConfig {
    fn default() -> Self {
        Self {
            max_sessions: 50,
            max_agent_events: 200,
            max_console_events: 200,
            max_network_events: 500,
            max_url_len: 1000,
            max_message_len: 2000,
            max_summary_len: 1000,
        }
    }
}

/// One append-only run event. String fields are truncated at insert.
#[derive(Clone, Debug, Serialize)]
pub struct RunEvent {
    pub session_id: SessionId,
    #[serde(rename = "event_type")]
    pub kind: RunEventKind,
    pub timestamp: f64,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub has_error: bool,
}

struct SessionEvents {
    created_at: f64,
    agent: VecDeque<RunEvent>,
    console: VecDeque<RunEvent>,
    network: VecDeque<RunEvent>,
    dropped: HashMap<RunEventKind, u64>,
}

impl SessionEvents {
    fn new(created_at: f64) -> Self {
        Self {
            created_at,
            agent: VecDeque::new(),
            console: VecDeque::new(),
            network: VecDeque::new(),
            dropped: HashMap::new(),
        }
    }

    fn ring_mut(&mut self, kind: RunEventKind) -> &mut VecDeque<RunEvent> {
        match kind {
            RunEventKind::Agent => &mut self.agent,
            RunEventKind::Console => &mut self.console,
            RunEventKind::Network => &mut self.network,
        }
    }
}

/// Query parameters; `last_n` is clamped to 200.
#[derive(Clone, Debug)]
pub struct RunEventQuery {
    pub session_id: Option<SessionId>,
    pub last_n: usize,
    pub kinds: Option<Vec<RunEventKind>>,
    pub from_timestamp: Option<f64>,
    pub has_error: Option<bool>,
    pub include_details: bool,
}

impl Default for RunEventQuery {
    fn default() -> Self {
        Self {
            session_id: None,
            last_n: 50,
            kinds: None,
            from_timestamp: None,
            has_error: None,
            include_details: false,
        }
    }
}

/// Aggregate counts over a query result.
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct RunEventCounts {
    pub agent: usize,
    pub console: usize,
    pub network: usize,
    pub total: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunEventPage {
    pub events: Vec<RunEvent>,
    pub counts: RunEventCounts,
    pub oldest_timestamp: Option<f64>,
    pub newest_timestamp: Option<f64>,
}

const MAX_QUERY_EVENTS: usize = 200;

/// Bounded per-(session, kind) run event rings. Events for sessions that
/// were never registered are dropped silently so late-arriving events
/// from a cleaned-up session never error.
pub struct RunEventStore {
    config: RunEventConfig,
    sessions: Mutex<HashMap<SessionId, SessionEvents>>,
}

impl Default for RunEventStore {
    fn default() -> Self {
        Self::new(RunEventConfig::default())
    }
}

impl RunEventStore {
    pub fn new(config: RunEventConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a session so its events are accepted. Idempotent.
    pub fn register_session(&self, session_id: &SessionId, created_at: f64) {
        let mut sessions = self.sessions.lock();
        sessions
            .entry(session_id.clone())
            .or_insert_with(|| SessionEvents::new(created_at));
        self.prune_locked(&mut sessions);
    }

    fn prune_locked(&self, sessions: &mut HashMap<SessionId, SessionEvents>) {
        let max = self.config.max_sessions;
        if max == 0 {
            sessions.clear();
            return;
        }
        while sessions.len() > max {
            let oldest = sessions
                .iter()
                .min_by(|a, b| {
                    a.1.created_at
                        .partial_cmp(&b.1.created_at)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    sessions.remove(&id);
                }
                None => return,
            }
        }
    }

    fn cap_for(&self, kind: RunEventKind) -> usize {
        match kind {
            RunEventKind::Agent => self.config.max_agent_events,
            RunEventKind::Console => self.config.max_console_events,
            RunEventKind::Network => self.config.max_network_events,
        }
    }

    fn sanitize_details(&self, details: Option<Value>) -> Option<Value> {
        let Value::Object(map) = details? else {
            return None;
        };
        let mut safe = Map::new();
        for (key, value) in map {
            match value {
                Value::Null => {}
                Value::String(s) => {
                    safe.insert(
                        key,
                        Value::String(truncate_with_ellipsis(&s, self.config.max_message_len)),
                    );
                }
                other => {
                    safe.insert(key, other);
                }
            }
        }
        if safe.is_empty() {
            None
        } else {
            Some(Value::Object(safe))
        }
    }

    /// Append one event, truncating string fields and evicting the oldest
    /// record of the same kind once the ring is full.
    pub fn record(
        &self,
        session_id: &SessionId,
        kind: RunEventKind,
        timestamp: f64,
        summary: &str,
        details: Option<Value>,
        has_error: bool,
    ) {
        let event = RunEvent {
            session_id: session_id.clone(),
            kind,
            timestamp,
            summary: truncate_with_ellipsis(summary, self.config.max_summary_len),
            details: self.sanitize_details(details),
            has_error,
        };

        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(session_id) else {
            tracing::debug!(session_id = %session_id, "dropping event for unregistered session");
            return;
        };
        let cap = self.cap_for(kind);
        let ring = session.ring_mut(kind);
        if cap > 0 && ring.len() >= cap {
            ring.pop_front();
            *session.dropped.entry(kind).or_insert(0) += 1;
        }
        session.ring_mut(kind).push_back(event);
    }

    /// Agent step marker carrying the step number, page url and title.
    pub fn record_agent_step(
        &self,
        session_id: &SessionId,
        timestamp: f64,
        step: Option<u32>,
        url: Option<&str>,
        title: Option<&str>,
        summary: &str,
        has_error: bool,
    ) {
        let mut details = Map::new();
        if let Some(step) = step {
            details.insert("step".into(), Value::from(step));
        }
        if let Some(url) = url {
            details.insert(
                "url".into(),
                Value::String(truncate_with_ellipsis(url, self.config.max_url_len)),
            );
        }
        if let Some(title) = title {
            details.insert(
                "title".into(),
                Value::String(truncate_with_ellipsis(title, self.config.max_summary_len)),
            );
        }
        let details = if details.is_empty() {
            None
        } else {
            Some(Value::Object(details))
        };
        self.record(
            session_id,
            RunEventKind::Agent,
            timestamp,
            summary,
            details,
            has_error,
        );
    }

    /// Console message; error status inferred from the level.
    pub fn record_console(
        &self,
        session_id: &SessionId,
        timestamp: f64,
        level: &str,
        message: &str,
        location: Option<Value>,
    ) {
        let safe_level = truncate_with_ellipsis(level, 50);
        let has_error = matches!(safe_level.as_str(), "error" | "exception" | "fatal");
        let mut details = Map::new();
        details.insert("level".into(), Value::String(safe_level));
        if let Some(location) = location {
            details.insert("location".into(), location);
        }
        self.record(
            session_id,
            RunEventKind::Console,
            timestamp,
            message,
            Some(Value::Object(details)),
            has_error,
        );
    }

    /// Network request outcome; never carries response bodies.
    #[allow(clippy::too_many_arguments)]
    pub fn record_network(
        &self,
        session_id: &SessionId,
        timestamp: f64,
        method: &str,
        url: &str,
        status: Option<u16>,
        duration_ms: Option<f64>,
        error: Option<&str>,
    ) {
        let safe_method = truncate_with_ellipsis(method, 20);
        let safe_url = truncate_with_ellipsis(url, self.config.max_url_len);
        let mut details = Map::new();
        details.insert("method".into(), Value::String(safe_method.clone()));
        details.insert("url".into(), Value::String(safe_url.clone()));
        if let Some(status) = status {
            details.insert("status".into(), Value::from(status));
        }
        if let Some(duration_ms) = duration_ms {
            details.insert("duration_ms".into(), Value::from(duration_ms));
        }
        if let Some(error) = error {
            details.insert(
                "error".into(),
                Value::String(truncate_with_ellipsis(error, self.config.max_message_len)),
            );
        }
        let has_error = error.is_some() || status.is_some_and(|s| s >= 400);
        let summary = format!("{safe_method} {safe_url}");
        self.record(
            session_id,
            RunEventKind::Network,
            timestamp,
            summary.trim(),
            Some(Value::Object(details)),
            has_error,
        );
    }

    /// Newest-first filtered page of events plus aggregate counts.
    pub fn query(&self, query: &RunEventQuery) -> RunEventPage {
        let last_n = query.last_n.min(MAX_QUERY_EVENTS);
        let sessions = self.sessions.lock();

        let mut events: Vec<RunEvent> = Vec::new();
        for (id, session) in sessions.iter() {
            if let Some(wanted) = &query.session_id {
                if wanted != id {
                    continue;
                }
            }
            for event in session
                .agent
                .iter()
                .chain(session.console.iter())
                .chain(session.network.iter())
            {
                if let Some(kinds) = &query.kinds {
                    if !kinds.contains(&event.kind) {
                        continue;
                    }
                }
                if let Some(from) = query.from_timestamp {
                    if event.timestamp < from {
                        continue;
                    }
                }
                if let Some(has_error) = query.has_error {
                    if event.has_error != has_error {
                        continue;
                    }
                }
                let mut event = event.clone();
                if !query.include_details {
                    event.details = None;
                }
                events.push(event);
            }
        }
        drop(sessions);

        events.sort_by(|a, b| {
            b.timestamp
                .partial_cmp(&a.timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        events.truncate(last_n);

        let mut counts = RunEventCounts::default();
        let mut oldest: Option<f64> = None;
        let mut newest: Option<f64> = None;
        for event in &events {
            match event.kind {
                RunEventKind::Agent => counts.agent += 1,
                RunEventKind::Console => counts.console += 1,
                RunEventKind::Network => counts.network += 1,
            }
            counts.total += 1;
            oldest = Some(oldest.map_or(event.timestamp, |v: f64| v.min(event.timestamp)));
            newest = Some(newest.map_or(event.timestamp, |v: f64| v.max(event.timestamp)));
        }

        RunEventPage {
            events,
            counts,
            oldest_timestamp: oldest,
            newest_timestamp: newest,
        }
    }

    /// Stored (not query-filtered) counts for one session.
    pub fn counts(&self, session_id: &SessionId) -> RunEventCounts {
        let sessions = self.sessions.lock();
        match sessions.get(session_id) {
            None => RunEventCounts::default(),
            Some(session) => RunEventCounts {
                agent: session.agent.len(),
                console: session.console.len(),
                network: session.network.len(),
                total: session.agent.len() + session.console.len() + session.network.len(),
            },
        }
    }

    /// Events dropped to capacity for one (session, kind).
    pub fn dropped(&self, session_id: &SessionId, kind: RunEventKind) -> u64 {
        let sessions = self.sessions.lock();
        sessions
            .get(session_id)
            .and_then(|s| s.dropped.get(&kind).copied())
            .unwrap_or(0)
    }
}
