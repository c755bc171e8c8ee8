//! In-memory metrics for the streaming pipeline.

use glimpse_core::ids::SessionId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingMode {
    Cdp,
    Screenshot,
}

impl std::fmt::Display for StreamingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cdp => f.write_str("cdp"),
            Self::Screenshot => f.write_str("screenshot"),
        }
    }
}

impl std::str::FromStr for StreamingMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cdp" => Ok(Self::Cdp),
            "screenshot" => Ok(Self::Screenshot),
            other => Err(format!("unknown streaming mode: {other}")),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct SamplerTotals {
    pub frames_seen: u64,
    pub frames_stored: u64,
}

/// Point-in-time view served from `/healthz`.
#[derive(Clone, Debug, Serialize)]
pub struct StatsSnapshot {
    pub streaming_mode: StreamingMode,
    pub cdp_available: bool,
    pub active_run_session_id: Option<SessionId>,
    pub active_cdp_session_id: Option<String>,
    pub last_cdp_error: Option<String>,
    pub frame_latency_ms: Option<f64>,
    pub frames_dropped: u64,
    pub last_frame_ts: Option<f64>,
    pub last_frame_received_ts: Option<f64>,
    pub last_frame_seq: Option<u64>,
    pub frame_queue_max: usize,
    pub frames_received: u64,
    pub frames_emitted: u64,
    pub sampler_totals: SamplerTotals,
}

#[derive(Default)]
struct Inner {
    cdp_available: bool,
    active_run_session_id: Option<SessionId>,
    active_cdp_session_id: Option<String>,
    last_cdp_error: Option<String>,
    frames_received: u64,
    frames_emitted: u64,
    frames_dropped: u64,
    last_frame_received_ts: Option<f64>,
    last_frame_emitted_ts: Option<f64>,
    last_frame_latency_ms: Option<f64>,
    last_frame_seq: Option<u64>,
    sampler_frames_seen: u64,
    sampler_frames_stored: u64,
}

pub struct StreamingStats {
    mode: StreamingMode,
    frame_queue_max: usize,
    inner: Mutex<Inner>,
}

impl StreamingStats {
    pub fn new(mode: StreamingMode, frame_queue_max: usize) -> Self {
        Self {
            mode,
            frame_queue_max,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn streaming_mode(&self) -> StreamingMode {
        self.mode
    }

    pub fn note_frame_received(&self, seq: u64, received_ts: f64) {
        let mut inner = self.inner.lock();
        inner.frames_received += 1;
        inner.last_frame_received_ts = Some(received_ts);
        inner.last_frame_seq = Some(seq);
    }

    pub fn note_frame_dropped(&self) {
        self.inner.lock().frames_dropped += 1;
    }

    pub fn note_frame_emitted(&self, emitted_ts: f64, latency_ms: Option<f64>) {
        let mut inner = self.inner.lock();
        inner.frames_emitted += 1;
        inner.last_frame_emitted_ts = Some(emitted_ts);
        inner.last_frame_latency_ms = latency_ms;
    }

    pub fn note_sampler_seen(&self) {
        self.inner.lock().sampler_frames_seen += 1;
    }

    pub fn note_sampler_stored(&self) {
        self.inner.lock().sampler_frames_stored += 1;
    }

    pub fn note_cdp_attached(&self, run_session_id: &SessionId, cdp_session_id: &str) {
        let mut inner = self.inner.lock();
        inner.cdp_available = true;
        inner.active_run_session_id = Some(run_session_id.clone());
        inner.active_cdp_session_id = Some(cdp_session_id.to_string());
        inner.last_cdp_error = None;
    }

    pub fn note_cdp_detached(&self, error: Option<String>) {
        let mut inner = self.inner.lock();
        inner.cdp_available = false;
        inner.active_run_session_id = None;
        inner.active_cdp_session_id = None;
        if let Some(error) = error {
            inner.last_cdp_error = Some(error);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock();
        StatsSnapshot {
            streaming_mode: self.mode,
            cdp_available: inner.cdp_available,
            active_run_session_id: inner.active_run_session_id.clone(),
            active_cdp_session_id: inner.active_cdp_session_id.clone(),
            last_cdp_error: inner.last_cdp_error.clone(),
            frame_latency_ms: inner.last_frame_latency_ms,
            frames_dropped: inner.frames_dropped,
            last_frame_ts: inner.last_frame_emitted_ts,
            last_frame_received_ts: inner.last_frame_received_ts,
            last_frame_seq: inner.last_frame_seq,
            frame_queue_max: self.frame_queue_max,
            frames_received: inner.frames_received,
            frames_emitted: inner.frames_emitted,
            sampler_totals: SamplerTotals {
                frames_seen: inner.sampler_frames_seen,
                frames_stored: inner.sampler_frames_stored,
            },
        }
    }
}
