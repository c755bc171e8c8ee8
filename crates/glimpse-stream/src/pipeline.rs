//! Screencast frame pipeline: attach to the focused page, ack and
//! enqueue frames, emit them to subscribers, and sample a bounded
//! history into the screenshot store.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use glimpse_core::errors::CdpError;
use glimpse_core::events::{FramePayload, StreamEvent};
use glimpse_core::ids::SessionId;
use glimpse_core::time::now_ts;
use glimpse_core::truncate::truncate_with_ellipsis;
use glimpse_cdp::session::CdpSession;
use glimpse_store::{NewScreenshot, ScreenshotKind, ScreenshotStore};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::stats::StreamingStats;

pub const DEFAULT_FRAME_QUEUE_MAX: usize = 2;
pub const DEFAULT_FOCUS_POLL_SECS: f64 = 0.75;
const MIN_FOCUS_POLL_SECS: f64 = 0.2;
const MAX_ERROR_LEN: usize = 200;

/// Yields the currently focused page as a live session handle plus its
/// CDP session id. Polled by the focus-follow loop.
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn acquire(&self) -> Result<(Arc<dyn CdpSession>, String), CdpError>;
}

/// Encoding presets traded against bandwidth. The sampler cadence
/// scales with quality so the stored history stays roughly constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quality {
    Low,
    Medium,
    High,
}

impl Quality {
    pub fn cdp_params(self) -> Value {
        match self {
            Self::Low => json!({"format": "jpeg", "quality": 35, "maxWidth": 800, "maxHeight": 600}),
            Self::Medium => {
                json!({"format": "jpeg", "quality": 60, "maxWidth": 1280, "maxHeight": 720})
            }
            Self::High => {
                json!({"format": "jpeg", "quality": 80, "maxWidth": 1920, "maxHeight": 1080})
            }
        }
    }

    /// Every n-th emitted frame is persisted (plus frame 1).
    pub fn sample_every_n(self) -> u64 {
        match self {
            Self::Low => 15,
            Self::Medium => 10,
            Self::High => 5,
        }
    }
}

impl std::str::FromStr for Quality {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" | "med" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown quality preset: {other}")),
        }
    }
}

struct CdpFrame {
    seq: u64,
    session_id: SessionId,
    received_ts: f64,
    data_base64: String,
    metadata: Value,
}

/// A frame as it arrived, paired with what the ack loop needs to
/// acknowledge it against the right target.
struct InboundFrame {
    ack_id: Option<Value>,
    session: Arc<dyn CdpSession>,
    cdp_session_id: String,
    frame: CdpFrame,
}

#[derive(Default)]
struct ActiveTarget {
    run_session: Option<SessionId>,
    cdp_session_id: Option<String>,
    session: Option<Arc<dyn CdpSession>>,
}

struct Shared {
    running: AtomicBool,
    seq: AtomicU64,
    active: Mutex<ActiveTarget>,
    inbound: Mutex<Option<mpsc::UnboundedSender<InboundFrame>>>,
    frame_tx: Mutex<Option<mpsc::Sender<CdpFrame>>>,
    registered: Mutex<Vec<Weak<dyn CdpSession>>>,
    stats: Arc<StreamingStats>,
}

impl Shared {
    /// Screencast frame arrival. Runs synchronously on the event
    /// delivery path; seq assignment and the arrival-queue push share
    /// one lock so seq order, queue order, and ack order all agree.
    fn on_frame(&self, params: Value, cdp_session_id: Option<&str>) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let (run_session, active_cdp_id, session) = {
            let active = self.active.lock();
            (
                active.run_session.clone(),
                active.cdp_session_id.clone(),
                active.session.clone(),
            )
        };
        let (Some(run_session), Some(active_cdp_id), Some(session)) =
            (run_session, active_cdp_id, session)
        else {
            return;
        };
        if cdp_session_id != Some(active_cdp_id.as_str()) {
            return;
        }

        let mut metadata = json!({"cdp_session_id": active_cdp_id});
        if let Some(extra) = params.get("metadata").and_then(Value::as_object) {
            for (key, value) in extra {
                metadata[key] = value.clone();
            }
        }
        let ack_id = params.get("sessionId").cloned().filter(|v| !v.is_null());
        let data_base64 = params
            .get("data")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let inbound = self.inbound.lock();
        let Some(tx) = inbound.as_ref() else {
            return;
        };
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let received_ts = now_ts();
        self.stats.note_frame_received(seq, received_ts);
        let _ = tx.send(InboundFrame {
            ack_id,
            session,
            cdp_session_id: active_cdp_id,
            frame: CdpFrame {
                seq,
                session_id: run_session,
                received_ts,
                data_base64,
                metadata,
            },
        });
    }
}

/// Single consumer of the arrival queue: acks every frame in the order
/// it arrived (even frames the emit queue will drop), then enqueues
/// with drop-newest overflow.
async fn ack_loop(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<InboundFrame>) {
    while let Some(inbound) = rx.recv().await {
        if let Some(ack_id) = inbound.ack_id {
            if let Err(error) = inbound
                .session
                .send(
                    "Page.screencastFrameAck",
                    Some(json!({"sessionId": ack_id})),
                    Some(&inbound.cdp_session_id),
                )
                .await
            {
                tracing::debug!(
                    seq = inbound.frame.seq,
                    error = %error,
                    kind = error.error_kind(),
                    "failed to ack screencast frame"
                );
            }
        }

        let tx = shared.frame_tx.lock().clone();
        if let Some(tx) = tx {
            if tx.try_send(inbound.frame).is_err() {
                shared.stats.note_frame_dropped();
            }
        }
    }
}

fn register_frame_handler(shared: &Arc<Shared>, session: &Arc<dyn CdpSession>) {
    let mut registered = shared.registered.lock();
    registered.retain(|weak| weak.upgrade().is_some());
    if registered
        .iter()
        .any(|weak| weak.upgrade().is_some_and(|live| Arc::ptr_eq(&live, session)))
    {
        return;
    }
    registered.push(Arc::downgrade(session));
    drop(registered);

    let shared = Arc::clone(shared);
    session.on(
        "Page.screencastFrame",
        Arc::new(move |params, cdp_session_id| {
            shared.on_frame(params, cdp_session_id);
        }),
    );
}

#[derive(Default)]
struct Tasks {
    acker: Option<JoinHandle<()>>,
    sender: Option<JoinHandle<()>>,
    focus: Option<JoinHandle<()>>,
}

/// Drives one screencast at a time. `start` swaps out any previous run;
/// `stop` with a session id is ignored unless that session is active.
pub struct ScreencastStreamer {
    quality: Quality,
    frame_queue_max: usize,
    focus_poll: Duration,
    shared: Arc<Shared>,
    stats: Arc<StreamingStats>,
    screenshots: Arc<ScreenshotStore>,
    events: broadcast::Sender<StreamEvent>,
    lifecycle: tokio::sync::Mutex<Tasks>,
}

impl ScreencastStreamer {
    pub fn new(
        quality: Quality,
        frame_queue_max: usize,
        focus_poll_secs: f64,
        stats: Arc<StreamingStats>,
        screenshots: Arc<ScreenshotStore>,
        events: broadcast::Sender<StreamEvent>,
    ) -> Self {
        Self {
            quality,
            frame_queue_max: frame_queue_max.max(1),
            focus_poll: Duration::from_secs_f64(focus_poll_secs.max(MIN_FOCUS_POLL_SECS)),
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                seq: AtomicU64::new(0),
                active: Mutex::new(ActiveTarget::default()),
                inbound: Mutex::new(None),
                frame_tx: Mutex::new(None),
                registered: Mutex::new(Vec::new()),
                stats: Arc::clone(&stats),
            }),
            stats,
            screenshots,
            events,
            lifecycle: tokio::sync::Mutex::new(Tasks::default()),
        }
    }

    pub fn events(&self) -> broadcast::Sender<StreamEvent> {
        self.events.clone()
    }

    /// Attach to the focused page and begin streaming for `session_id`.
    /// Any previous run is stopped first; the sequence counter restarts
    /// at 1.
    pub async fn start(
        self: &Arc<Self>,
        source: Arc<dyn SessionSource>,
        session_id: SessionId,
    ) -> Result<(), CdpError> {
        let mut tasks = self.lifecycle.lock().await;
        self.stop_tasks(&mut tasks).await;

        let (session, cdp_session_id) = source.acquire().await?;
        register_frame_handler(&self.shared, &session);

        {
            let mut active = self.shared.active.lock();
            active.run_session = Some(session_id.clone());
            active.cdp_session_id = Some(cdp_session_id.clone());
            active.session = Some(Arc::clone(&session));
        }
        self.shared.seq.store(0, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.frame_queue_max);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        *self.shared.frame_tx.lock() = Some(tx);
        *self.shared.inbound.lock() = Some(inbound_tx);
        self.shared.running.store(true, Ordering::SeqCst);

        if let Err(error) = session
            .send(
                "Page.startScreencast",
                Some(self.quality.cdp_params()),
                Some(&cdp_session_id),
            )
            .await
        {
            self.shared.running.store(false, Ordering::SeqCst);
            *self.shared.active.lock() = ActiveTarget::default();
            *self.shared.inbound.lock() = None;
            *self.shared.frame_tx.lock() = None;
            return Err(error);
        }

        self.stats.note_cdp_attached(&session_id, &cdp_session_id);
        tasks.acker = Some(tokio::spawn(ack_loop(
            Arc::clone(&self.shared),
            inbound_rx,
        )));
        tasks.sender = Some(tokio::spawn(sender_loop(
            rx,
            session_id.clone(),
            self.quality.sample_every_n(),
            self.events.clone(),
            Arc::clone(&self.stats),
            Arc::clone(&self.screenshots),
        )));
        tasks.focus = Some(tokio::spawn(focus_loop(
            Arc::clone(self),
            source,
            session_id.clone(),
        )));
        tracing::info!(session_id = %session_id, cdp_session_id = %cdp_session_id, "screencast started");
        Ok(())
    }

    /// Stop streaming. When `session_id` is given and a different run is
    /// active, this is a stale stop and does nothing.
    pub async fn stop(&self, session_id: Option<&SessionId>) {
        let mut tasks = self.lifecycle.lock().await;
        if let Some(session_id) = session_id {
            let active = self.shared.active.lock().run_session.clone();
            if let Some(active) = active {
                if &active != session_id {
                    tracing::debug!(
                        requested = %session_id,
                        active = %active,
                        "ignoring stale screencast stop"
                    );
                    return;
                }
            }
        }
        self.stop_tasks(&mut tasks).await;
    }

    async fn stop_tasks(&self, tasks: &mut Tasks) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            *self.shared.active.lock() = ActiveTarget::default();
            *self.shared.inbound.lock() = None;
            *self.shared.frame_tx.lock() = None;
            return;
        }

        let (run_session, cdp_session_id, session) = {
            let mut active = self.shared.active.lock();
            (
                active.run_session.take(),
                active.cdp_session_id.take(),
                active.session.take(),
            )
        };
        *self.shared.inbound.lock() = None;
        *self.shared.frame_tx.lock() = None;

        for handle in [tasks.focus.take(), tasks.acker.take(), tasks.sender.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
            let _ = handle.await;
        }

        if let (Some(session), Some(cdp_session_id)) = (session, cdp_session_id) {
            if let Err(error) = session
                .send("Page.stopScreencast", None, Some(&cdp_session_id))
                .await
            {
                tracing::warn!(error = %error, kind = error.error_kind(), "failed to stop screencast");
            }
        }

        self.stats.note_cdp_detached(None);
        if let Some(run_session) = run_session {
            tracing::info!(session_id = %run_session, "screencast stopped");
        }
    }
}

async fn sender_loop(
    mut rx: mpsc::Receiver<CdpFrame>,
    session_id: SessionId,
    sample_every_n: u64,
    events: broadcast::Sender<StreamEvent>,
    stats: Arc<StreamingStats>,
    screenshots: Arc<ScreenshotStore>,
) {
    let sample_every_n = sample_every_n.max(1);
    while let Some(frame) = rx.recv().await {
        let emitted_ts = now_ts();
        let latency_ms = (emitted_ts - frame.received_ts) * 1000.0;

        let payload = FramePayload {
            seq: frame.seq,
            session_id: frame.session_id.clone(),
            received_ts: frame.received_ts,
            emitted_ts,
            latency_ms,
            data_base64: frame.data_base64.clone(),
            metadata: frame.metadata.clone(),
        };
        let _ = events.send(StreamEvent::Frame(payload));
        stats.note_frame_emitted(emitted_ts, Some(latency_ms));

        let should_sample =
            !frame.data_base64.is_empty() && (frame.seq == 1 || frame.seq % sample_every_n == 0);
        if should_sample {
            stats.note_sampler_seen();
            match base64::engine::general_purpose::STANDARD.decode(&frame.data_base64) {
                Ok(image) => {
                    let mut sample = NewScreenshot::new(ScreenshotKind::StreamSample);
                    sample.image = Some(image);
                    sample.mime_type = Some("image/jpeg".to_string());
                    sample.session_id = Some(session_id.clone());
                    sample.captured_at = Some(emitted_ts);
                    sample.metadata = json!({
                        "seq": frame.seq,
                        "latency_ms": latency_ms,
                        "streaming_mode": "cdp",
                    });
                    screenshots.record(sample);
                    stats.note_sampler_stored();
                }
                Err(error) => {
                    tracing::warn!(seq = frame.seq, error = %error, "failed to decode sampled frame");
                }
            }
        }

        tracing::debug!(seq = frame.seq, latency_ms, "emitted screencast frame");
    }
}

/// Follows page focus: when the source yields a different CDP session,
/// the screencast swaps over to it. Transient acquire failures are
/// skipped; the loop ends when the run stops.
async fn focus_loop(
    streamer: Arc<ScreencastStreamer>,
    source: Arc<dyn SessionSource>,
    run_session_id: SessionId,
) {
    loop {
        tokio::time::sleep(streamer.focus_poll).await;
        if !streamer.shared.running.load(Ordering::SeqCst) {
            return;
        }
        if streamer.shared.active.lock().run_session.as_ref() != Some(&run_session_id) {
            return;
        }

        let Ok((session, cdp_session_id)) = source.acquire().await else {
            continue;
        };

        let _guard = streamer.lifecycle.lock().await;
        if !streamer.shared.running.load(Ordering::SeqCst) {
            return;
        }
        let (active_run, active_cdp, previous) = {
            let active = streamer.shared.active.lock();
            (
                active.run_session.clone(),
                active.cdp_session_id.clone(),
                active.session.clone(),
            )
        };
        if active_run.as_ref() != Some(&run_session_id) {
            return;
        }
        if active_cdp.as_deref() == Some(cdp_session_id.as_str()) {
            continue;
        }

        if let (Some(previous), Some(previous_id)) = (previous, active_cdp) {
            if let Err(error) = previous
                .send("Page.stopScreencast", None, Some(&previous_id))
                .await
            {
                tracing::debug!(
                    error = %error,
                    kind = error.error_kind(),
                    "failed to stop screencast during focus switch"
                );
            }
        }

        register_frame_handler(&streamer.shared, &session);
        match session
            .send(
                "Page.startScreencast",
                Some(streamer.quality.cdp_params()),
                Some(&cdp_session_id),
            )
            .await
        {
            Err(error) => {
                streamer
                    .stats
                    .note_cdp_detached(Some(truncate_with_ellipsis(
                        &error.to_string(),
                        MAX_ERROR_LEN,
                    )));
                let mut active = streamer.shared.active.lock();
                active.session = None;
                active.cdp_session_id = None;
            }
            Ok(_) => {
                {
                    let mut active = streamer.shared.active.lock();
                    active.session = Some(Arc::clone(&session));
                    active.cdp_session_id = Some(cdp_session_id.clone());
                }
                streamer
                    .stats
                    .note_cdp_attached(&run_session_id, &cdp_session_id);
                tracing::info!(
                    session_id = %run_session_id,
                    cdp_session_id = %cdp_session_id,
                    "screencast focus switched"
                );
            }
        }
    }
}
