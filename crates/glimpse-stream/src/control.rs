//! Control-handoff state machine shared between the gateway and the
//! driver runtime.

use glimpse_core::events::ControlSnapshot;
use glimpse_core::ids::SessionId;
use glimpse_core::time::now_ts;
use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    holder_sid: Option<String>,
    held_since_ts: Option<f64>,
    paused: bool,
    active_session_id: Option<SessionId>,
}

/// Who holds manual control and whether the driver is paused. At most
/// one holder; only the holder can pause or resume; every transition
/// that unpauses wakes all waiters.
#[derive(Default)]
pub struct ControlState {
    inner: Mutex<Inner>,
    unpaused: Notify,
}

impl ControlState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        let inner = self.inner.lock();
        ControlSnapshot {
            holder_sid: inner.holder_sid.clone(),
            held_since_ts: inner.held_since_ts,
            paused: inner.paused,
            active_session_id: inner.active_session_id.clone(),
        }
    }

    pub fn current_holder_sid(&self) -> Option<String> {
        self.inner.lock().holder_sid.clone()
    }

    pub fn is_holder(&self, sid: &str) -> bool {
        self.inner.lock().holder_sid.as_deref() == Some(sid)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    pub fn set_active_session(&self, session_id: Option<SessionId>) {
        self.inner.lock().active_session_id = session_id;
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.inner.lock().active_session_id.clone()
    }

    fn set_paused_locked(&self, inner: &mut Inner, paused: bool) {
        inner.paused = paused;
        if !paused {
            self.unpaused.notify_waiters();
        }
    }

    /// Drop holder and pause state, releasing any paused waiters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.holder_sid = None;
        inner.held_since_ts = None;
        self.set_paused_locked(&mut inner, false);
    }

    /// Acquire control if nobody holds it. Returns whether this sid is
    /// now the holder (idempotent for the current holder).
    pub fn take_control(&self, sid: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.holder_sid.is_none() {
            inner.holder_sid = Some(sid.to_string());
            inner.held_since_ts = Some(now_ts());
            self.set_paused_locked(&mut inner, false);
            return true;
        }
        inner.holder_sid.as_deref() == Some(sid)
    }

    /// Release control if `sid` is the holder. Unpauses either way the
    /// release succeeds.
    pub fn release_control(&self, sid: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.holder_sid.as_deref() != Some(sid) {
            return false;
        }
        inner.holder_sid = None;
        inner.held_since_ts = None;
        self.set_paused_locked(&mut inner, false);
        true
    }

    pub fn pause_if_holder(&self, sid: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.holder_sid.as_deref() != Some(sid) {
            return false;
        }
        self.set_paused_locked(&mut inner, true);
        true
    }

    pub fn resume_if_holder(&self, sid: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.holder_sid.as_deref() != Some(sid) {
            return false;
        }
        self.set_paused_locked(&mut inner, false);
        true
    }

    /// Block the caller until control is unpaused. Returns immediately
    /// when not paused; safe for any number of concurrent waiters.
    pub async fn wait_until_unpaused(&self) {
        loop {
            // Register interest before checking so a resume between the
            // check and the await cannot be missed.
            let notified = self.unpaused.notified();
            if !self.is_paused() {
                return;
            }
            notified.await;
        }
    }
}
