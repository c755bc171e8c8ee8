//! Nonce handshake, HMAC signature verification, and fixed-window
//! rate limiting for viewer connections.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use glimpse_core::time::now_ts;
use glimpse_telemetry::AuditSink;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::RngCore;
use serde::Serialize;
use serde_json::json;
use sha2::Sha256;

use crate::config::GateConfig;

type HmacSha256 = Hmac<Sha256>;

/// Compute the hex signature a client must present for a nonce.
pub fn sign_nonce(api_key: &str, nonce: &str) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(api_key.as_bytes()) else {
        return String::new();
    };
    mac.update(nonce.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn signature_matches(api_key: &str, nonce: &str, sig_hex: &str) -> bool {
    let Ok(sig) = hex::decode(sig_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(api_key.as_bytes()) else {
        return false;
    };
    mac.update(nonce.as_bytes());
    // Constant-time comparison.
    mac.verify_slice(&sig).is_ok()
}

#[derive(Clone, Debug, Serialize)]
pub struct IssuedNonce {
    pub nonce: String,
    pub expires_at: f64,
}

#[derive(Clone, Copy)]
struct NonceRecord {
    expires_at: f64,
    uses_left: u32,
}

/// Single-issuer nonce table. Each nonce expires after a TTL and a
/// bounded number of successful validations.
pub struct NonceStore {
    ttl_seconds: u64,
    uses: u32,
    nonces: Mutex<HashMap<String, NonceRecord>>,
}

impl NonceStore {
    pub fn new(ttl_seconds: u64, uses: u32) -> Self {
        Self {
            ttl_seconds,
            uses,
            nonces: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_config(config: &GateConfig) -> Self {
        Self::new(config.nonce_ttl_seconds, config.nonce_uses)
    }

    pub fn issue(&self) -> IssuedNonce {
        let now = now_ts();
        let mut raw = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut raw);
        let nonce = URL_SAFE_NO_PAD.encode(raw);
        let expires_at = now + self.ttl_seconds as f64;

        let mut nonces = self.nonces.lock();
        nonces.insert(
            nonce.clone(),
            NonceRecord {
                expires_at,
                uses_left: self.uses,
            },
        );
        Self::gc(&mut nonces, now);
        IssuedNonce { nonce, expires_at }
    }

    /// Check expiry, remaining uses, and the HMAC signature; burns one
    /// use on success. A bad signature does not consume a use.
    pub fn validate(&self, nonce: &str, sig_hex: &str, api_key: &str) -> bool {
        let now = now_ts();
        let mut nonces = self.nonces.lock();
        let Some(record) = nonces.get(nonce).copied() else {
            return false;
        };
        if record.expires_at < now || record.uses_left == 0 {
            nonces.remove(nonce);
            Self::gc(&mut nonces, now);
            return false;
        }
        if !signature_matches(api_key, nonce, sig_hex) {
            return false;
        }
        let uses_left = record.uses_left - 1;
        if uses_left == 0 {
            nonces.remove(nonce);
        } else if let Some(entry) = nonces.get_mut(nonce) {
            entry.uses_left = uses_left;
        }
        Self::gc(&mut nonces, now);
        true
    }

    fn gc(nonces: &mut HashMap<String, NonceRecord>, now: f64) {
        nonces.retain(|_, record| record.expires_at >= now);
    }

    pub fn len(&self) -> usize {
        self.nonces.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn force_expire(&self, nonce: &str) {
        if let Some(record) = self.nonces.lock().get_mut(nonce) {
            record.expires_at = now_ts() - 1.0;
        }
    }
}

/// Fixed-window counter. Exceeding the max denies the event; the
/// window resets once its length has elapsed.
pub struct FixedWindowRateLimiter {
    window: Duration,
    max_events: u32,
    state: Mutex<HashMap<String, (Instant, u32)>>,
}

impl FixedWindowRateLimiter {
    pub fn new(window: Duration, max_events: u32) -> Self {
        Self {
            window,
            max_events,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn per_minute(max_events: u32) -> Self {
        Self::new(Duration::from_secs(60), max_events)
    }

    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        let entry = state.entry(key.to_string()).or_insert((now, 0));
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        entry.1 += 1;
        entry.1 <= self.max_events
    }
}

/// Connection-time credentials presented as query parameters.
#[derive(Clone, Debug, Default, serde::Deserialize)]
pub struct ConnectAuth {
    pub nonce: Option<String>,
    pub sig: Option<String>,
}

impl ConnectAuth {
    fn is_absent(&self) -> bool {
        self.nonce.is_none() && self.sig.is_none()
    }
}

/// Gate a new viewer connection. Every denial lands in the audit sink
/// with a stable reason code.
#[allow(clippy::too_many_arguments)]
pub fn authorize_connection(
    config: &GateConfig,
    nonces: &NonceStore,
    connect_limiter: &FixedWindowRateLimiter,
    audit: &AuditSink,
    namespace: &str,
    sid: &str,
    origin: Option<&str>,
    ip: Option<&str>,
    auth: &ConnectAuth,
) -> bool {
    let deny = |reason: &str| {
        audit.record(
            reason,
            json!({"namespace": namespace, "sid": sid, "ip": ip, "origin": origin}),
        );
        false
    };

    if !connect_limiter.allow(&format!("{namespace}:{sid}:connect")) {
        return deny("rate_limited_connect");
    }

    if !config.auth_required {
        return true;
    }

    if let Some(allowed) = &config.allowed_origins {
        if !origin.is_some_and(|o| allowed.iter().any(|a| a == o)) {
            return deny("origin_rejected");
        }
    }

    let Some(api_key) = config.api_key_value() else {
        tracing::error!("auth required but no api key configured");
        return false;
    };

    if auth.is_absent() {
        return deny("missing_auth");
    }
    let (Some(nonce), Some(sig)) = (&auth.nonce, &auth.sig) else {
        return deny("missing_nonce_sig");
    };

    if !nonces.validate(nonce, sig, api_key) {
        return deny("bad_nonce_sig");
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "test-api-key";

    #[test]
    fn nonce_burns_uses_and_rejects_after_exhaustion() {
        let store = NonceStore::new(60, 2);
        let issued = store.issue();
        let sig = sign_nonce(KEY, &issued.nonce);

        assert!(store.validate(&issued.nonce, &sig, KEY));
        assert!(store.validate(&issued.nonce, &sig, KEY));
        // Third use: exhausted.
        assert!(!store.validate(&issued.nonce, &sig, KEY));
        assert!(store.is_empty());
    }

    #[test]
    fn unknown_nonce_rejected() {
        let store = NonceStore::new(60, 4);
        let sig = sign_nonce(KEY, "never-issued");
        assert!(!store.validate("never-issued", &sig, KEY));
    }

    #[test]
    fn bad_signature_does_not_consume_a_use() {
        let store = NonceStore::new(60, 1);
        let issued = store.issue();

        assert!(!store.validate(&issued.nonce, "deadbeef", KEY));
        assert!(!store.validate(&issued.nonce, "not even hex", KEY));
        let good = sign_nonce(KEY, &issued.nonce);
        assert!(store.validate(&issued.nonce, &good, KEY));
    }

    #[test]
    fn signature_with_wrong_key_rejected() {
        let store = NonceStore::new(60, 4);
        let issued = store.issue();
        let sig = sign_nonce("other-key", &issued.nonce);
        assert!(!store.validate(&issued.nonce, &sig, KEY));
    }

    #[test]
    fn expired_nonce_rejected_and_collected() {
        let store = NonceStore::new(60, 4);
        let issued = store.issue();
        store.force_expire(&issued.nonce);

        let sig = sign_nonce(KEY, &issued.nonce);
        assert!(!store.validate(&issued.nonce, &sig, KEY));
        assert!(store.is_empty());
    }

    #[test]
    fn limiter_denies_past_window_max() {
        let limiter = FixedWindowRateLimiter::new(Duration::from_secs(60), 2);
        assert!(limiter.allow("a"));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        // Independent keys have independent windows.
        assert!(limiter.allow("b"));
    }

    fn gate(auth_required: bool) -> GateConfig {
        GateConfig {
            auth_required,
            api_key: auth_required.then(|| secrecy::SecretString::from(KEY)),
            ..GateConfig::default()
        }
    }

    fn authorize(
        config: &GateConfig,
        nonces: &NonceStore,
        limiter: &FixedWindowRateLimiter,
        audit: &AuditSink,
        origin: Option<&str>,
        auth: &ConnectAuth,
    ) -> bool {
        authorize_connection(
            config, nonces, limiter, audit, "/ctrl", "viewer-1", origin, None, auth,
        )
    }

    #[test]
    fn open_config_only_rate_limits() {
        let config = gate(false);
        let nonces = NonceStore::for_config(&config);
        let limiter = FixedWindowRateLimiter::per_minute(2);
        let audit = AuditSink::in_memory();

        let auth = ConnectAuth::default();
        assert!(authorize(&config, &nonces, &limiter, &audit, None, &auth));
        assert!(authorize(&config, &nonces, &limiter, &audit, None, &auth));
        assert!(!authorize(&config, &nonces, &limiter, &audit, None, &auth));
        assert_eq!(audit.reasons(), vec!["rate_limited_connect"]);
    }

    #[test]
    fn denial_reasons_follow_check_order() {
        let mut config = gate(true);
        config.allowed_origins = Some(vec!["https://ok.example".into()]);
        let nonces = NonceStore::for_config(&config);
        let limiter = FixedWindowRateLimiter::per_minute(100);
        let audit = AuditSink::in_memory();

        // Wrong origin.
        assert!(!authorize(
            &config,
            &nonces,
            &limiter,
            &audit,
            Some("https://evil.example"),
            &ConnectAuth::default(),
        ));
        // No credentials at all.
        assert!(!authorize(
            &config,
            &nonces,
            &limiter,
            &audit,
            Some("https://ok.example"),
            &ConnectAuth::default(),
        ));
        // Nonce without a signature.
        assert!(!authorize(
            &config,
            &nonces,
            &limiter,
            &audit,
            Some("https://ok.example"),
            &ConnectAuth {
                nonce: Some("n".into()),
                sig: None,
            },
        ));
        // Forged signature.
        let issued = nonces.issue();
        assert!(!authorize(
            &config,
            &nonces,
            &limiter,
            &audit,
            Some("https://ok.example"),
            &ConnectAuth {
                nonce: Some(issued.nonce.clone()),
                sig: Some("deadbeef".into()),
            },
        ));
        assert_eq!(
            audit.reasons(),
            vec![
                "origin_rejected",
                "missing_auth",
                "missing_nonce_sig",
                "bad_nonce_sig"
            ]
        );

        // Valid handshake passes.
        let sig = sign_nonce(KEY, &issued.nonce);
        assert!(authorize(
            &config,
            &nonces,
            &limiter,
            &audit,
            Some("https://ok.example"),
            &ConnectAuth {
                nonce: Some(issued.nonce),
                sig: Some(sig),
            },
        ));
    }

    #[test]
    fn audit_records_carry_context() {
        let config = gate(true);
        let nonces = NonceStore::for_config(&config);
        let limiter = FixedWindowRateLimiter::per_minute(100);
        let audit = AuditSink::in_memory();

        authorize_connection(
            &config,
            &nonces,
            &limiter,
            &audit,
            "/stream",
            "viewer-9",
            Some("https://viewer.example"),
            Some("10.0.0.1"),
            &ConnectAuth::default(),
        );
        let entries = audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fields["namespace"], "/stream");
        assert_eq!(entries[0].fields["sid"], "viewer-9");
        assert_eq!(entries[0].fields["ip"], "10.0.0.1");
    }
}
