//! Access-gate configuration loaded from `GLIMPSE_*` environment
//! variables.

use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("GLIMPSE_AUTH_REQUIRED is set but GLIMPSE_API_KEY is empty")]
    MissingApiKey,
}

/// Gate settings for viewer connections. Auth that is required but
/// unsatisfiable fails here at load time, never as a silent allow.
#[derive(Clone)]
pub struct GateConfig {
    pub auth_required: bool,
    pub api_key: Option<SecretString>,
    /// `None` accepts any origin.
    pub allowed_origins: Option<Vec<String>>,
    pub nonce_ttl_seconds: u64,
    pub nonce_uses: u32,
    pub events_per_minute: u32,
    pub connects_per_minute: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            auth_required: false,
            api_key: None,
            allowed_origins: None,
            nonce_ttl_seconds: 60,
            nonce_uses: 4,
            events_per_minute: 120,
            connects_per_minute: 30,
        }
    }
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    let Some(value) = value else { return default };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => true,
        "0" | "false" | "f" | "no" | "n" | "off" => false,
        _ => default,
    }
}

fn parse_u64(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_origins(value: Option<String>) -> Option<Vec<String>> {
    let value = value?;
    let normalized = value.trim();
    if normalized.is_empty() || normalized == "*" {
        return None;
    }
    let parts: Vec<String> = normalized
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}

impl GateConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load_with(|name| std::env::var(name).ok())
    }

    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let auth_required = parse_bool(lookup("GLIMPSE_AUTH_REQUIRED"), false);
        let api_key = lookup("GLIMPSE_API_KEY")
            .filter(|k| !k.is_empty())
            .map(SecretString::from);
        let allowed_origins = parse_origins(lookup("GLIMPSE_ALLOWED_ORIGINS"));

        if auth_required && api_key.is_none() {
            return Err(ConfigError::MissingApiKey);
        }

        Ok(Self {
            auth_required,
            api_key,
            allowed_origins,
            nonce_ttl_seconds: parse_u64(lookup("GLIMPSE_NONCE_TTL_SECONDS"), 60).max(5),
            nonce_uses: parse_u64(lookup("GLIMPSE_NONCE_USES"), 4).max(1) as u32,
            events_per_minute: parse_u64(lookup("GLIMPSE_RATE_LIMIT_EVENTS_PER_MINUTE"), 120)
                .max(1) as u32,
            connects_per_minute: parse_u64(lookup("GLIMPSE_RATE_LIMIT_CONNECTS_PER_MINUTE"), 30)
                .max(1) as u32,
        })
    }

    /// View served from `/auth/config`. Never includes the key or the
    /// origin allowlist.
    pub fn to_public(&self) -> Value {
        json!({
            "auth_required": self.auth_required,
            "nonce_ttl_seconds": self.nonce_ttl_seconds,
            "nonce_uses": self.nonce_uses,
            "per_sid_events_per_minute": self.events_per_minute,
            "per_sid_connects_per_minute": self.connects_per_minute,
        })
    }

    pub fn api_key_value(&self) -> Option<&str> {
        self.api_key.as_ref().map(|k| k.expose_secret())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn load(pairs: &[(&str, &str)]) -> Result<GateConfig, ConfigError> {
        let vars = env(pairs);
        GateConfig::load_with(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_without_env() {
        let config = load(&[]).unwrap();
        assert!(!config.auth_required);
        assert!(config.api_key.is_none());
        assert!(config.allowed_origins.is_none());
        assert_eq!(config.nonce_ttl_seconds, 60);
        assert_eq!(config.nonce_uses, 4);
        assert_eq!(config.events_per_minute, 120);
        assert_eq!(config.connects_per_minute, 30);
    }

    #[test]
    fn auth_required_without_key_is_an_error() {
        let result = load(&[("GLIMPSE_AUTH_REQUIRED", "true")]);
        assert!(matches!(result, Err(ConfigError::MissingApiKey)));
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        for value in ["1", "true", "T", "YES", "y", "on"] {
            let config = load(&[
                ("GLIMPSE_AUTH_REQUIRED", value),
                ("GLIMPSE_API_KEY", "secret"),
            ])
            .unwrap();
            assert!(config.auth_required, "{value} should parse as true");
        }
        for value in ["0", "false", "off", "garbage"] {
            let config = load(&[("GLIMPSE_AUTH_REQUIRED", value)]).unwrap();
            assert!(!config.auth_required, "{value} should parse as false");
        }
    }

    #[test]
    fn wildcard_origins_mean_no_allowlist() {
        assert!(load(&[("GLIMPSE_ALLOWED_ORIGINS", "*")])
            .unwrap()
            .allowed_origins
            .is_none());
        assert!(load(&[("GLIMPSE_ALLOWED_ORIGINS", "")])
            .unwrap()
            .allowed_origins
            .is_none());

        let config = load(&[(
            "GLIMPSE_ALLOWED_ORIGINS",
            "https://a.example, https://b.example",
        )])
        .unwrap();
        assert_eq!(
            config.allowed_origins,
            Some(vec![
                "https://a.example".to_string(),
                "https://b.example".to_string()
            ])
        );
    }

    #[test]
    fn limits_are_clamped_to_minimums() {
        let config = load(&[
            ("GLIMPSE_NONCE_TTL_SECONDS", "1"),
            ("GLIMPSE_NONCE_USES", "0"),
            ("GLIMPSE_RATE_LIMIT_EVENTS_PER_MINUTE", "0"),
            ("GLIMPSE_RATE_LIMIT_CONNECTS_PER_MINUTE", "0"),
        ])
        .unwrap();
        assert_eq!(config.nonce_ttl_seconds, 5);
        assert_eq!(config.nonce_uses, 1);
        assert_eq!(config.events_per_minute, 1);
        assert_eq!(config.connects_per_minute, 1);
    }

    #[test]
    fn public_view_omits_secrets() {
        let config = load(&[
            ("GLIMPSE_AUTH_REQUIRED", "1"),
            ("GLIMPSE_API_KEY", "hunter2"),
            ("GLIMPSE_ALLOWED_ORIGINS", "https://a.example"),
        ])
        .unwrap();
        let public = config.to_public();
        assert_eq!(public["auth_required"], true);
        assert!(public.get("api_key").is_none());
        assert!(public.get("allowed_origins").is_none());
    }
}
