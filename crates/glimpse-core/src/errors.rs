use std::time::Duration;

/// Typed error hierarchy for remote-debugging session operations.
/// Classifies errors as detach (re-acquire the target), transport
/// (log and continue), or fatal protocol misuse.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CdpError {
    /// The underlying target went away mid-command. The caller should
    /// re-acquire a live session handle and retry.
    #[error("session detached: {0}")]
    Detached(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The browser answered with a protocol-level error object.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The session handle does not expose the required surface.
    #[error("unsupported client surface: {0}")]
    Unsupported(String),
}

impl CdpError {
    pub fn is_detach(&self) -> bool {
        matches!(self, Self::Detached(_))
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Detached(_) => "detached",
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::Protocol(_) => "protocol",
            Self::Unsupported(_) => "unsupported",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detach_classification() {
        assert!(CdpError::Detached("gone".into()).is_detach());
        assert!(!CdpError::Transport("tcp".into()).is_detach());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(CdpError::Detached("x".into()).error_kind(), "detached");
        assert_eq!(
            CdpError::Timeout(Duration::from_secs(5)).error_kind(),
            "timeout"
        );
        assert_eq!(CdpError::Unsupported("x".into()).error_kind(), "unsupported");
    }
}
