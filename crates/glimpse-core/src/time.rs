use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as fractional epoch seconds, the timestamp
/// unit used across the wire protocol and stores.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ts_is_recent() {
        let ts = now_ts();
        // Some time after 2023, some time before 2100.
        assert!(ts > 1_600_000_000.0);
        assert!(ts < 4_100_000_000.0);
    }

    #[test]
    fn now_ts_is_monotonic_enough() {
        let a = now_ts();
        let b = now_ts();
        assert!(b >= a);
    }
}
