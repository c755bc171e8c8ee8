/// Truncate `value` to at most `max_len` characters, replacing the tail
/// with a `…` marker when anything was cut.
pub fn truncate_with_ellipsis(value: &str, max_len: usize) -> String {
    if max_len == 0 {
        return String::new();
    }
    if value.chars().count() <= max_len {
        return value.to_string();
    }
    let keep = max_len.saturating_sub(1);
    let mut out: String = value.chars().take(keep).collect();
    out.push('…');
    out
}
