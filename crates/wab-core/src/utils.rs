use chrono::Utc;

/// RFC3339 timestamp in UTC (stored alongside documents).
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}
