const SHORT_ID_LEN: usize = 8;

/// Label shown next to a participant's marker and list entry.
pub fn display_label(id: &str, own_id: &str) -> String {
    if id == own_id {
        return "You".to_string();
    }
    let short: String = id.chars().take(SHORT_ID_LEN).collect();
    format!("User {short}")
}

/// Whole minutes between `observed_at` and `now` (both ms since epoch), rounded to the nearest
/// minute. Reports from the future count as zero.
pub fn minutes_since(observed_at: i64, now: i64) -> i64 {
    let elapsed_ms = now.saturating_sub(observed_at).max(0);
    (elapsed_ms + 30_000) / 60_000
}
