use chrono::Utc;

/// Wall-clock timestamp in epoch milliseconds, the unit used on the wire and
/// in persisted records.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
