use chrono::Utc;

/// Current wall-clock time as milliseconds since the Unix epoch.
///
/// Every frame, snapshot, and key event on the wire carries a `server_time`
/// stamped with this.
pub fn epoch_ms() -> i64 {
    Utc::now().timestamp_millis()
}
