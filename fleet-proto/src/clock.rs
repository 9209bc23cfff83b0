use time::OffsetDateTime;

/// Unix timestamp in whole seconds, the only time unit on the wire.
pub type Timestamp = i64;

pub fn now_ts() -> Timestamp {
    OffsetDateTime::now_utc().unix_timestamp()
}

pub const fn mins_to_secs(mins: i64) -> i64 {
    mins * 60
}

pub const fn days_to_secs(days: i64) -> i64 {
    days * 24 * 60 * 60
}
