use chrono::{DateTime, TimeZone, Utc};

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

pub fn to_ms(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Inverse of [`to_ms`]; `None` for values chrono cannot represent.
pub fn from_ms(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}
