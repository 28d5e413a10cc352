use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local, Utc};

pub const FMT_DATE_TIME: &str = "%Y-%m-%d %T";

/// format a wall clock time to string
pub fn fmt_system_time(time: SystemTime, fmt: &str) -> String {
    let utc_dt: DateTime<Utc> = time.into();
    let local_dt = utc_dt.with_timezone(&Local);
    local_dt.format(fmt).to_string()
}

/// for debug print of file modification times
pub fn system_time_str(time: SystemTime) -> String {
    let millis = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis();
    format!("{}({})", fmt_system_time(time, FMT_DATE_TIME), millis)
}
