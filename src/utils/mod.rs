use chrono::Utc;

#[cfg(test)]
pub(crate) mod test_log;

/// 当前时间，Unix 毫秒
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

const SECOND: i64 = 1000;
const MINUTE: i64 = 60 * SECOND;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;

fn plural(n: i64, unit: &str, single: &str) -> String {
    if n <= 1 {
        single.to_string()
    } else {
        format!("{} {}s", n, unit)
    }
}

fn round_div(value: i64, unit: i64) -> i64 {
    value.saturating_add(unit / 2) / unit
}

/// 把时间点格式化为相对于 now 的可读字符串，如 "3 days ago"、"in 2 hours"
pub fn format_relative(then_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(then_ms);
    let elapsed = diff.saturating_abs();

    let phrase = if elapsed < 45 * SECOND {
        "a few seconds".to_string()
    } else if elapsed < 90 * SECOND {
        "a minute".to_string()
    } else if elapsed < 45 * MINUTE {
        plural(round_div(elapsed, MINUTE), "minute", "a minute")
    } else if elapsed < 90 * MINUTE {
        "an hour".to_string()
    } else if elapsed < 22 * HOUR {
        plural(round_div(elapsed, HOUR), "hour", "an hour")
    } else if elapsed < 36 * HOUR {
        "a day".to_string()
    } else if elapsed < 26 * DAY {
        plural(round_div(elapsed, DAY), "day", "a day")
    } else if elapsed < 45 * DAY {
        "a month".to_string()
    } else if elapsed < 320 * DAY {
        plural(round_div(elapsed, 30 * DAY), "month", "a month")
    } else if elapsed < 548 * DAY {
        "a year".to_string()
    } else {
        plural(round_div(elapsed, 365 * DAY), "year", "a year")
    };

    if diff < 0 {
        format!("in {}", phrase)
    } else {
        format!("{} ago", phrase)
    }
}
