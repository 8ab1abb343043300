/// 日界计算工具
///
/// 日内亏损计数与定投日计数统一以配置的UTC小时为界重置
use chrono::{DateTime, Duration, TimeZone, Utc};

/// 返回now所属交易日的起点（配置日界小时的最近一次经过时刻）
pub fn day_anchor(now: DateTime<Utc>, boundary_hour: u32) -> DateTime<Utc> {
    let date = now.date_naive();
    let anchor = Utc
        .from_utc_datetime(
            &date
                .and_hms_opt(boundary_hour, 0, 0)
                .expect("日界小时已在配置校验时限定在0..24"),
        );
    if now >= anchor {
        anchor
    } else {
        anchor - Duration::days(1)
    }
}

/// 判断now是否已跨过day_start所在交易日的边界
pub fn crossed_day_boundary(day_start: DateTime<Utc>, now: DateTime<Utc>, boundary_hour: u32) -> bool {
    day_anchor(now, boundary_hour) > day_start
}
