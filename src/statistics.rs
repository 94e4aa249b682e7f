use crate::models::{Reading, StatisticCheckpoint, StatisticPoint};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Interprets a portal wall-clock timestamp in `tz`.
///
/// Ambiguous times (clocks going back) resolve to the earlier instant; times
/// inside a DST gap use the offset in force just before the gap.
pub fn local_to_utc(naive: NaiveDateTime, tz: &Tz) -> DateTime<Utc> {
    if let Some(local) = tz.from_local_datetime(&naive).earliest() {
        return local.with_timezone(&Utc);
    }
    match tz.from_local_datetime(&(naive - Duration::hours(1))).earliest() {
        Some(before) => before.with_timezone(&Utc) + Duration::hours(1),
        None => Utc.from_utc_datetime(&naive),
    }
}

pub fn truncate_to_hour(ts: NaiveDateTime) -> NaiveDateTime {
    ts.date()
        .and_hms_opt(ts.hour(), 0, 0)
        .unwrap_or(ts)
}

/// Folds readings into cumulative points starting from `cumulative_start`.
///
/// Readings are sorted by timestamp first (stable for equal timestamps), so
/// the output does not depend on input order.
pub fn build_statistics(
    readings: &[Reading],
    cumulative_start: f64,
    scale: f64,
    tz: &Tz,
) -> Vec<StatisticPoint> {
    let mut sorted: Vec<&Reading> = readings.iter().collect();
    sorted.sort_by_key(|r| r.timestamp);

    let mut cumulative = cumulative_start;
    sorted
        .into_iter()
        .map(|r| {
            let value = r.usage * scale;
            cumulative += value;
            StatisticPoint {
                hour_start: local_to_utc(truncate_to_hour(r.timestamp), tz),
                value,
                cumulative_sum: cumulative,
            }
        })
        .collect()
}

/// Keeps only readings strictly after the checkpoint hour.
pub fn readings_after(
    readings: Vec<Reading>,
    checkpoint: &StatisticCheckpoint,
    tz: &Tz,
) -> Vec<Reading> {
    readings
        .into_iter()
        .filter(|r| local_to_utc(r.timestamp, tz) > checkpoint.hour_start)
        .collect()
}

/// Calendar day whose total is used to restore the current state after a
/// restart: the checkpoint's day, or the day before when the checkpoint sits
/// exactly on midnight.
pub fn restore_day(checkpoint: &StatisticCheckpoint) -> NaiveDate {
    let day = checkpoint.hour_start.date_naive();
    if checkpoint.hour_start.hour() == 0 {
        day.pred_opt().unwrap_or(day)
    } else {
        day
    }
}

pub fn day_total(readings: &[Reading], day: NaiveDate) -> f64 {
    readings
        .iter()
        .filter(|r| r.timestamp.date() == day)
        .map(|r| r.usage)
        .sum()
}
