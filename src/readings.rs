use crate::error::LabelParseError;
use crate::models::{DayReadings, MeterUsage, Reading};
use chrono::{NaiveDate, NaiveTime};
use tracing::{debug, warn};

/// Parses a portal line label such as `"07:00"`.
pub fn parse_label(label: &str) -> Result<NaiveTime, LabelParseError> {
    let err = || LabelParseError {
        label: label.to_string(),
    };
    let (hour, minute) = label.split_once(':').ok_or_else(err)?;
    let hour: u32 = hour.trim().parse().map_err(|_| err())?;
    let minute: u32 = minute.trim().parse().map_err(|_| err())?;
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(err)
}

/// Flattens one day's usage response into readings.
///
/// Returns `None` when the portal reports an error or no data for the day.
/// Lines whose label does not parse, or whose usage is negative, are logged
/// and skipped. `total_usage` sums every line the portal reported.
pub fn normalize_day(usage: &MeterUsage, day: NaiveDate) -> Option<DayReadings> {
    if usage.is_error || !usage.is_data_available {
        debug!(%day, is_error = usage.is_error, "no usage data for day");
        return None;
    }
    let lines = usage.lines.as_ref()?;

    let mut out = DayReadings {
        readings: Vec::with_capacity(lines.len()),
        total_usage: 0.0,
    };
    for line in lines {
        out.total_usage += line.usage;

        let time = match parse_label(&line.label) {
            Ok(time) => time,
            Err(e) => {
                warn!(%day, error = %e, "skipping usage line");
                continue;
            }
        };
        if !line.usage.is_finite() || line.usage < 0.0 {
            warn!(%day, label = %line.label, usage = line.usage, "skipping negative usage line");
            continue;
        }

        out.readings.push(Reading {
            timestamp: day.and_time(time),
            usage: line.usage,
        });
    }

    Some(out)
}
