use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// One line of the portal's hourly usage response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UsageLine {
    pub label: String,
    pub usage: f64,
    #[serde(default)]
    pub read: f64,
    #[serde(default)]
    pub is_estimated: bool,
    #[serde(default)]
    pub meter_serial_number_his: Option<String>,
}

/// Raw response for one (meter, day) usage query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MeterUsage {
    pub is_error: bool,
    pub is_data_available: bool,
    #[serde(default)]
    pub is_consumption_available: bool,
    #[serde(default)]
    pub target_usage: f64,
    #[serde(default)]
    pub average_usage: f64,
    #[serde(default)]
    pub actual_usage: f64,
    #[serde(default)]
    pub lines: Option<Vec<UsageLine>>,
}

/// An hourly sample in the portal's local wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub timestamp: NaiveDateTime,
    pub usage: f64,
}

/// Readings of a single calendar day plus the day's total usage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DayReadings {
    pub readings: Vec<Reading>,
    pub total_usage: f64,
}

/// Last persisted point of a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatisticCheckpoint {
    pub hour_start: DateTime<Utc>,
    pub cumulative_sum: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatisticPoint {
    pub hour_start: DateTime<Utc>,
    pub value: f64,
    pub cumulative_sum: f64,
}

impl StatisticPoint {
    #[cfg(test)]
    pub fn as_checkpoint(&self) -> StatisticCheckpoint {
        StatisticCheckpoint {
            hour_start: self.hour_start,
            cumulative_sum: self.cumulative_sum,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticMetadata {
    pub series_id: String,
    pub source: String,
    pub display_name: String,
    pub unit: String,
    pub has_mean: bool,
    pub has_sum: bool,
}

pub const STATISTICS_SOURCE: &str = "thames_water";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Series {
    Consumption,
    Cost,
}

impl Series {
    pub fn series_id(self) -> &'static str {
        match self {
            Series::Consumption => "thames_water:thameswater_consumption",
            Series::Cost => "thames_water:thameswater_cost",
        }
    }

    pub fn as_label(self) -> &'static str {
        match self {
            Series::Consumption => "consumption",
            Series::Cost => "cost",
        }
    }

    pub fn metadata(self, currency: &str) -> StatisticMetadata {
        let (display_name, unit) = match self {
            Series::Consumption => ("Thames Water Consumption", "L"),
            Series::Cost => ("Thames Water Cost", currency),
        };
        StatisticMetadata {
            series_id: self.series_id().to_string(),
            source: STATISTICS_SOURCE.to_string(),
            display_name: display_name.to_string(),
            unit: unit.to_string(),
            has_mean: false,
            has_sum: true,
        }
    }
}

/// Summary of one update cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub days_requested: usize,
    pub days_skipped: usize,
    pub readings_fetched: usize,
    pub readings_new: usize,
    pub points_emitted: usize,
    pub state: Option<f64>,
}
