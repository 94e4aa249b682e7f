use crate::error::AppError;
use crate::models::{CycleReport, Reading, Series, StatisticCheckpoint};
use crate::portal::{MeterPortal, UsageSource};
use crate::readings::normalize_day;
use crate::settings::MeterSettings;
use crate::statistics::{build_statistics, day_total, readings_after, restore_day};
use crate::storage::StatisticsStore;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use chrono_tz::Tz;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Days the portal lags behind before hourly data is published.
pub const DATA_LAG_DAYS: i64 = 3;
/// History fetched when a series has no checkpoint yet.
pub const BACKFILL_DAYS: i64 = 45;

const CHECKPOINT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Inclusive range of calendar days to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl FetchWindow {
    pub fn compute(now: NaiveDateTime, checkpoint: Option<&StatisticCheckpoint>) -> Self {
        let end = now - Duration::days(DATA_LAG_DAYS);
        let start = match checkpoint {
            Some(cp) => cp.hour_start.date_naive(),
            None => (end - Duration::days(BACKFILL_DAYS)).date(),
        };
        Self {
            start,
            end: end.date(),
        }
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(|day| *day <= self.end)
    }
}

/// Readings gathered over a window plus the last fetched day's total.
#[derive(Debug, Default)]
struct WindowReadings {
    readings: Vec<Reading>,
    latest_usage: f64,
    days_requested: usize,
    days_skipped: usize,
}

pub struct MeterService {
    settings: MeterSettings,
    portal: Box<dyn MeterPortal>,
    store: Arc<dyn StatisticsStore>,
    state: Option<f64>,
}

impl MeterService {
    pub fn new(
        settings: MeterSettings,
        portal: Box<dyn MeterPortal>,
        store: Arc<dyn StatisticsStore>,
    ) -> Self {
        Self {
            settings,
            portal,
            store,
            state: None,
        }
    }

    /// Most recent full-day usage in liters, if known.
    pub fn state(&self) -> Option<f64> {
        self.state
    }

    pub fn timezone(&self) -> Tz {
        self.settings.timezone
    }

    /// Runs one update cycle. `now` is the local wall-clock time.
    ///
    /// Authentication and store-write failures end the cycle with an error;
    /// per-day fetch failures and checkpoint lookup failures do not.
    pub async fn run_cycle(&mut self, now: NaiveDateTime) -> Result<CycleReport, AppError> {
        let cycle_id = uuid::Uuid::new_v4();
        let span = info_span!(
            "update_cycle",
            %cycle_id,
            portal = self.portal.name(),
            meter = %self.settings.meter_id
        );
        self.cycle(now).instrument(span).await
    }

    async fn cycle(&mut self, now: NaiveDateTime) -> Result<CycleReport, AppError> {
        let consumption_checkpoint = self.checkpoint(Series::Consumption).await;
        let cost_checkpoint = self.checkpoint(Series::Cost).await;

        let window = FetchWindow::compute(now, consumption_checkpoint.as_ref());
        debug!(start = %window.start, end = %window.end, "fetch window");

        let source = self
            .portal
            .connect(&self.settings.credentials)
            .await
            .inspect_err(|e| error!(error = %e, "could not log in to the portal"))?;

        let fetched = self.fetch_window(source.as_ref(), &window).await;
        let mut report = CycleReport {
            days_requested: fetched.days_requested,
            days_skipped: fetched.days_skipped,
            readings_fetched: fetched.readings.len(),
            ..CycleReport::default()
        };
        info!(readings = fetched.readings.len(), "fetched historical readings");

        let tz = self.settings.timezone;
        if let Some(checkpoint) = &consumption_checkpoint {
            self.restore_state(checkpoint, &fetched.readings);
        }
        let consumption_readings =
            unrecorded(&fetched.readings, consumption_checkpoint.as_ref(), &tz);
        let cost_readings = unrecorded(&fetched.readings, cost_checkpoint.as_ref(), &tz);
        report.readings_new = consumption_readings.len();

        if consumption_readings.is_empty() && cost_readings.is_empty() {
            warn!("no new readings available");
            report.state = self.state;
            return Ok(report);
        }

        let consumption = build_statistics(
            &consumption_readings,
            consumption_checkpoint.map_or(0.0, |cp| cp.cumulative_sum),
            1.0,
            &tz,
        );
        let cost = build_statistics(
            &cost_readings,
            cost_checkpoint.map_or(0.0, |cp| cp.cumulative_sum),
            self.settings.liter_cost,
            &tz,
        );
        if fetched.latest_usage > 0.0 {
            self.state = Some(fetched.latest_usage);
        }

        for (series, points) in [(Series::Consumption, &consumption), (Series::Cost, &cost)] {
            if points.is_empty() {
                continue;
            }
            let metadata = series.metadata(&self.settings.currency);
            self.store.append_points(&metadata, points).await?;
            debug!(series = series.as_label(), points = points.len(), "statistics appended");
        }

        report.points_emitted = consumption.len() + cost.len();
        report.state = self.state;
        Ok(report)
    }

    /// Last persisted point of a series. Lookup errors and timeouts are
    /// treated as a missing checkpoint.
    async fn checkpoint(&self, series: Series) -> Option<StatisticCheckpoint> {
        let series_id = series.series_id();
        match tokio::time::timeout(CHECKPOINT_TIMEOUT, self.store.last_point(series_id)).await {
            Ok(Ok(checkpoint)) => checkpoint,
            Ok(Err(e)) => {
                warn!(series = series.as_label(), error = %e, "checkpoint lookup failed");
                None
            }
            Err(_) => {
                warn!(series = series.as_label(), "checkpoint lookup timed out");
                None
            }
        }
    }

    async fn fetch_window(&self, source: &dyn UsageSource, window: &FetchWindow) -> WindowReadings {
        let meter = self.settings.meter_id.as_str();
        let mut out = WindowReadings::default();

        for day in window.days() {
            out.days_requested += 1;
            let usage = match source.fetch_day(meter, day).await {
                Ok(usage) => usage,
                Err(e) => {
                    warn!(%day, meter, error = %e, "could not fetch usage, skipping day");
                    out.days_skipped += 1;
                    continue;
                }
            };
            match normalize_day(&usage, day) {
                Some(day_readings) => {
                    out.latest_usage = day_readings.total_usage;
                    out.readings.extend(day_readings.readings);
                }
                None => out.days_skipped += 1,
            }
        }

        out
    }

    /// After a restart the current state is unknown; rebuild it from the
    /// full-day total of the day the checkpoint belongs to.
    fn restore_state(&mut self, checkpoint: &StatisticCheckpoint, readings: &[Reading]) {
        if self.state.is_some() || readings.is_empty() {
            return;
        }
        let day = restore_day(checkpoint);
        let total = day_total(readings, day);
        if total > 0.0 {
            self.state = Some(total);
            debug!(%day, liters = total, "restored state from last recorded day");
        }
    }
}

/// Readings newer than a series' checkpoint. Each series is filtered
/// against its own checkpoint so an hour is never summed twice into it.
fn unrecorded(
    readings: &[Reading],
    checkpoint: Option<&StatisticCheckpoint>,
    tz: &Tz,
) -> Vec<Reading> {
    match checkpoint {
        Some(checkpoint) => readings_after(readings.to_vec(), checkpoint, tz),
        None => readings.to_vec(),
    }
}
