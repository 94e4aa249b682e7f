use crate::service::MeterService;
use crate::settings::parse_fetch_hours;
use crate::statistics::local_to_utc;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use chrono_tz::Tz;
use rand::Rng;
use tracing::{error, info, warn};

pub const DEFAULT_FETCH_HOURS: [u32; 2] = [15, 23];
const MAX_JITTER_MINUTE: u32 = 10;

/// Wall-clock times at which update cycles run: each of `hours` at `minute`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSchedule {
    hours: Vec<u32>,
    minute: u32,
}

impl FetchSchedule {
    pub fn new(mut hours: Vec<u32>, minute: u32) -> Self {
        hours.retain(|h| *h < 24);
        if hours.is_empty() {
            hours = DEFAULT_FETCH_HOURS.to_vec();
        }
        hours.sort_unstable();
        hours.dedup();
        Self {
            hours,
            minute: minute.min(59),
        }
    }

    /// Builds the schedule from the optional `fetch_hours` override with a
    /// random minute in `0..=10` so installations do not hit the portal at once.
    pub fn from_config<R: Rng>(fetch_hours: Option<&str>, rng: &mut R) -> Self {
        let hours = match fetch_hours.map(str::trim).filter(|raw| !raw.is_empty()) {
            None => DEFAULT_FETCH_HOURS.to_vec(),
            Some(raw) => parse_fetch_hours(raw).unwrap_or_else(|| {
                warn!(fetch_hours = raw, "invalid fetch_hours, using defaults");
                DEFAULT_FETCH_HOURS.to_vec()
            }),
        };
        Self::new(hours, rng.gen_range(0..=MAX_JITTER_MINUTE))
    }

    pub fn hours(&self) -> &[u32] {
        &self.hours
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }

    /// First scheduled time strictly after `now` (local wall clock, second 0).
    pub fn next_run_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        let today = now.date();
        for offset in 0..=1 {
            let day = today + Duration::days(offset);
            for hour in &self.hours {
                if let Some(candidate) = day.and_hms_opt(*hour, self.minute, 0) {
                    if candidate > now {
                        return candidate;
                    }
                }
            }
        }
        // Unreachable with a non-empty hour list; fall back to a day later.
        now + Duration::days(1)
    }
}

/// Real time from `now` until the local wall-clock time `next`. Both ends
/// are compared as UTC instants so a DST change in between is honoured.
fn wait_until(next: NaiveDateTime, now: DateTime<Utc>, tz: &Tz) -> std::time::Duration {
    (local_to_utc(next, tz) - now).to_std().unwrap_or_default()
}

/// Runs one cycle now, then one at every scheduled time until Ctrl-C.
pub async fn run_daemon(mut service: MeterService, schedule: FetchSchedule) {
    info!(hours = ?schedule.hours(), minute = schedule.minute(), "scheduler started");
    run_logged(&mut service).await;

    loop {
        let tz = service.timezone();
        let now = Utc::now();
        let next = schedule.next_run_after(now.with_timezone(&tz).naive_local());
        let wait = wait_until(next, now, &tz);
        info!(next_run = %next, "waiting for next update cycle");

        tokio::select! {
            _ = tokio::time::sleep(wait) => run_logged(&mut service).await,
            _ = tokio::signal::ctrl_c() => {
                info!("scheduler stopped");
                return;
            }
        }
    }
}

async fn run_logged(service: &mut MeterService) {
    let now = Utc::now().with_timezone(&service.timezone()).naive_local();
    match service.run_cycle(now).await {
        Ok(report) => info!(
            points = report.points_emitted,
            readings = report.readings_new,
            "update cycle finished"
        ),
        Err(e) => error!(error = %e, "update cycle failed"),
    }
}
