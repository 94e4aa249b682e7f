use crate::error::FetchError;
use crate::models::MeterUsage;
use crate::portal::{AuthenticatedSession, UsageSource};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use tracing::{debug, instrument};

/// Hourly granularity; the only one ingested.
const GRANULARITY: &str = "H";

/// Query parameters for a single-day hourly usage request.
pub fn usage_query(meter_id: &str, day: NaiveDate) -> Vec<(&'static str, String)> {
    vec![
        ("meter", meter_id.to_string()),
        ("startDate", day.day().to_string()),
        ("startMonth", day.month().to_string()),
        ("startYear", day.year().to_string()),
        ("endDate", day.day().to_string()),
        ("endMonth", day.month().to_string()),
        ("endYear", day.year().to_string()),
        ("granularity", GRANULARITY.to_string()),
        ("premiseId", String::new()),
        ("isForC4C", "false".to_string()),
    ]
}

#[async_trait]
impl UsageSource for AuthenticatedSession {
    #[instrument(skip(self), fields(account = %self.account_number))]
    async fn fetch_day(&self, meter_id: &str, day: NaiveDate) -> Result<MeterUsage, FetchError> {
        let transport = |source| FetchError::Transport {
            meter: meter_id.to_string(),
            day,
            source,
        };

        let body = self
            .client
            .get(self.endpoints.consumption_url())
            .query(&usage_query(meter_id, day))
            .header("Referer", self.endpoints.meters_usage_url())
            .header("X-Requested-With", "XMLHttpRequest")
            .send()
            .await
            .map_err(transport)?
            .error_for_status()
            .map_err(transport)?
            .text()
            .await
            .map_err(transport)?;

        let usage: MeterUsage = serde_json::from_str(&body).map_err(|source| FetchError::Decode {
            meter: meter_id.to_string(),
            day,
            source,
        })?;
        debug!(
            lines = usage.lines.as_ref().map_or(0, Vec::len),
            available = usage.is_data_available,
            "usage response received"
        );
        Ok(usage)
    }
}
