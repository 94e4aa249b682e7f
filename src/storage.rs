use crate::error::StoreError;
use crate::models::{StatisticCheckpoint, StatisticMetadata, StatisticPoint};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// External long-term statistics store.
#[async_trait]
pub trait StatisticsStore: Send + Sync {
    async fn last_point(&self, series_id: &str)
        -> Result<Option<StatisticCheckpoint>, StoreError>;

    async fn append_points(
        &self,
        metadata: &StatisticMetadata,
        points: &[StatisticPoint],
    ) -> Result<(), StoreError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn format_start(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_start(series: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            series: series.to_string(),
            detail: format!("bad start {raw:?}: {e}"),
        })
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let this = Self {
            conn: Mutex::new(conn),
        };
        this.init()?;
        Ok(this)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))
    }

    fn init(&self) -> Result<(), StoreError> {
        self.lock()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS statistics_meta (
                statistic_id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                name TEXT NOT NULL,
                unit TEXT NOT NULL,
                has_mean INTEGER NOT NULL,
                has_sum INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS statistics (
                statistic_id TEXT NOT NULL,
                start TEXT NOT NULL,
                state REAL NOT NULL,
                sum REAL NOT NULL,
                PRIMARY KEY (statistic_id, start)
            );
            "#,
        )?;
        Ok(())
    }

    /// All points of a series in ascending hour order.
    pub fn points(&self, series_id: &str) -> Result<Vec<StatisticPoint>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT start, state, sum FROM statistics WHERE statistic_id = ? ORDER BY start ASC",
        )?;
        let rows = stmt
            .query_map([series_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?, r.get::<_, f64>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(start, value, cumulative_sum)| {
                Ok(StatisticPoint {
                    hour_start: parse_start(series_id, &start)?,
                    value,
                    cumulative_sum,
                })
            })
            .collect()
    }

    pub fn metadata(&self, series_id: &str) -> Result<Option<StatisticMetadata>, StoreError> {
        let conn = self.lock()?;
        let meta = conn
            .query_row(
                "SELECT statistic_id, source, name, unit, has_mean, has_sum
                 FROM statistics_meta WHERE statistic_id = ?",
                [series_id],
                |r| {
                    Ok(StatisticMetadata {
                        series_id: r.get(0)?,
                        source: r.get(1)?,
                        display_name: r.get(2)?,
                        unit: r.get(3)?,
                        has_mean: r.get(4)?,
                        has_sum: r.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(meta)
    }
}

#[async_trait]
impl StatisticsStore for SqliteStore {
    async fn last_point(
        &self,
        series_id: &str,
    ) -> Result<Option<StatisticCheckpoint>, StoreError> {
        let row: Option<(String, f64)> = self
            .lock()?
            .query_row(
                "SELECT start, sum FROM statistics WHERE statistic_id = ?
                 ORDER BY start DESC LIMIT 1",
                [series_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        row.map(|(start, cumulative_sum)| {
            Ok(StatisticCheckpoint {
                hour_start: parse_start(series_id, &start)?,
                cumulative_sum,
            })
        })
        .transpose()
    }

    async fn append_points(
        &self,
        metadata: &StatisticMetadata,
        points: &[StatisticPoint],
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO statistics_meta (statistic_id, source, name, unit, has_mean, has_sum)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(statistic_id) DO UPDATE SET
                source = excluded.source,
                name = excluded.name,
                unit = excluded.unit,
                has_mean = excluded.has_mean,
                has_sum = excluded.has_sum",
            params![
                metadata.series_id,
                metadata.source,
                metadata.display_name,
                metadata.unit,
                metadata.has_mean,
                metadata.has_sum,
            ],
        )?;

        {
            let mut insert = tx.prepare(
                "INSERT OR REPLACE INTO statistics (statistic_id, start, state, sum)
                 VALUES (?, ?, ?, ?)",
            )?;
            for p in points {
                insert.execute(params![
                    metadata.series_id,
                    format_start(&p.hour_start),
                    p.value,
                    p.cumulative_sum,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }
}
