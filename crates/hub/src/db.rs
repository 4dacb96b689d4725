//! History store: append-only telemetry log with range and bucketed
//! queries for dashboard charts, backed by SQLite.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

use crate::error::StoreError;
use crate::telemetry::TelemetryRecord;

/// One aggregated chart point.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub avg_soil_pct: f64,
    pub avg_soil_temp: f64,
    pub avg_air_temp: f64,
    pub avg_humidity: f64,
    /// True if the pump was on in any sample of the bucket.
    pub pump_on: bool,
}

/// Persistence contract consumed by the pipeline and the HTTP layer.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, device_id: &str, record: &TelemetryRecord) -> Result<(), StoreError>;

    /// Records with `from <= timestamp <= to`, oldest first.
    async fn query_range(
        &self,
        device_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<TelemetryRecord>, StoreError>;

    /// Aggregates over fixed, epoch-aligned buckets, oldest first. Empty
    /// buckets are omitted.
    async fn query_bucketed(
        &self,
        device_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
        bucket: Duration,
    ) -> Result<Vec<Bucket>, StoreError>;

    /// Delete everything older than `cutoff`; returns rows removed.
    async fn purge_older_than(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Run a store operation with an upper bound on its duration.
pub async fn bounded<T, F>(timeout: Duration, op: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, op).await {
        Ok(res) => res,
        Err(_) => Err(StoreError::Timeout(timeout.as_millis() as u64)),
    }
}

fn to_ms(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_ms(ms: i64) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .map_err(|e| StoreError::Unavailable(format!("bad stored timestamp {ms}: {e}")))
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(FromRow)]
struct TelemetryRow {
    ts_ms: i64,
    soil_raw: f64,
    soil_pct: f64,
    soil_temp: f64,
    air_temp: f64,
    humidity: f64,
    pump_on: bool,
    manual: bool,
    pump_life: f64,
}

#[derive(FromRow)]
struct BucketRow {
    bucket_ms: i64,
    avg_soil_pct: f64,
    avg_soil_temp: f64,
    avg_air_temp: f64,
    avg_humidity: f64,
    max_pump_on: i64,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/greenlink/greenlink.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // Every in-memory connection is a separate database.
        let in_memory = db_url.contains(":memory:");
        let mut pool = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool = pool.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for Db {
    async fn append(&self, device_id: &str, r: &TelemetryRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO telemetry (
              device_id, ts_ms,
              soil_raw, soil_pct, soil_temp, air_temp, humidity,
              pump_on, manual, pump_life
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(device_id)
        .bind(to_ms(r.timestamp))
        .bind(r.soil_raw)
        .bind(r.soil_pct)
        .bind(r.soil_temp)
        .bind(r.air_temp)
        .bind(r.humidity)
        .bind(r.pump_on)
        .bind(r.manual)
        .bind(r.pump_life)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query_range(
        &self,
        device_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<TelemetryRecord>, StoreError> {
        let rows: Vec<TelemetryRow> = sqlx::query_as(
            r#"
            SELECT ts_ms, soil_raw, soil_pct, soil_temp, air_temp, humidity,
                   pump_on, manual, pump_life
            FROM telemetry
            WHERE device_id = ? AND ts_ms BETWEEN ? AND ?
            ORDER BY ts_ms, id
            "#,
        )
        .bind(device_id)
        .bind(to_ms(from))
        .bind(to_ms(to))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(TelemetryRecord {
                    soil_raw: r.soil_raw,
                    soil_pct: r.soil_pct,
                    soil_temp: r.soil_temp,
                    air_temp: r.air_temp,
                    humidity: r.humidity,
                    pump_on: r.pump_on,
                    manual: r.manual,
                    pump_life: r.pump_life,
                    timestamp: from_ms(r.ts_ms)?,
                })
            })
            .collect()
    }

    async fn query_bucketed(
        &self,
        device_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
        bucket: Duration,
    ) -> Result<Vec<Bucket>, StoreError> {
        let bucket_ms = (bucket.as_millis() as i64).max(1);
        let rows: Vec<BucketRow> = sqlx::query_as(
            r#"
            SELECT (ts_ms / ?) * ? AS bucket_ms,
                   AVG(soil_pct)  AS avg_soil_pct,
                   AVG(soil_temp) AS avg_soil_temp,
                   AVG(air_temp)  AS avg_air_temp,
                   AVG(humidity)  AS avg_humidity,
                   MAX(pump_on)   AS max_pump_on
            FROM telemetry
            WHERE device_id = ? AND ts_ms BETWEEN ? AND ?
            GROUP BY bucket_ms
            ORDER BY bucket_ms
            "#,
        )
        .bind(bucket_ms)
        .bind(bucket_ms)
        .bind(device_id)
        .bind(to_ms(from))
        .bind(to_ms(to))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(Bucket {
                    timestamp: from_ms(r.bucket_ms)?,
                    avg_soil_pct: r.avg_soil_pct,
                    avg_soil_temp: r.avg_soil_temp,
                    avg_air_temp: r.avg_air_temp,
                    avg_humidity: r.avg_humidity,
                    pump_on: r.max_pump_on != 0,
                })
            })
            .collect()
    }

    async fn purge_older_than(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM telemetry WHERE ts_ms < ?")
            .bind(to_ms(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2026-03-01 00:00 UTC);

    async fn mem_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn rec(at: OffsetDateTime, soil_pct: f64, pump_on: bool) -> TelemetryRecord {
        TelemetryRecord {
            soil_raw: 600.0,
            soil_pct,
            soil_temp: 10.0,
            air_temp: 20.0,
            humidity: 40.0,
            pump_on,
            manual: false,
            pump_life: 5.0,
            timestamp: at,
        }
    }

    fn mins(n: i64) -> time::Duration {
        time::Duration::minutes(n)
    }

    #[tokio::test]
    async fn append_then_query_range_round_trips() {
        let db = mem_db().await;
        let r = TelemetryRecord {
            manual: true,
            ..rec(T0 + time::Duration::milliseconds(250), 42.5, true)
        };
        db.append("garden-1", &r).await.unwrap();

        let got = db.query_range("garden-1", T0, T0 + mins(1)).await.unwrap();
        assert_eq!(got, vec![r]);
    }

    #[tokio::test]
    async fn query_range_is_ordered_and_bounded() {
        let db = mem_db().await;
        // Inserted out of order on purpose.
        for m in [3, 1, 2, 10] {
            db.append("garden-1", &rec(T0 + mins(m), m as f64, false))
                .await
                .unwrap();
        }

        let got = db
            .query_range("garden-1", T0 + mins(1), T0 + mins(3))
            .await
            .unwrap();
        let pcts: Vec<f64> = got.iter().map(|r| r.soil_pct).collect();
        assert_eq!(pcts, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn query_range_filters_by_device() {
        let db = mem_db().await;
        db.append("a", &rec(T0, 1.0, false)).await.unwrap();
        db.append("b", &rec(T0, 2.0, false)).await.unwrap();

        let got = db.query_range("b", T0, T0).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].soil_pct, 2.0);
    }

    #[tokio::test]
    async fn bucketed_averages_and_max_pump() {
        let db = mem_db().await;
        // Bucket 0 (00:00-00:59): two samples, pump on in one.
        db.append("d", &rec(T0 + mins(5), 40.0, false)).await.unwrap();
        db.append("d", &rec(T0 + mins(50), 60.0, true)).await.unwrap();
        // Bucket 1 (01:00-01:59): one sample, pump off.
        db.append("d", &rec(T0 + mins(70), 30.0, false)).await.unwrap();

        let buckets = db
            .query_bucketed("d", T0, T0 + mins(180), Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].timestamp, T0);
        assert_eq!(buckets[0].avg_soil_pct, 50.0);
        assert_eq!(buckets[0].avg_humidity, 40.0);
        assert!(buckets[0].pump_on);
        assert_eq!(buckets[1].timestamp, T0 + mins(60));
        assert_eq!(buckets[1].avg_soil_pct, 30.0);
        assert!(!buckets[1].pump_on);
    }

    #[tokio::test]
    async fn bucketed_empty_range_is_empty() {
        let db = mem_db().await;
        let buckets = db
            .query_bucketed("d", T0, T0 + mins(60), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(buckets.is_empty());
    }

    #[tokio::test]
    async fn purge_removes_only_old_rows() {
        let db = mem_db().await;
        db.append("d", &rec(T0, 1.0, false)).await.unwrap();
        db.append("d", &rec(T0 + mins(10), 2.0, false)).await.unwrap();
        db.append("d", &rec(T0 + mins(20), 3.0, false)).await.unwrap();

        let removed = db.purge_older_than(T0 + mins(10)).await.unwrap();
        assert_eq!(removed, 1);

        let left = db.query_range("d", T0, T0 + mins(30)).await.unwrap();
        assert_eq!(left.len(), 2);
        assert_eq!(left[0].soil_pct, 2.0);
    }

    #[tokio::test]
    async fn ping_succeeds_on_open_db() {
        mem_db().await.ping().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_times_out() {
        let res: Result<(), StoreError> = bounded(Duration::from_millis(100), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(StoreError::Timeout(100))));
    }
}
