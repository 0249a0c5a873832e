//! Core Store implementation

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::jobs::{Job, JobCounts, JobStatus};
use crate::now_ms;
use crate::records::{ErrorReport, LiveLocation, MetricDatapoint, StopEntity, TrackingKey, TripStopRecord};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS stops (
    stop_code   TEXT PRIMARY KEY,
    alt_code    TEXT,
    name        TEXT NOT NULL,
    latitude    REAL NOT NULL,
    longitude   REAL NOT NULL,
    products    TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS trip_stops (
    trip_number          INTEGER NOT NULL,
    service_date         TEXT NOT NULL,
    product              TEXT NOT NULL,
    stop_code            TEXT NOT NULL REFERENCES stops(stop_code),
    platform             TEXT,
    direction_text       TEXT,
    scheduled_arrival    TEXT,
    arrival_delay_secs   INTEGER NOT NULL DEFAULT 0,
    scheduled_departure  TEXT,
    departure_delay_secs INTEGER NOT NULL DEFAULT 0,
    updated_at           INTEGER NOT NULL,
    PRIMARY KEY (trip_number, service_date, product, stop_code)
);

CREATE TABLE IF NOT EXISTS tracking_keys (
    trip_number INTEGER PRIMARY KEY,
    payload     TEXT NOT NULL,
    updated_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS live_locations (
    stop_code  TEXT PRIMARY KEY,
    latitude   REAL NOT NULL,
    longitude  REAL NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS metric_datapoints (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    value       REAL NOT NULL,
    recorded_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metric_datapoints_name ON metric_datapoints(name, recorded_at);

CREATE TABLE IF NOT EXISTS error_reports (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    message     TEXT NOT NULL,
    context     TEXT NOT NULL,
    reported_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
    id         TEXT PRIMARY KEY,
    queue      TEXT NOT NULL,
    payload    TEXT NOT NULL,
    run_at     INTEGER NOT NULL,
    attempts   INTEGER NOT NULL DEFAULT 0,
    status     TEXT NOT NULL,
    last_error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(queue, status, run_at);
"#;

const JOB_COLUMNS: &str = "id, queue, payload, run_at, attempts, status, last_error, created_at, updated_at";

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn format_time(time: Option<DateTime<Utc>>) -> Option<String> {
    time.map(|t| t.to_rfc3339())
}

fn parse_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn parse_date(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| conversion_error(idx, e))
}

fn trip_stop_from_row(row: &Row<'_>) -> rusqlite::Result<TripStopRecord> {
    Ok(TripStopRecord {
        trip_number: row.get(0)?,
        service_date: parse_date(row, 1)?,
        product: row.get(2)?,
        stop_code: row.get(3)?,
        platform: row.get(4)?,
        direction_text: row.get(5)?,
        scheduled_arrival: parse_time(row, 6)?,
        arrival_delay_secs: row.get(7)?,
        scheduled_departure: parse_time(row, 8)?,
        departure_delay_secs: row.get(9)?,
    })
}

fn stop_from_row(row: &Row<'_>) -> rusqlite::Result<StopEntity> {
    let products: String = row.get(5)?;
    let products: BTreeSet<String> = serde_json::from_str(&products).map_err(|e| conversion_error(5, e))?;
    Ok(StopEntity {
        stop_code: row.get(0)?,
        alt_code: row.get(1)?,
        name: row.get(2)?,
        latitude: row.get(3)?,
        longitude: row.get(4)?,
        products,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status: String = row.get(5)?;
    let status = status.parse::<JobStatus>().map_err(|e| conversion_error(5, e))?;
    Ok(Job {
        id: row.get(0)?,
        queue: row.get(1)?,
        payload: row.get(2)?,
        run_at: row.get(3)?,
        attempts: row.get(4)?,
        status,
        last_error: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn load_job(conn: &Connection, id: &str) -> Result<Option<Job>> {
    let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
    Ok(conn.query_row(&sql, params![id], job_from_row).optional()?)
}

/// SQLite-backed store for everything the tracker persists
pub struct Store {
    conn: Connection,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.conn.path()).finish()
    }
}

impl Store {
    /// Open or create a store at the given database path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Store::open: called");
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        let store = Self::bootstrap(conn)?;
        info!(path = %path.display(), "Opened trip store");
        Ok(store)
    }

    /// Open a throwaway in-memory store
    pub fn open_in_memory() -> Result<Self> {
        debug!("Store::open_in_memory: called");
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    // === Stops ===

    /// Insert or update a stop, merging its product set with the stored one
    pub fn upsert_stop(&mut self, stop: &StopEntity) -> Result<()> {
        debug!(stop_code = %stop.stop_code, "Store::upsert_stop: called");
        let tx = self.conn.transaction()?;

        let stored: Option<String> = tx
            .query_row(
                "SELECT products FROM stops WHERE stop_code = ?1",
                params![stop.stop_code],
                |row| row.get(0),
            )
            .optional()?;

        let mut products = stop.products.clone();
        if let Some(stored) = stored {
            debug!(stop_code = %stop.stop_code, "Store::upsert_stop: merging stored products");
            let stored: BTreeSet<String> = serde_json::from_str(&stored)?;
            products.extend(stored);
        }

        tx.execute(
            "INSERT INTO stops (stop_code, alt_code, name, latitude, longitude, products)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(stop_code) DO UPDATE SET
                alt_code = excluded.alt_code,
                name = excluded.name,
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                products = excluded.products",
            params![
                stop.stop_code,
                stop.alt_code,
                stop.name,
                stop.latitude,
                stop.longitude,
                serde_json::to_string(&products)?,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Get a stop by code
    pub fn get_stop(&self, stop_code: &str) -> Result<Option<StopEntity>> {
        debug!(%stop_code, "Store::get_stop: called");
        Ok(self
            .conn
            .query_row(
                "SELECT stop_code, alt_code, name, latitude, longitude, products FROM stops WHERE stop_code = ?1",
                params![stop_code],
                stop_from_row,
            )
            .optional()?)
    }

    // === Trip stops ===

    /// Insert or replace the record for one stop of one trip
    ///
    /// Fails with [`StoreError::ReferentialIntegrity`] if the stop is unknown.
    pub fn upsert_trip_stop(&mut self, record: &TripStopRecord) -> Result<()> {
        debug!(
            trip_number = record.trip_number,
            stop_code = %record.stop_code,
            "Store::upsert_trip_stop: called"
        );
        self.conn.execute(
            "INSERT INTO trip_stops (
                trip_number, service_date, product, stop_code, platform, direction_text,
                scheduled_arrival, arrival_delay_secs, scheduled_departure, departure_delay_secs, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(trip_number, service_date, product, stop_code) DO UPDATE SET
                platform = excluded.platform,
                direction_text = excluded.direction_text,
                scheduled_arrival = excluded.scheduled_arrival,
                arrival_delay_secs = excluded.arrival_delay_secs,
                scheduled_departure = excluded.scheduled_departure,
                departure_delay_secs = excluded.departure_delay_secs,
                updated_at = excluded.updated_at",
            params![
                record.trip_number,
                record.service_date.format("%Y-%m-%d").to_string(),
                record.product,
                record.stop_code,
                record.platform,
                record.direction_text,
                format_time(record.scheduled_arrival),
                record.arrival_delay_secs,
                format_time(record.scheduled_departure),
                record.departure_delay_secs,
                now_ms(),
            ],
        )?;
        Ok(())
    }

    /// List the recorded stops of one trip in schedule order
    pub fn list_trip_stops(
        &self,
        trip_number: u32,
        service_date: NaiveDate,
        product: &str,
    ) -> Result<Vec<TripStopRecord>> {
        debug!(trip_number, %service_date, %product, "Store::list_trip_stops: called");
        let mut stmt = self.conn.prepare(
            "SELECT trip_number, service_date, product, stop_code, platform, direction_text,
                    scheduled_arrival, arrival_delay_secs, scheduled_departure, departure_delay_secs
             FROM trip_stops
             WHERE trip_number = ?1 AND service_date = ?2 AND product = ?3
             ORDER BY COALESCE(scheduled_departure, scheduled_arrival) ASC",
        )?;
        let rows = stmt.query_map(
            params![trip_number, service_date.format("%Y-%m-%d").to_string(), product],
            trip_stop_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // === Tracking keys ===

    /// Write the snapshot for a running trip
    pub fn set_tracking_key(&mut self, trip_number: u32, payload: &str) -> Result<()> {
        debug!(trip_number, "Store::set_tracking_key: called");
        self.conn.execute(
            "INSERT INTO tracking_keys (trip_number, payload, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(trip_number) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
            params![trip_number, payload, now_ms()],
        )?;
        Ok(())
    }

    pub fn get_tracking_key(&self, trip_number: u32) -> Result<Option<TrackingKey>> {
        debug!(trip_number, "Store::get_tracking_key: called");
        Ok(self
            .conn
            .query_row(
                "SELECT trip_number, payload, updated_at FROM tracking_keys WHERE trip_number = ?1",
                params![trip_number],
                |row| {
                    Ok(TrackingKey {
                        trip_number: row.get(0)?,
                        payload: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    /// Remove a trip's tracking key, returning whether one existed
    pub fn delete_tracking_key(&mut self, trip_number: u32) -> Result<bool> {
        debug!(trip_number, "Store::delete_tracking_key: called");
        let deleted = self
            .conn
            .execute("DELETE FROM tracking_keys WHERE trip_number = ?1", params![trip_number])?;
        Ok(deleted > 0)
    }

    pub fn list_tracking_keys(&self) -> Result<Vec<TrackingKey>> {
        debug!("Store::list_tracking_keys: called");
        let mut stmt = self
            .conn
            .prepare("SELECT trip_number, payload, updated_at FROM tracking_keys ORDER BY trip_number ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(TrackingKey {
                trip_number: row.get(0)?,
                payload: row.get(1)?,
                updated_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // === Live locations ===

    pub fn set_live_location(&mut self, stop_code: &str, latitude: f64, longitude: f64) -> Result<()> {
        debug!(%stop_code, latitude, longitude, "Store::set_live_location: called");
        self.conn.execute(
            "INSERT INTO live_locations (stop_code, latitude, longitude, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(stop_code) DO UPDATE SET
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                updated_at = excluded.updated_at",
            params![stop_code, latitude, longitude, now_ms()],
        )?;
        Ok(())
    }

    pub fn get_live_location(&self, stop_code: &str) -> Result<Option<LiveLocation>> {
        debug!(%stop_code, "Store::get_live_location: called");
        Ok(self
            .conn
            .query_row(
                "SELECT stop_code, latitude, longitude, updated_at FROM live_locations WHERE stop_code = ?1",
                params![stop_code],
                |row| {
                    Ok(LiveLocation {
                        stop_code: row.get(0)?,
                        latitude: row.get(1)?,
                        longitude: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    // === Metrics and errors ===

    pub fn record_metric(&mut self, name: &str, value: f64) -> Result<()> {
        debug!(%name, value, "Store::record_metric: called");
        self.conn.execute(
            "INSERT INTO metric_datapoints (name, value, recorded_at) VALUES (?1, ?2, ?3)",
            params![name, value, now_ms()],
        )?;
        Ok(())
    }

    /// Most recent datapoints for a metric, newest first
    pub fn list_metrics(&self, name: &str, limit: usize) -> Result<Vec<MetricDatapoint>> {
        debug!(%name, limit, "Store::list_metrics: called");
        let mut stmt = self.conn.prepare(
            "SELECT name, value, recorded_at FROM metric_datapoints WHERE name = ?1
             ORDER BY recorded_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![name, limit as i64], |row| {
            Ok(MetricDatapoint {
                name: row.get(0)?,
                value: row.get(1)?,
                recorded_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Store an error report, returning its id
    pub fn record_error(&mut self, message: &str, context: &str) -> Result<i64> {
        debug!(%message, "Store::record_error: called");
        self.conn.execute(
            "INSERT INTO error_reports (message, context, reported_at) VALUES (?1, ?2, ?3)",
            params![message, context, now_ms()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent error reports, newest first
    pub fn list_errors(&self, limit: usize) -> Result<Vec<ErrorReport>> {
        debug!(limit, "Store::list_errors: called");
        let mut stmt = self.conn.prepare(
            "SELECT id, message, context, reported_at FROM error_reports ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(ErrorReport {
                id: row.get(0)?,
                message: row.get(1)?,
                context: row.get(2)?,
                reported_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // === Jobs ===

    /// Add a job that becomes runnable at `run_at` (Unix ms)
    pub fn enqueue_job(&mut self, queue: &str, payload: &str, run_at: i64) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        debug!(%queue, %id, run_at, "Store::enqueue_job: called");
        let now = now_ms();
        self.conn.execute(
            "INSERT INTO jobs (id, queue, payload, run_at, attempts, status, last_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, NULL, ?6, ?6)",
            params![id, queue, payload, run_at, JobStatus::Waiting.as_str(), now],
        )?;
        Ok(id)
    }

    /// Claim up to `limit` waiting jobs whose `run_at` has passed
    ///
    /// Claimed jobs move to `active` and their attempt counter is bumped.
    pub fn claim_due_jobs(&mut self, queue: &str, now: i64, limit: usize) -> Result<Vec<Job>> {
        debug!(%queue, now, limit, "Store::claim_due_jobs: called");
        if limit == 0 {
            debug!("Store::claim_due_jobs: no capacity, skipping");
            return Ok(Vec::new());
        }

        let tx = self.conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare(
                "SELECT id FROM jobs WHERE queue = ?1 AND status = ?2 AND run_at <= ?3
                 ORDER BY run_at ASC, created_at ASC LIMIT ?4",
            )?;
            let rows = stmt.query_map(
                params![queue, JobStatus::Waiting.as_str(), now, limit as i64],
                |row| row.get::<_, String>(0),
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut jobs = Vec::with_capacity(ids.len());
        for id in &ids {
            tx.execute(
                "UPDATE jobs SET status = ?2, attempts = attempts + 1, updated_at = ?3 WHERE id = ?1",
                params![id, JobStatus::Active.as_str(), now],
            )?;
            let job = load_job(&tx, id)?.ok_or_else(|| StoreError::JobNotFound(id.clone()))?;
            jobs.push(job);
        }
        tx.commit()?;

        debug!(claimed = jobs.len(), "Store::claim_due_jobs: claimed");
        Ok(jobs)
    }

    fn set_job_status(&mut self, id: &str, status: JobStatus, error: Option<&str>) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE jobs SET status = ?2, last_error = COALESCE(?3, last_error), updated_at = ?4 WHERE id = ?1",
            params![id, status.as_str(), error, now_ms()],
        )?;
        if updated == 0 {
            return Err(StoreError::JobNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn complete_job(&mut self, id: &str) -> Result<()> {
        debug!(%id, "Store::complete_job: called");
        self.set_job_status(id, JobStatus::Completed, None)
    }

    pub fn fail_job(&mut self, id: &str, error: &str) -> Result<()> {
        debug!(%id, %error, "Store::fail_job: called");
        self.set_job_status(id, JobStatus::Failed, Some(error))
    }

    pub fn park_job(&mut self, id: &str, error: &str) -> Result<()> {
        debug!(%id, %error, "Store::park_job: called");
        self.set_job_status(id, JobStatus::Parked, Some(error))
    }

    /// Put a claimed job back to waiting, runnable again at `run_at`
    pub fn retry_job(&mut self, id: &str, run_at: i64, error: &str) -> Result<()> {
        debug!(%id, run_at, %error, "Store::retry_job: called");
        let updated = self.conn.execute(
            "UPDATE jobs SET status = ?2, run_at = ?3, last_error = ?4, updated_at = ?5 WHERE id = ?1",
            params![id, JobStatus::Waiting.as_str(), run_at, error, now_ms()],
        )?;
        if updated == 0 {
            return Err(StoreError::JobNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Return jobs left `active` by a crashed worker to the waiting set
    pub fn requeue_active_jobs(&mut self, queue: &str, run_at: i64) -> Result<usize> {
        debug!(%queue, run_at, "Store::requeue_active_jobs: called");
        let requeued = self.conn.execute(
            "UPDATE jobs SET status = ?2, run_at = ?3, updated_at = ?4 WHERE queue = ?1 AND status = ?5",
            params![
                queue,
                JobStatus::Waiting.as_str(),
                run_at,
                now_ms(),
                JobStatus::Active.as_str()
            ],
        )?;
        if requeued > 0 {
            info!(%queue, requeued, "Requeued jobs left active by a previous worker");
        }
        Ok(requeued)
    }

    /// Delete old finished jobs, keeping the newest `keep_completed` completed
    /// and `keep_failed` failed ones
    pub fn prune_jobs(&mut self, queue: &str, keep_completed: usize, keep_failed: usize) -> Result<usize> {
        debug!(%queue, keep_completed, keep_failed, "Store::prune_jobs: called");
        let mut removed = 0;
        for (status, keep) in [(JobStatus::Completed, keep_completed), (JobStatus::Failed, keep_failed)] {
            removed += self.conn.execute(
                "DELETE FROM jobs WHERE queue = ?1 AND status = ?2 AND id NOT IN (
                    SELECT id FROM jobs WHERE queue = ?1 AND status = ?2
                    ORDER BY updated_at DESC, id DESC LIMIT ?3
                 )",
                params![queue, status.as_str(), keep as i64],
            )?;
        }
        Ok(removed)
    }

    pub fn job_counts(&self, queue: &str) -> Result<JobCounts> {
        debug!(%queue, "Store::job_counts: called");
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM jobs WHERE queue = ?1 GROUP BY status")?;
        let rows = stmt.query_map(params![queue], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = JobCounts::default();
        for row in rows {
            let (status, count) = row?;
            let count = count as u64;
            match status.parse::<JobStatus>()? {
                JobStatus::Waiting => counts.waiting = count,
                JobStatus::Active => counts.active = count,
                JobStatus::Completed => counts.completed = count,
                JobStatus::Failed => counts.failed = count,
                JobStatus::Parked => counts.parked = count,
            }
        }
        Ok(counts)
    }

    /// List jobs of a queue, optionally filtered by status, oldest run time first
    pub fn list_jobs(&self, queue: &str, status: Option<JobStatus>) -> Result<Vec<Job>> {
        debug!(%queue, ?status, "Store::list_jobs: called");
        let sql = format!(
            "SELECT {} FROM jobs WHERE queue = ?1 AND (?2 IS NULL OR status = ?2) ORDER BY run_at ASC, created_at ASC",
            JOB_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![queue, status.map(|s| s.as_str())], job_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn stop(code: &str, products: &[&str]) -> StopEntity {
        StopEntity {
            stop_code: code.to_string(),
            alt_code: Some(format!("{}-alt", code)),
            name: format!("Stop {}", code),
            latitude: 49.45,
            longitude: 11.08,
            products: products.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn stored_job(store: &Store, id: &str) -> Job {
        load_job(&store.conn, id).unwrap().unwrap()
    }

    fn record(code: &str, delay: i64) -> TripStopRecord {
        TripStopRecord {
            trip_number: 1042,
            service_date: NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(),
            product: "Tram".to_string(),
            stop_code: code.to_string(),
            platform: Some("2".to_string()),
            direction_text: Some("Am Wegfeld".to_string()),
            scheduled_arrival: Some(Utc.with_ymd_and_hms(2024, 5, 17, 8, 0, 0).unwrap()),
            arrival_delay_secs: delay,
            scheduled_departure: Some(Utc.with_ymd_and_hms(2024, 5, 17, 8, 1, 0).unwrap()),
            departure_delay_secs: delay,
        }
    }

    #[test]
    fn test_trip_stop_for_unknown_stop_is_referential_error() {
        let mut store = Store::open_in_memory().unwrap();
        let err = store.upsert_trip_stop(&record("3101", 0)).unwrap_err();
        assert!(err.is_referential_integrity(), "unexpected error: {err:?}");
    }

    #[test]
    fn test_recovery_creates_stop_then_record() {
        let mut store = Store::open_in_memory().unwrap();
        assert!(store.upsert_trip_stop(&record("3101", 30)).is_err());

        store.upsert_stop(&stop("3101", &["Tram"])).unwrap();
        store.upsert_trip_stop(&record("3101", 30)).unwrap();

        assert!(store.get_stop("3101").unwrap().is_some());
        let stops = store
            .list_trip_stops(1042, NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(), "Tram")
            .unwrap();
        assert_eq!(stops, vec![record("3101", 30)]);
    }

    #[test]
    fn test_trip_stop_upsert_is_last_write_wins() {
        let mut store = Store::open_in_memory().unwrap();
        store.upsert_stop(&stop("3101", &["Tram"])).unwrap();

        store.upsert_trip_stop(&record("3101", 30)).unwrap();
        store.upsert_trip_stop(&record("3101", 95)).unwrap();

        let stops = store
            .list_trip_stops(1042, NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(), "Tram")
            .unwrap();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].arrival_delay_secs, 95);
        assert_eq!(stops[0].departure_delay_secs, 95);
    }

    #[test]
    fn test_stop_upsert_merges_products() {
        let mut store = Store::open_in_memory().unwrap();
        store.upsert_stop(&stop("510", &["Bus"])).unwrap();
        store.upsert_stop(&stop("510", &["Tram"])).unwrap();

        let stored = store.get_stop("510").unwrap().unwrap();
        let products: Vec<_> = stored.products.iter().map(String::as_str).collect();
        assert_eq!(products, vec!["Bus", "Tram"]);
    }

    #[test]
    fn test_tracking_keys() {
        let mut store = Store::open_in_memory().unwrap();
        store.set_tracking_key(1042, r#"{"stop":"A"}"#).unwrap();
        store.set_tracking_key(1042, r#"{"stop":"B"}"#).unwrap();

        let key = store.get_tracking_key(1042).unwrap().unwrap();
        assert_eq!(key.payload, r#"{"stop":"B"}"#);
        assert_eq!(store.list_tracking_keys().unwrap().len(), 1);

        assert!(store.delete_tracking_key(1042).unwrap());
        assert!(!store.delete_tracking_key(1042).unwrap());
        assert!(store.get_tracking_key(1042).unwrap().is_none());
    }

    #[test]
    fn test_live_location_overwrites() {
        let mut store = Store::open_in_memory().unwrap();
        store.set_live_location("3101", 1.0, 2.0).unwrap();
        store.set_live_location("3101", 49.4, 11.1).unwrap();

        let location = store.get_live_location("3101").unwrap().unwrap();
        assert_eq!(location.latitude, 49.4);
        assert_eq!(location.longitude, 11.1);
    }

    #[test]
    fn test_metrics_and_errors() {
        let mut store = Store::open_in_memory().unwrap();
        store.record_metric("trip.request_time", 120.0).unwrap();
        store.record_metric("trip.request_time", 80.0).unwrap();

        let metrics = store.list_metrics("trip.request_time", 10).unwrap();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].value, 80.0);

        let id = store.record_error("boom", r#"{"trip_number":1}"#).unwrap();
        let errors = store.list_errors(5).unwrap();
        assert_eq!(errors[0].id, id);
        assert_eq!(errors[0].message, "boom");
    }

    #[test]
    fn test_claim_respects_run_at_and_order() {
        let mut store = Store::open_in_memory().unwrap();
        let late = store.enqueue_job("q:trips", "{}", 2_000).unwrap();
        let early = store.enqueue_job("q:trips", "{}", 1_000).unwrap();
        store.enqueue_job("q:trips", "{}", 10_000).unwrap();

        let claimed = store.claim_due_jobs("q:trips", 5_000, 10).unwrap();
        let ids: Vec<_> = claimed.iter().map(|j| j.id.clone()).collect();
        assert_eq!(ids, vec![early, late]);
        assert!(claimed.iter().all(|j| j.status == JobStatus::Active && j.attempts == 1));

        // Already claimed jobs are not handed out twice
        assert!(store.claim_due_jobs("q:trips", 5_000, 10).unwrap().is_empty());
    }

    #[test]
    fn test_claim_limit_and_other_queues() {
        let mut store = Store::open_in_memory().unwrap();
        for _ in 0..3 {
            store.enqueue_job("q:trips", "{}", 0).unwrap();
        }
        store.enqueue_job("q:other", "{}", 0).unwrap();

        assert_eq!(store.claim_due_jobs("q:trips", 1, 2).unwrap().len(), 2);
        assert!(store.claim_due_jobs("q:trips", 1, 0).unwrap().is_empty());

        let counts = store.job_counts("q:trips").unwrap();
        assert_eq!(counts.active, 2);
        assert_eq!(counts.waiting, 1);
        assert_eq!(store.job_counts("q:other").unwrap().waiting, 1);
    }

    #[test]
    fn test_retry_and_terminal_states() {
        let mut store = Store::open_in_memory().unwrap();
        let id = store.enqueue_job("q:trips", "{}", 0).unwrap();
        store.claim_due_jobs("q:trips", 0, 1).unwrap();

        store.retry_job(&id, 500, "provider timeout").unwrap();
        let job = stored_job(&store, &id);
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.run_at, 500);
        assert_eq!(job.last_error.as_deref(), Some("provider timeout"));

        let claimed = store.claim_due_jobs("q:trips", 500, 1).unwrap();
        assert_eq!(claimed[0].attempts, 2);

        store.fail_job(&id, "gave up").unwrap();
        assert_eq!(stored_job(&store, &id).status, JobStatus::Failed);

        assert!(matches!(
            store.complete_job("missing"),
            Err(StoreError::JobNotFound(_))
        ));
    }

    #[test]
    fn test_requeue_active_jobs() {
        let mut store = Store::open_in_memory().unwrap();
        store.enqueue_job("q:trips", "{}", 0).unwrap();
        store.claim_due_jobs("q:trips", 0, 1).unwrap();

        assert_eq!(store.requeue_active_jobs("q:trips", 100).unwrap(), 1);
        assert_eq!(store.job_counts("q:trips").unwrap().waiting, 1);
    }

    #[test]
    fn test_prune_keeps_newest() {
        let mut store = Store::open_in_memory().unwrap();
        for _ in 0..4 {
            let id = store.enqueue_job("q:trips", "{}", 0).unwrap();
            store.claim_due_jobs("q:trips", 0, 1).unwrap();
            store.complete_job(&id).unwrap();
        }
        let parked = store.enqueue_job("q:trips", "not json", 0).unwrap();
        store.park_job(&parked, "invalid payload").unwrap();

        assert_eq!(store.prune_jobs("q:trips", 1, 50).unwrap(), 3);
        let counts = store.job_counts("q:trips").unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.parked, 1);
        assert_eq!(store.list_jobs("q:trips", Some(JobStatus::Parked)).unwrap().len(), 1);
        assert_eq!(store.list_jobs("q:trips", None).unwrap().len(), 2);
    }

    #[test]
    fn test_open_on_disk_persists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("trips.db");

        {
            let mut store = Store::open(&path).unwrap();
            store.upsert_stop(&stop("3101", &["Tram"])).unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.get_stop("3101").unwrap().unwrap().name, "Stop 3101");
    }

    proptest! {
        #[test]
        fn prop_stop_products_accumulate_as_union(
            batches in proptest::collection::vec(
                proptest::collection::btree_set("(Bus|Tram|UBahn|SBahn|RBahn)", 0..4),
                1..6,
            ),
        ) {
            let mut store = Store::open_in_memory().unwrap();
            let mut expected = BTreeSet::new();

            for products in &batches {
                let mut entity = stop("3101", &[]);
                entity.products = products.clone();
                store.upsert_stop(&entity).unwrap();
                expected.extend(products.iter().cloned());
            }

            let stored = store.get_stop("3101").unwrap().unwrap();
            prop_assert_eq!(stored.products, expected);
        }
    }
}
