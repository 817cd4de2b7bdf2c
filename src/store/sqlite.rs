//! SQLite-backed case store.
//!
//! SQLite has no native change feed, so `subscribe` polls the top-N window
//! on a fixed interval and reports the diff between successive windows.
//! All queries run on the blocking pool behind one shared connection.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tokio::time::MissedTickBehavior;

use super::feed::{diff_windows, FeedEvent, FeedSender, FeedSubscription};
use super::{CaseFilter, CaseStore, ClinicInfo, StoreError};
use crate::config::EngineConfig;
use crate::models::CaseRecord;

const CASE_COLUMNS: &str = "id, created_at, doctor_completed, pharmacist_completed, is_incomplete, \
     completed_at, emr_numbers, clinic_id, partner_name, assigned_doctor, pharmacist_id, created_by";

pub struct SqliteCaseStore {
    conn: Arc<Mutex<Connection>>,
    poll_interval: Duration,
}

impl SqliteCaseStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path, poll_interval: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn, poll_interval)
    }

    /// `open` with the poll interval taken from the engine config.
    pub fn open_with_config(path: &Path, config: &EngineConfig) -> Result<Self, StoreError> {
        Self::open(path, config.feed_poll_interval)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory(poll_interval: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, poll_interval)
    }

    fn init(conn: Connection, poll_interval: Duration) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA journal_mode=DELETE;")?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            poll_interval,
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let guard = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&guard)
    }

    pub fn upsert_case(&self, record: &CaseRecord) -> Result<(), StoreError> {
        let emr = serde_json::to_string(&record.emr_numbers).map_err(crate::models::RecordError::from)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO cases (id, created_at, doctor_completed, pharmacist_completed,
                 is_incomplete, completed_at, emr_numbers, clinic_id, partner_name, assigned_doctor,
                 pharmacist_id, created_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    record.id,
                    record.created_at.timestamp_micros(),
                    record.doctor_completed,
                    record.pharmacist_completed,
                    record.is_incomplete,
                    record.completed_at.map(|at| at.timestamp_micros()),
                    emr,
                    record.clinic_id,
                    record.partner_name,
                    record.assigned_doctor,
                    record.pharmacist_id,
                    record.created_by,
                ],
            )?;
            Ok(())
        })
    }

    pub fn delete_case(&self, id: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| Ok(conn.execute("DELETE FROM cases WHERE id = ?1", params![id])? > 0))
    }

    pub fn get_case(&self, id: &str) -> Result<Option<CaseRecord>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {CASE_COLUMNS} FROM cases WHERE id = ?1");
            Ok(conn.query_row(&sql, params![id], row_to_record).optional()?)
        })
    }

    pub fn upsert_clinic(&self, info: &ClinicInfo) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO clinics (clinic_id, partner_name, clinic_code) VALUES (?1, ?2, ?3)",
                params![info.clinic_id, info.partner_name, info.clinic_code],
            )?;
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════
// Migrations
// ═══════════════════════════════════════════════════════════

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    let current_version = current_schema_version(conn);

    let migrations: Vec<(i64, &str)> = vec![(1, include_str!("../../resources/migrations/001_cases.sql"))];

    for (version, sql) in migrations {
        if version > current_version {
            tracing::info!("Running migration v{version}");
            conn.execute_batch(sql).map_err(|e| StoreError::MigrationFailed {
                version,
                reason: e.to_string(),
            })?;
        }
    }

    Ok(())
}

/// 0 if no schema exists yet
fn current_schema_version(conn: &Connection) -> i64 {
    conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get::<_, i64>(0))
        .unwrap_or(0)
}

// ═══════════════════════════════════════════════════════════
// Queries
// ═══════════════════════════════════════════════════════════

/// Render a filter as a WHERE clause plus positional parameters.
fn where_clause(filter: &CaseFilter) -> (String, Vec<Value>) {
    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    let owner = [
        ("assigned_doctor = ?", &filter.owner.assigned_doctor),
        ("pharmacist_id = ?", &filter.owner.pharmacist_id),
        ("created_by = ?", &filter.owner.created_by),
    ];
    for (clause, wanted) in owner {
        if let Some(v) = wanted {
            clauses.push(clause);
            values.push(Value::Text(v.clone()));
        }
    }

    let flags = [
        ("is_incomplete = ?", filter.is_incomplete),
        ("doctor_completed = ?", filter.doctor_completed),
        ("pharmacist_completed = ?", filter.pharmacist_completed),
    ];
    for (clause, wanted) in flags {
        if let Some(v) = wanted {
            clauses.push(clause);
            values.push(Value::Integer(i64::from(v)));
        }
    }

    if let Some((start, end)) = filter.completed_between {
        clauses.push("completed_at >= ? AND completed_at < ?");
        values.push(Value::Integer(start.timestamp_micros()));
        values.push(Value::Integer(end.timestamp_micros()));
    }

    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), values)
    }
}

/// Matching cases; with a limit, the newest `limit` in feed order.
fn query_cases(conn: &Connection, filter: &CaseFilter, limit: Option<usize>) -> Result<Vec<CaseRecord>, StoreError> {
    let (clause, mut values) = where_clause(filter);
    let mut sql = format!("SELECT {CASE_COLUMNS} FROM cases{clause}");
    if let Some(limit) = limit {
        sql.push_str(" ORDER BY created_at DESC, id ASC LIMIT ?");
        values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), row_to_record)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

fn query_clinics(conn: &Connection, ids: &[String]) -> Result<Vec<ClinicInfo>, StoreError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!("SELECT clinic_id, partner_name, clinic_code FROM clinics WHERE clinic_id IN ({placeholders})");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(ids.iter()), |row| {
        Ok(ClinicInfo {
            clinic_id: row.get(0)?,
            partner_name: row.get(1)?,
            clinic_code: row.get(2)?,
        })
    })?;
    let mut clinics = Vec::new();
    for row in rows {
        clinics.push(row?);
    }
    Ok(clinics)
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<CaseRecord> {
    let emr_json: String = row.get(6)?;
    let emr_numbers: Vec<String> = serde_json::from_str(&emr_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
    let completed_at = match row.get::<_, Option<i64>>(5)? {
        Some(micros) => Some(micros_to_utc(5, micros)?),
        None => None,
    };

    Ok(CaseRecord {
        id: row.get(0)?,
        created_at: micros_to_utc(1, row.get(1)?)?,
        doctor_completed: row.get(2)?,
        pharmacist_completed: row.get(3)?,
        is_incomplete: row.get(4)?,
        completed_at,
        emr_numbers,
        clinic_id: row.get(7)?,
        partner_name: row.get(8)?,
        assigned_doctor: row.get(9)?,
        pharmacist_id: row.get(10)?,
        created_by: row.get(11)?,
    })
}

fn micros_to_utc(idx: usize, micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_micros(micros)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, micros))
}

/// Run `f` against the shared connection on the blocking pool.
async fn run_blocking<T, F>(conn: &Arc<Mutex<Connection>>, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || {
        let guard = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&guard)
    })
    .await
    .map_err(|e| StoreError::TaskFailed(e.to_string()))?
}

// ═══════════════════════════════════════════════════════════
// Polling feed
// ═══════════════════════════════════════════════════════════

async fn poll_window(
    conn: Arc<Mutex<Connection>>,
    filter: CaseFilter,
    limit: usize,
    mut window: Vec<CaseRecord>,
    tx: FeedSender,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = tx.closed() => {
                tracing::debug!("SQLite feed released by subscriber");
                return;
            }
            _ = ticker.tick() => {}
        }

        let query = filter.clone();
        let next = match run_blocking(&conn, move |c| query_cases(c, &query, Some(limit))).await {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(error = %e, "SQLite feed poll failed");
                let _ = tx.send(Err(e));
                return;
            }
        };

        let changes = diff_windows(&window, &next);
        window = next;
        if !changes.is_empty() && tx.send(Ok(FeedEvent::Changes(changes))).is_err() {
            return;
        }
    }
}

impl CaseStore for SqliteCaseStore {
    async fn fetch(&self, filter: &CaseFilter) -> Result<Vec<CaseRecord>, StoreError> {
        let filter = filter.clone();
        run_blocking(&self.conn, move |conn| query_cases(conn, &filter, None)).await
    }

    async fn subscribe(&self, filter: &CaseFilter, limit: usize) -> Result<FeedSubscription, StoreError> {
        let filter = filter.clone();
        let query = filter.clone();
        let initial = run_blocking(&self.conn, move |conn| query_cases(conn, &query, Some(limit))).await?;

        let (tx, subscription) = FeedSubscription::channel();
        tx.send(Ok(FeedEvent::Snapshot(initial.clone())))?;

        tokio::spawn(poll_window(
            Arc::clone(&self.conn),
            filter,
            limit,
            initial,
            tx,
            self.poll_interval,
        ));
        tracing::debug!(limit, interval_ms = self.poll_interval.as_millis() as u64, "SQLite feed opened");
        Ok(subscription)
    }

    async fn lookup_clinics(&self, clinic_ids: &[String]) -> Result<Vec<ClinicInfo>, StoreError> {
        let ids = clinic_ids.to_vec();
        run_blocking(&self.conn, move |conn| query_clinics(conn, &ids)).await
    }
}
