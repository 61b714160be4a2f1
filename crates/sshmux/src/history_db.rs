//! SQLite history store
//!
//! ## Tables
//!
//! - **`connection_attempts`**: one row per connect/test attempt, finished
//!   exactly once (`status` leaves `attempting` and never returns)
//! - **`health_observations`**: append-only monitor output
//!
//! Timestamps are stored as Unix microseconds. Every statement runs on the
//! blocking pool so monitor ticks never stall a runtime worker on disk I/O.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use sshmux_core::history;
use sshmux_core::{
    AttemptFilter, AttemptOutcome, AttemptStats, AttemptStatus, ConnectionAttempt, CoreError,
    HealthObservation, HistoryRecorder, Result,
};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS connection_attempts (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    target_name   TEXT NOT NULL,
    group_name    TEXT,
    host          TEXT NOT NULL,
    user          TEXT NOT NULL,
    port          INTEGER NOT NULL,
    kind          TEXT NOT NULL,
    status        TEXT NOT NULL,
    start_time    INTEGER NOT NULL,
    end_time      INTEGER,
    duration_ms   INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    session_id    TEXT
);
CREATE INDEX IF NOT EXISTS idx_attempts_target ON connection_attempts(target_name, start_time);
CREATE INDEX IF NOT EXISTS idx_attempts_group ON connection_attempts(group_name, start_time);

CREATE TABLE IF NOT EXISTS health_observations (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id       TEXT NOT NULL,
    target_name      TEXT NOT NULL,
    check_time       INTEGER NOT NULL,
    status           TEXT NOT NULL,
    response_time_us INTEGER NOT NULL,
    error_message    TEXT
);
CREATE INDEX IF NOT EXISTS idx_health_session ON health_observations(session_id, check_time);
";

const ATTEMPT_COLUMNS: &str = "id, target_name, group_name, host, user, port, kind, status, \
     start_time, end_time, duration_ms, error_message, session_id";

pub struct SqliteHistory {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistory {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&conn);
            f(&mut guard)
        })
        .await
        .map_err(|e| CoreError::Recorder(format!("history task failed: {}", e)))?
    }
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("History connection lock poisoned, recovering");
        poisoned.into_inner()
    })
}

#[async_trait]
impl HistoryRecorder for SqliteHistory {
    async fn record(&self, attempt: &ConnectionAttempt) -> Result<i64> {
        let attempt = attempt.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO connection_attempts
                    (target_name, group_name, host, user, port, kind, status, start_time,
                     end_time, duration_ms, error_message, session_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    attempt.target_name,
                    attempt.group_name,
                    attempt.host,
                    attempt.user,
                    attempt.port,
                    attempt.kind.as_str(),
                    attempt.status.as_str(),
                    attempt.start_time.timestamp_micros(),
                    attempt.end_time.map(|t| t.timestamp_micros()),
                    attempt.duration.as_millis() as i64,
                    attempt.error_message,
                    attempt.session_id,
                ],
            )
            .map_err(db_err)?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn finish(&self, id: i64, outcome: &AttemptOutcome) -> Result<()> {
        if !outcome.status.is_terminal() {
            return Err(CoreError::Recorder(format!(
                "cannot finish attempt {} with non-terminal status {}",
                id, outcome.status
            )));
        }

        let outcome = outcome.clone();
        self.with_conn(move |conn| {
            let current: Option<(String, i64)> = conn
                .query_row(
                    "SELECT status, start_time FROM connection_attempts WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(db_err)?;
            let (status, start_micros) =
                current.ok_or_else(|| CoreError::Recorder(format!("attempt {} not found", id)))?;
            if status != AttemptStatus::Attempting.as_str() {
                return Err(CoreError::Recorder(format!(
                    "attempt {} already finished as {}",
                    id, status
                )));
            }

            let end_micros = outcome.end_time.timestamp_micros();
            let duration_ms = (end_micros - start_micros).max(0) / 1000;
            let updated = conn
                .execute(
                    "UPDATE connection_attempts
                     SET status = ?1, end_time = ?2, duration_ms = ?3, error_message = ?4,
                         session_id = COALESCE(?5, session_id)
                     WHERE id = ?6 AND status = 'attempting'",
                    params![
                        outcome.status.as_str(),
                        end_micros,
                        duration_ms,
                        outcome.error_message,
                        outcome.session_id,
                        id,
                    ],
                )
                .map_err(db_err)?;
            if updated == 0 {
                return Err(CoreError::Recorder(format!("attempt {} finished concurrently", id)));
            }
            Ok(())
        })
        .await
    }

    async fn query(&self, filter: &AttemptFilter) -> Result<Vec<ConnectionAttempt>> {
        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(target) = &filter.target {
            values.push(Value::Text(target.clone()));
            clauses.push(format!("target_name = ?{}", values.len()));
        }
        if let Some(group) = &filter.group {
            values.push(Value::Text(group.clone()));
            clauses.push(format!("group_name = ?{}", values.len()));
        }
        if let Some(status) = filter.status {
            values.push(Value::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(since) = filter.since {
            values.push(Value::Integer(since.timestamp_micros()));
            clauses.push(format!("start_time >= ?{}", values.len()));
        }

        let mut sql = format!("SELECT {} FROM connection_attempts", ATTEMPT_COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY start_time DESC, id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map(params_from_iter(values), row_to_attempt)
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
        })
        .await
    }

    async fn stats(&self, target: Option<&str>, group: Option<&str>) -> Result<AttemptStats> {
        let attempts = self
            .query(&AttemptFilter {
                target: target.map(str::to_string),
                group: group.map(str::to_string),
                ..Default::default()
            })
            .await?;
        Ok(AttemptStats::from_attempts(&attempts))
    }

    async fn record_health(&self, observation: &HealthObservation) -> Result<()> {
        let observation = observation.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO health_observations
                    (session_id, target_name, check_time, status, response_time_us, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    observation.session_id,
                    observation.target_name,
                    observation.check_time.timestamp_micros(),
                    observation.status.as_str(),
                    observation.response_time.as_micros() as i64,
                    observation.error_message,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn health_history(&self, session_id: &str, limit: usize) -> Result<Vec<HealthObservation>> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT session_id, target_name, check_time, status, response_time_us, error_message
                     FROM health_observations
                     WHERE session_id = ?1
                     ORDER BY check_time DESC, id DESC
                     LIMIT ?2",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![session_id, limit as i64], |row| {
                    Ok(HealthObservation {
                        session_id: row.get(0)?,
                        target_name: row.get(1)?,
                        check_time: micros_to_time(row.get(2)?, 2)?,
                        status: parse_column(row, 3)?,
                        response_time: Duration::from_micros(row.get::<_, i64>(4)?.max(0) as u64),
                        error_message: row.get(5)?,
                    })
                })
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
        })
        .await
    }

    async fn purge_older_than(&self, age: Duration) -> Result<usize> {
        let cutoff = history::cutoff(age)?.timestamp_micros();

        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let attempts = tx
                .execute("DELETE FROM connection_attempts WHERE start_time < ?1", params![cutoff])
                .map_err(db_err)?;
            let observations = tx
                .execute("DELETE FROM health_observations WHERE check_time < ?1", params![cutoff])
                .map_err(db_err)?;
            tx.commit().map_err(db_err)?;

            tracing::debug!(
                "Purged {} attempt(s) and {} observation(s)",
                attempts,
                observations
            );
            Ok(attempts + observations)
        })
        .await
    }
}

fn db_err(e: rusqlite::Error) -> CoreError {
    CoreError::Recorder(format!("sqlite: {}", e))
}

fn micros_to_time(micros: i64, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or(rusqlite::Error::IntegralValueOutOfRange(column, micros))
}

fn parse_column<T>(row: &Row<'_>, column: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = CoreError>,
{
    let raw: String = row.get(column)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

fn row_to_attempt(row: &Row<'_>) -> rusqlite::Result<ConnectionAttempt> {
    let end_time: Option<i64> = row.get(9)?;
    Ok(ConnectionAttempt {
        id: row.get(0)?,
        target_name: row.get(1)?,
        group_name: row.get(2)?,
        host: row.get(3)?,
        user: row.get(4)?,
        port: row.get(5)?,
        kind: parse_column(row, 6)?,
        status: parse_column(row, 7)?,
        start_time: micros_to_time(row.get(8)?, 8)?,
        end_time: end_time.map(|t| micros_to_time(t, 9)).transpose()?,
        duration: Duration::from_millis(row.get::<_, i64>(10)?.max(0) as u64),
        error_message: row.get(11)?,
        session_id: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sshmux_core::{AttemptKind, HealthStatus, Target};

    fn attempt(name: &str) -> ConnectionAttempt {
        ConnectionAttempt::single(&Target::new(name, "10.0.0.5", "ops"))
    }

    #[tokio::test]
    async fn test_record_and_finish_round_trip() {
        let db = SqliteHistory::open_in_memory().unwrap();
        let id = db.record(&attempt("db1")).await.unwrap();

        let open = db.query(&AttemptFilter::default()).await.unwrap();
        assert_eq!(open[0].status, AttemptStatus::Attempting);
        assert!(open[0].end_time.is_none());

        db.finish(id, &AttemptOutcome::success("db1")).await.unwrap();
        let done = &db.query(&AttemptFilter::default()).await.unwrap()[0];
        assert_eq!(done.id, id);
        assert_eq!(done.kind, AttemptKind::Single);
        assert_eq!(done.status, AttemptStatus::Success);
        assert_eq!(done.session_id.as_deref(), Some("db1"));
        assert!(done.end_time.unwrap() >= done.start_time);
    }

    #[tokio::test]
    async fn test_finish_only_once() {
        let db = SqliteHistory::open_in_memory().unwrap();
        let id = db.record(&attempt("db1")).await.unwrap();
        db.finish(id, &AttemptOutcome::failure(&CoreError::UserCancelled))
            .await
            .unwrap();

        let err = db.finish(id, &AttemptOutcome::success("db1")).await.unwrap_err();
        assert!(err.to_string().contains("already finished"));
        assert_eq!(
            db.query(&AttemptFilter::default()).await.unwrap()[0].status,
            AttemptStatus::Cancelled
        );
        assert!(db.finish(999, &AttemptOutcome::verified()).await.is_err());
    }

    #[tokio::test]
    async fn test_group_attempt_filter() {
        let db = SqliteHistory::open_in_memory().unwrap();
        let members = vec![
            Target::new("web1", "10.0.1.1", "ops"),
            Target::new("web2", "10.0.1.2", "ops"),
        ];
        db.record(&ConnectionAttempt::group("web", &members)).await.unwrap();
        db.record(&attempt("db1")).await.unwrap();

        let rows = db
            .query(&AttemptFilter {
                group: Some("web".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].host, "10.0.1.1,10.0.1.2");
        assert_eq!(rows[0].kind, AttemptKind::Group);

        let stats = db.stats(None, Some("web")).await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.succeeded, 0);
    }

    #[tokio::test]
    async fn test_purge_keeps_recent_rows() {
        let db = SqliteHistory::open_in_memory().unwrap();
        for days in [100, 95, 10] {
            let mut a = attempt("db1");
            a.start_time = Utc::now() - chrono::Duration::days(days);
            db.record(&a).await.unwrap();
        }

        let removed = db
            .purge_older_than(Duration::from_secs(90 * 24 * 3600))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(db.query(&AttemptFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_health_history() {
        let db = SqliteHistory::open_in_memory().unwrap();
        for (i, status) in [HealthStatus::Healthy, HealthStatus::Degraded].into_iter().enumerate() {
            db.record_health(&HealthObservation {
                session_id: "s1".to_string(),
                target_name: "db1".to_string(),
                check_time: Utc::now() + chrono::Duration::seconds(i as i64),
                status,
                response_time: Duration::from_micros(1500),
                error_message: None,
            })
            .await
            .unwrap();
        }

        let rows = db.health_history("s1", 1).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, HealthStatus::Degraded);
        assert_eq!(rows[0].response_time, Duration::from_micros(1500));
        assert!(db.health_history("s2", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_file_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.db");

        let db = SqliteHistory::open(&path).unwrap();
        db.record(&attempt("db1")).await.unwrap();
        drop(db);

        let reopened = SqliteHistory::open(&path).unwrap();
        assert_eq!(reopened.query(&AttemptFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writers_share_connection() {
        let db = Arc::new(SqliteHistory::open_in_memory().unwrap());
        let mut handles = Vec::new();
        for i in 0..8 {
            let db = Arc::clone(&db);
            handles.push(tokio::spawn(async move {
                db.record_health(&HealthObservation {
                    session_id: "s1".to_string(),
                    target_name: "db1".to_string(),
                    check_time: Utc::now(),
                    status: HealthStatus::Healthy,
                    response_time: Duration::from_micros(i),
                    error_message: None,
                })
                .await
                .unwrap();
                db.record(&attempt("db1")).await.unwrap()
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8);
        assert_eq!(db.health_history("s1", 100).await.unwrap().len(), 8);
    }
}
