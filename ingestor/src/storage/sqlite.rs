//! Relational catalog and sample store on top of SQLite.
//!
//! Layout:
//! - `_metrics(name, table_name, finalized)`: one row per metric container
//! - `_series(id, metric, labels)`: canonical label JSON, unique
//! - `"m_<metric>"(series_id, time, value)`: one table per metric keyed on
//!   `(series_id, time)`, written with upserts

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};

use super::{Catalog, SampleStore, StoreError};
use crate::{
    labels::LabelSet,
    model::{Row, SeriesId},
    router::Batch,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS _metrics (
    name       TEXT PRIMARY KEY,
    table_name TEXT NOT NULL,
    finalized  INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS _series (
    id     INTEGER PRIMARY KEY AUTOINCREMENT,
    metric TEXT NOT NULL REFERENCES _metrics(name),
    labels TEXT NOT NULL UNIQUE
);
";

#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend").finish_non_exhaustive()
    }
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let conn = Connection::open_with_flags(path, flags).map_err(classify)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(classify)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(classify)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(classify)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(classify)?;
        conn.execute_batch(SCHEMA).map_err(classify)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` on the blocking pool with the connection locked.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&mut conn.lock()))
            .await
            .map_err(|e| StoreError::fatal(format!("sqlite task failed: {e}")))?
    }

    /// All rows of `metric`, ordered by series and time.
    pub async fn rows(&self, metric: &str) -> Result<Vec<Row>, StoreError> {
        let table = table_name(metric)?;
        let metric = metric.to_owned();
        self.with_conn(move |conn| {
            if !metric_exists(conn, &metric)? {
                return Err(StoreError::unknown_metric(&metric));
            }
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT series_id, time, value FROM {table} ORDER BY series_id, time"
                ))
                .map_err(classify)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(Row {
                        series_id: SeriesId::new(row.get(0)?),
                        timestamp: row.get(1)?,
                        value: row.get(2)?,
                    })
                })
                .map_err(classify)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(classify)?;
            Ok(rows)
        })
        .await
    }

    /// Names of all metric containers.
    pub async fn metrics(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT name FROM _metrics ORDER BY name")
                .map_err(classify)?;
            let names = stmt
                .query_map([], |row| row.get(0))
                .map_err(classify)?
                .collect::<Result<Vec<String>, _>>()
                .map_err(classify)?;
            Ok(names)
        })
        .await
    }
}

#[async_trait]
impl Catalog for SqliteBackend {
    async fn ensure_metric_container(&self, metric: &str) -> Result<(), StoreError> {
        let table = table_name(metric)?;
        let metric = metric.to_owned();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(classify)?;
            tx.execute(
                "INSERT INTO _metrics (name, table_name) VALUES (?1, ?2)
                 ON CONFLICT(name) DO NOTHING",
                params![metric, table],
            )
            .map_err(classify)?;
            tx.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    series_id INTEGER NOT NULL REFERENCES _series(id),
                    time      INTEGER NOT NULL,
                    value     REAL NOT NULL,
                    PRIMARY KEY (series_id, time)
                ) WITHOUT ROWID;"
            ))
            .map_err(classify)?;
            tx.commit().map_err(classify)
        })
        .await
    }

    async fn get_or_create_series(
        &self,
        metric: &str,
        labels: &LabelSet,
    ) -> Result<SeriesId, StoreError> {
        let metric = metric.to_owned();
        let json = serde_json::to_string(labels)
            .map_err(|e| StoreError::integrity(format!("unencodable labels: {e}")))?;
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(classify)?;
            if !metric_exists(&tx, &metric)? {
                return Err(StoreError::unknown_metric(&metric));
            }
            tx.execute(
                "INSERT INTO _series (metric, labels) VALUES (?1, ?2)
                 ON CONFLICT(labels) DO NOTHING",
                params![metric, json],
            )
            .map_err(classify)?;
            let id: i64 = tx
                .query_row("SELECT id FROM _series WHERE labels = ?1", params![json], |row| {
                    row.get(0)
                })
                .map_err(classify)?;
            tx.commit().map_err(classify)?;
            Ok(SeriesId::new(id))
        })
        .await
    }

    async fn finalize_metric_creation(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("UPDATE _metrics SET finalized = 1 WHERE finalized = 0", [])
                .map(|_| ())
                .map_err(classify)
        })
        .await
    }

    async fn series_labels(&self, id: SeriesId) -> Result<Option<LabelSet>, StoreError> {
        let json: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT labels FROM _series WHERE id = ?1",
                    params![id.get()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(classify)
            })
            .await?;
        json.map(|json| {
            serde_json::from_str(&json)
                .map_err(|e| StoreError::fatal(format!("corrupt labels of series {id}: {e}")))
        })
        .transpose()
    }
}

#[async_trait]
impl SampleStore for SqliteBackend {
    async fn insert_batch(&self, batch: &Batch) -> Result<u64, StoreError> {
        let table = table_name(batch.container())?;
        let metric = batch.container().to_owned();
        let rows = batch.rows.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(classify)?;
            if !metric_exists(&tx, &metric)? {
                return Err(StoreError::unknown_metric(&metric));
            }
            let mut written = 0;
            {
                let mut stmt = tx
                    .prepare_cached(&format!(
                        "INSERT INTO {table} (series_id, time, value) VALUES (?1, ?2, ?3)
                         ON CONFLICT(series_id, time) DO UPDATE SET value = excluded.value"
                    ))
                    .map_err(classify)?;
                for row in &rows {
                    written += stmt
                        .execute(params![row.series_id.get(), row.timestamp, row.value])
                        .map_err(classify)? as u64;
                }
            }
            tx.commit().map_err(classify)?;
            Ok(written)
        })
        .await
    }
}

fn metric_exists(conn: &Connection, metric: &str) -> Result<bool, StoreError> {
    conn.query_row(
        "SELECT 1 FROM _metrics WHERE name = ?1",
        params![metric],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(classify)
}

/// Quoted table name of a metric container. Only valid Prometheus metric
/// names are accepted.
fn table_name(metric: &str) -> Result<String, StoreError> {
    let mut chars = metric.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':');
    if !valid {
        return Err(StoreError::integrity(format!(
            "invalid metric name {metric:?}"
        )));
    }
    Ok(format!("\"m_{metric}\""))
}

fn classify(err: rusqlite::Error) -> StoreError {
    let message = err.to_string();
    match err {
        rusqlite::Error::SqliteFailure(e, _) => match e.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StoreError::transient(message),
            ErrorCode::ConstraintViolation => StoreError::integrity(message),
            _ => StoreError::fatal(message),
        },
        _ => StoreError::fatal(message),
    }
}
