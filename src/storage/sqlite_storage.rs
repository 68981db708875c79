//! Durable history backed by a SQLite database file.
//!
//! There is no count cap. When a retention window is configured, readings
//! older than the window are hidden from queries immediately and physically
//! deleted by a background sweep.

use std::{
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use rusqlite::{Connection, InterruptHandle, OptionalExtension, params};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, instrument, warn};

use crate::{
    reading::{Reading, Sample, Timestamp, now_millis},
    storage::{AppendReceipt, Backend, QueryLimits, Storage, StoreError},
};

// Lifecycle of one blocking operation, shared with the caller that awaits it.
const OP_PENDING: u8 = 0;
const OP_RUNNING: u8 = 1;
const OP_FINISHED: u8 = 2;

/// Rows removed per sweep statement. The connection lock is released between batches.
const SWEEP_BATCH: i64 = 1000;

#[derive(Debug, Clone)]
pub struct SqliteOptions {
    pub limits: QueryLimits,
    /// Maximum age of a reading. `None` keeps readings forever.
    pub retention: Option<Duration>,
    /// Upper bound for a single store operation, including waiting for the lock.
    pub operation_timeout: Duration,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            limits: QueryLimits::default(),
            retention: None,
            operation_timeout: Duration::from_secs(15),
        }
    }
}

pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    options: SqliteOptions,
}

impl SqliteStorage {
    /// Opens the database named by a connection string.
    ///
    /// Accepts `sqlite://<path>`, `sqlite:<path>`, a bare path, or `:memory:`.
    pub fn open(url: &str, options: SqliteOptions) -> Result<Self, StoreError> {
        let location = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);

        let conn = if location == ":memory:" {
            Connection::open_in_memory()?
        } else {
            let path = Path::new(location);
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent).map_err(|e| StoreError::CreateDirectory {
                        path: parent.to_path_buf(),
                        source: e,
                    })?;
                }
            }
            info!("Opening database at {}", path.display());
            Connection::open(path)?
        };

        conn.busy_timeout(options.operation_timeout)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        initialize_schema(&conn)?;

        Ok(Self {
            interrupt: Arc::new(conn.get_interrupt_handle()),
            conn: Arc::new(Mutex::new(conn)),
            options,
        })
    }

    pub fn retention(&self) -> Option<Duration> {
        self.options.retention
    }

    /// Oldest `created_at` still visible at `now`, if retention is enabled.
    fn cutoff(&self, now: Timestamp) -> Option<Timestamp> {
        self.options
            .retention
            .map(|window| now.saturating_sub(window.as_millis() as Timestamp))
    }

    /// Runs `op` against the connection on the blocking pool, bounded by the operation timeout.
    ///
    /// On timeout an operation still waiting for the connection is skipped, and
    /// one already running is interrupted so its transaction rolls back. A
    /// statement that completes in the instant before the interrupt lands can
    /// still commit after the caller has seen the timeout.
    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let timeout = self.options.operation_timeout;
        let state = Arc::new(AtomicU8::new(OP_PENDING));
        let conn = Arc::clone(&self.conn);
        let task_state = Arc::clone(&state);
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            if task_state
                .compare_exchange(OP_PENDING, OP_RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Err(StoreError::Timeout(timeout));
            }
            let result = op(&mut guard);
            task_state.store(OP_FINISHED, Ordering::Release);
            result
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined?,
            Err(_) => {
                let previous = state.swap(OP_FINISHED, Ordering::AcqRel);
                if previous == OP_RUNNING {
                    warn!(?timeout, "Interrupting store operation");
                    self.interrupt.interrupt();
                }
                Err(StoreError::Timeout(timeout))
            }
        }
    }

    /// Deletes every reading created before the retention cutoff.
    ///
    /// Returns the number of rows removed. Does nothing when retention is disabled.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        self.purge_expired_at(now_millis()).await
    }

    #[instrument(skip(self))]
    async fn purge_expired_at(&self, now: Timestamp) -> Result<usize, StoreError> {
        let Some(cutoff) = self.cutoff(now) else {
            return Ok(0);
        };

        let mut removed = 0;
        loop {
            let batch = self
                .run(move |conn| {
                    Ok(conn.execute(
                        "DELETE FROM readings WHERE id IN (
                             SELECT id FROM readings WHERE created_at < ?1 LIMIT ?2
                         )",
                        params![cutoff, SWEEP_BATCH],
                    )?)
                })
                .await?;
            removed += batch;
            if (batch as i64) < SWEEP_BATCH {
                break;
            }
        }

        if removed > 0 {
            info!(removed, "Expired readings past retention window");
        }
        Ok(removed)
    }

    /// Starts the background retention sweep.
    ///
    /// Returns `None` when retention is disabled. The task exits once `shutdown`
    /// flips to `true` or its sender is dropped.
    pub fn spawn_retention_sweep(
        self: &Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        let window = self.options.retention?;
        let store = Arc::clone(self);
        info!(?window, ?every, "Starting retention sweep");

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(error) = store.purge_expired().await {
                            warn!(%error, "Retention sweep failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Retention sweep stopped");
                            break;
                        }
                    }
                }
            }
        }))
    }
}

fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS readings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts INTEGER NOT NULL,
            t REAL NOT NULL,
            h REAL NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_readings_ts ON readings(ts DESC, id DESC);
        CREATE INDEX IF NOT EXISTS idx_readings_created_at ON readings(created_at);
        "#,
    )?;
    Ok(())
}

fn reading_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reading> {
    Ok(Reading {
        timestamp: row.get(0)?,
        temperature: row.get(1)?,
        humidity: row.get(2)?,
    })
}

#[async_trait::async_trait]
impl Storage for SqliteStorage {
    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    #[instrument(skip_all)]
    async fn append(&self, sample: Sample) -> Result<AppendReceipt, StoreError> {
        let (id, reading) = self
            .run(move |conn| {
                let tx = conn.transaction()?;
                let last: Option<Timestamp> =
                    tx.query_row("SELECT MAX(ts) FROM readings", [], |row| row.get(0))?;
                let created_at = now_millis();
                let reading = sample.at(created_at.max(last.unwrap_or(Timestamp::MIN)));
                tx.execute(
                    "INSERT INTO readings (ts, t, h, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        reading.timestamp,
                        reading.temperature,
                        reading.humidity,
                        created_at
                    ],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok((id, reading))
            })
            .await?;

        debug!(id, "Stored reading in database");
        Ok(AppendReceipt {
            id: Some(id.to_string()),
            size: None,
            reading,
        })
    }

    #[instrument(skip_all)]
    async fn recent(&self, limit: Option<usize>) -> Result<Vec<Reading>, StoreError> {
        let limit = self.options.limits.resolve(limit) as i64;
        let cutoff = self.cutoff(now_millis()).unwrap_or(Timestamp::MIN);
        let mut result = self
            .run(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT ts, t, h FROM readings
                     WHERE created_at >= ?1
                     ORDER BY ts DESC, id DESC
                     LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![cutoff, limit], reading_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        // Selected newest-first; callers get oldest-first.
        result.reverse();
        debug!("Found {} readings", result.len());
        Ok(result)
    }

    async fn latest(&self) -> Result<Option<Reading>, StoreError> {
        let cutoff = self.cutoff(now_millis()).unwrap_or(Timestamp::MIN);
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT ts, t, h FROM readings
                     WHERE created_at >= ?1
                     ORDER BY ts DESC, id DESC
                     LIMIT 1",
                    [cutoff],
                    reading_from_row,
                )
                .optional()?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn sample(t: f64, h: f64) -> Sample {
        Sample::new(t, h).unwrap()
    }

    fn open_temp(dir: &tempfile::TempDir, options: SqliteOptions) -> SqliteStorage {
        let url = format!("sqlite://{}", dir.path().join("readings.db").display());
        SqliteStorage::open(&url, options).unwrap()
    }

    #[tokio::test]
    async fn test_append_and_query_order() {
        let store = SqliteStorage::open(":memory:", SqliteOptions::default()).unwrap();
        assert_eq!(store.latest().await.unwrap(), None);
        assert!(store.recent(Some(10)).await.unwrap().is_empty());

        let mut ids = Vec::new();
        for (t, h) in [(20.0, 50.0), (21.0, 51.0), (22.0, 52.0)] {
            let receipt = store.append(sample(t, h)).await.unwrap();
            ids.push(receipt.id.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 3);

        let recent = store.recent(Some(2)).await.unwrap();
        let values: Vec<_> = recent.iter().map(|r| (r.temperature, r.humidity)).collect();
        assert_eq!(values, vec![(21.0, 51.0), (22.0, 52.0)]);
        assert!(recent[0].timestamp <= recent[1].timestamp);
        assert_eq!(store.latest().await.unwrap(), recent.last().copied());
    }

    #[tokio::test]
    async fn test_limit_is_clamped() {
        let options = SqliteOptions {
            limits: QueryLimits { default: 2, max: 3 },
            ..SqliteOptions::default()
        };
        let store = SqliteStorage::open(":memory:", options).unwrap();
        for i in 0..5 {
            store.append(sample(i as f64, 0.0)).await.unwrap();
        }
        assert_eq!(store.recent(None).await.unwrap().len(), 2);
        assert_eq!(store.recent(Some(100)).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_temp(&dir, SqliteOptions::default());
            store.append(sample(18.0, 40.0)).await.unwrap();
            store.append(sample(19.0, 41.0)).await.unwrap();
        }

        let store = open_temp(&dir, SqliteOptions::default());
        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!((latest.temperature, latest.humidity), (19.0, 41.0));
        assert_eq!(store.recent(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_purge_removes_expired() {
        let options = SqliteOptions {
            retention: Some(DAY),
            ..SqliteOptions::default()
        };
        let store = SqliteStorage::open(":memory:", options).unwrap();
        store.append(sample(20.0, 50.0)).await.unwrap();
        store.append(sample(21.0, 51.0)).await.unwrap();

        assert_eq!(store.purge_expired().await.unwrap(), 0);
        let later = now_millis() + 2 * DAY.as_millis() as Timestamp;
        assert_eq!(store.purge_expired_at(later).await.unwrap(), 2);
        assert!(store.recent(None).await.unwrap().is_empty());
        assert_eq!(store.latest().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_rows_hidden_before_sweep() {
        let options = SqliteOptions {
            retention: Some(DAY),
            ..SqliteOptions::default()
        };
        let store = SqliteStorage::open(":memory:", options).unwrap();
        {
            let old = now_millis() - 3 * DAY.as_millis() as Timestamp;
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO readings (ts, t, h, created_at) VALUES (?1, 1.0, 2.0, ?1)",
                [old],
            )
            .unwrap();
        }
        assert_eq!(store.latest().await.unwrap(), None);

        store.append(sample(22.0, 52.0)).await.unwrap();
        let recent = store.recent(None).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].temperature, 22.0);
    }

    #[tokio::test]
    async fn test_retention_disabled_keeps_everything() {
        let store = SqliteStorage::open(":memory:", SqliteOptions::default()).unwrap();
        store.append(sample(20.0, 50.0)).await.unwrap();
        let far_future = now_millis() + 3650 * DAY.as_millis() as Timestamp;
        assert_eq!(store.purge_expired_at(far_future).await.unwrap(), 0);
        assert_eq!(store.recent(None).await.unwrap().len(), 1);

        let store = Arc::new(store);
        let (_tx, rx) = watch::channel(false);
        assert!(store.spawn_retention_sweep(Duration::from_secs(1), rx).is_none());
    }

    #[tokio::test]
    async fn test_timed_out_append_is_not_stored() {
        let options = SqliteOptions {
            operation_timeout: Duration::from_millis(50),
            ..SqliteOptions::default()
        };
        let store = SqliteStorage::open(":memory:", options).unwrap();

        let held = store.conn.lock().unwrap();
        let result = store.append(sample(20.0, 50.0)).await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
        drop(held);

        // Let the abandoned task acquire the connection and give up.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.recent(None).await.unwrap().is_empty());
        store.append(sample(21.0, 51.0)).await.unwrap();
        assert_eq!(store.recent(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_stops_on_shutdown() {
        let options = SqliteOptions {
            retention: Some(DAY),
            ..SqliteOptions::default()
        };
        let store = Arc::new(SqliteStorage::open(":memory:", options).unwrap());
        let (tx, rx) = watch::channel(false);
        let handle = store
            .spawn_retention_sweep(Duration::from_millis(10), rx)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
