//! Durable message store on a single SQLite file.
//!
//! All lifecycle transitions run as individual transactions, so a crash
//! between any two calls leaves every message in a well-defined state.
//! The file is opened in WAL mode: readers never block the single writer
//! lane, and a claim is one conditional `UPDATE ... RETURNING` that is
//! atomic against concurrent workers.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{FromRow, Row, SqlitePool};
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::message::{
    now_millis, FailedMessage, Message, MetricRow, NewMessage, Priority, Status,
};

/// Maximum time [`Store::open_with_retry`] keeps retrying an unavailable
/// store before giving up.
pub const OPEN_RETRY_WINDOW: Duration = Duration::from_secs(30);

/// Statistics rows older than this are removed by [`Store::cleanup`].
const STATS_RETENTION_MS: i64 = 30 * 24 * 3600 * 1000;

/// Outcome of [`Store::fail_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Budget remained: the message is `pending` again and becomes
    /// eligible at `next_attempt_at`.
    Requeued {
        /// The retry count after the increment.
        attempt: i64,
        /// Earliest eligible claim time, epoch milliseconds.
        next_attempt_at: i64,
    },
    /// Budget exhausted: archived and marked `failed`.
    Archived,
    /// The row was no longer leased (reclaimed, reset or expired in the
    /// meantime); nothing was changed.
    Skipped,
}

/// Live message counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    /// Rows waiting to be claimed.
    pub pending: i64,
    /// Rows currently leased by workers.
    pub processing: i64,
    /// Rows delivered successfully.
    pub completed: i64,
    /// Rows terminally failed.
    pub failed: i64,
    /// Rows expired before delivery.
    pub expired: i64,
}

impl StatusCounts {
    /// Total rows currently in the `messages` table.
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed + self.expired
    }
}

/// Pending/processing totals per `source -> destination` route.
#[derive(Debug, Clone, FromRow, serde::Serialize)]
pub struct RouteCount {
    /// Ingress side of the route.
    pub source: String,
    /// Egress side of the route.
    pub destination: String,
    /// Messages currently pending or processing on this route.
    pub count: i64,
}

/// Exclusive sidecar lock preventing two bridge processes from opening
/// the same store file.
struct SidecarLock {
    path: PathBuf,
}

impl SidecarLock {
    fn acquire(db_path: &Path) -> Result<Self, BridgeError> {
        let path = PathBuf::from(format!("{}.lock", db_path.display()));
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let owner = std::fs::read_to_string(&path).unwrap_or_default();
                Err(BridgeError::StoreUnavailable(sqlx::Error::Io(
                    std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        format!(
                            "store is locked by another bridge process (pid {}); remove {} if stale",
                            owner.trim(),
                            path.display()
                        ),
                    ),
                )))
            }
            Err(err) => Err(BridgeError::StoreUnavailable(sqlx::Error::Io(err))),
        }
    }
}

impl Drop for SidecarLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Transactional storage for messages, the failed-message archive and
/// metric snapshots.
pub struct Store {
    pool: SqlitePool,
    _lock: Option<SidecarLock>,
}

impl Store {
    /// Open (creating if missing) the store file without the process
    /// lock. Used by the operator CLI, which must coexist with a running
    /// bridge.
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        Self::connect(db_path.as_ref(), None).await
    }

    /// Open the store file holding the exclusive sidecar lock. Used by
    /// the bridge process itself.
    pub async fn open_exclusive(db_path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let lock = SidecarLock::acquire(db_path.as_ref())?;
        Self::connect(db_path.as_ref(), Some(lock)).await
    }

    /// Open exclusively, retrying transient failures with exponential
    /// backoff for up to [`OPEN_RETRY_WINDOW`].
    pub async fn open_with_retry(db_path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let db_path = db_path.as_ref();
        let mut delay = Duration::from_millis(500);
        let mut waited = Duration::ZERO;
        loop {
            match Self::open_exclusive(db_path).await {
                Ok(store) => return Ok(store),
                Err(err) if err.is_retryable() && waited < OPEN_RETRY_WINDOW => {
                    warn!(%err, ?delay, "store unavailable, retrying");
                    tokio::time::sleep(delay).await;
                    waited += delay;
                    delay = (delay * 2).min(Duration::from_secs(8));
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn connect(db_path: &Path, lock: Option<SidecarLock>) -> Result<Self, BridgeError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool, _lock: lock })
    }

    /// Close the connection pool. The sidecar lock is released when the
    /// store is dropped.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert a new `pending` message and return its id.
    pub async fn insert(
        &self,
        message: &NewMessage,
        created_at: i64,
        expire_at: i64,
    ) -> Result<i64, BridgeError> {
        let id = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO messages (
                source, destination, topic_or_node, value, data_type,
                status, priority, retry_count, max_retries,
                created_at, expire_at, next_attempt_at
            )
            VALUES ($1, $2, $3, $4, $5, 'pending', $6, 0, $7, $8, $9, $8)
            RETURNING id
            ",
        )
        .bind(message.source)
        .bind(message.destination)
        .bind(&message.topic_or_node)
        .bind(&message.value)
        .bind(message.data_type)
        .bind(message.priority)
        .bind(i64::from(message.max_retries))
        .bind(created_at)
        .bind(expire_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Replace the value of an existing `pending` row for the same
    /// `(destination, topic_or_node, priority)` stream, refreshing its
    /// age and TTL. Returns the id of the replaced row, if any.
    pub async fn coalesce_pending(
        &self,
        message: &NewMessage,
        created_at: i64,
        expire_at: i64,
    ) -> Result<Option<i64>, BridgeError> {
        let id = sqlx::query_scalar::<_, i64>(
            r"
            UPDATE messages
            SET value = $1, created_at = $2, expire_at = $3, next_attempt_at = $2
            WHERE id IN (
                SELECT id FROM messages
                WHERE status = 'pending'
                  AND destination = $4 AND topic_or_node = $5 AND priority = $6
                LIMIT 1
            )
            RETURNING id
            ",
        )
        .bind(&message.value)
        .bind(created_at)
        .bind(expire_at)
        .bind(message.destination)
        .bind(&message.topic_or_node)
        .bind(message.priority)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }

    /// Atomically claim up to `limit` eligible pending messages for
    /// `worker_id`, stamping the lease.
    ///
    /// Eligible means `pending`, past `next_attempt_at`, and not yet
    /// expired; claim order is `(priority ASC, created_at ASC)`. Rows
    /// that fail to decode are quarantined to the archive inside the
    /// same transaction and skipped.
    pub async fn claim(
        &self,
        limit: u32,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Vec<Message>, BridgeError> {
        let now = now_millis();
        let lease_deadline = now + lease_duration.as_millis() as i64;

        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r"
            UPDATE messages
            SET status = 'processing', lease_owner = $1, lease_deadline = $2
            WHERE id IN (
                SELECT id FROM messages
                WHERE status = 'pending' AND next_attempt_at <= $3 AND expire_at > $3
                ORDER BY priority ASC, created_at ASC
                LIMIT $4
            )
            RETURNING *
            ",
        )
        .bind(worker_id)
        .bind(lease_deadline)
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            match Message::from_row(&row) {
                Ok(message) => claimed.push(message),
                Err(err) => match row.try_get::<i64, _>("id") {
                    Ok(id) => {
                        warn!(message.id = id, %err, "quarantining undecodable row");
                        Self::quarantine_in_tx(&mut tx, id, now).await?;
                    }
                    Err(err) => {
                        return Err(BridgeError::Integrity(format!(
                            "claimed row has no readable id: {err}"
                        )))
                    }
                },
            }
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn quarantine_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        id: i64,
        now: i64,
    ) -> Result<(), BridgeError> {
        sqlx::query(
            r"
            INSERT INTO failed_messages
                (original_id, source, destination, topic_or_node, value,
                 error_message, failed_at, retry_count)
            SELECT id, source, destination, topic_or_node, value,
                   'integrity', $1, retry_count
            FROM messages WHERE id = $2
            ",
        )
        .bind(now)
        .bind(id)
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            "UPDATE messages SET status = 'failed', last_error = 'integrity',
             lease_owner = NULL, lease_deadline = NULL WHERE id = $1",
        )
        .bind(id)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Mark a leased message delivered. Returns false if the row was no
    /// longer `processing`, so a completion is recorded at most once.
    pub async fn complete(&self, id: i64) -> Result<bool, BridgeError> {
        let result = sqlx::query(
            r"
            UPDATE messages
            SET status = 'completed', processed_at = $1,
                lease_owner = NULL, lease_deadline = NULL
            WHERE id = $2 AND status = 'processing'
            ",
        )
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a retryable delivery failure.
    ///
    /// Requeues with an incremented retry count and a next-attempt time
    /// of `now + backoff` while budget remains; archives and marks
    /// `failed` once the budget is exhausted.
    pub async fn fail_retry(
        &self,
        id: i64,
        error: &str,
        backoff: Duration,
    ) -> Result<FailDisposition, BridgeError> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT retry_count, max_retries FROM messages WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((retry_count, max_retries)) = row else {
            tx.rollback().await?;
            return Ok(FailDisposition::Skipped);
        };

        let disposition = if retry_count + 1 <= max_retries {
            let next_attempt_at = now + backoff.as_millis() as i64;
            sqlx::query(
                r"
                UPDATE messages
                SET status = 'pending', retry_count = retry_count + 1,
                    next_attempt_at = $1, last_error = $2,
                    lease_owner = NULL, lease_deadline = NULL
                WHERE id = $3
                ",
            )
            .bind(next_attempt_at)
            .bind(error)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            FailDisposition::Requeued {
                attempt: retry_count + 1,
                next_attempt_at,
            }
        } else {
            Self::archive_in_tx(&mut tx, id, error, now).await?;
            FailDisposition::Archived
        };

        tx.commit().await?;
        Ok(disposition)
    }

    /// Archive a message and mark it `failed` regardless of remaining
    /// retry budget (permanent egress rejection or coercion failure).
    pub async fn fail_permanent(&self, id: i64, error: &str) -> Result<bool, BridgeError> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM messages WHERE id = $1 AND status IN ('pending', 'processing')",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        if exists.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }

        Self::archive_in_tx(&mut tx, id, error, now).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn archive_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        id: i64,
        error: &str,
        now: i64,
    ) -> Result<(), BridgeError> {
        sqlx::query(
            r"
            INSERT INTO failed_messages
                (original_id, source, destination, topic_or_node, value,
                 error_message, failed_at, retry_count)
            SELECT id, source, destination, topic_or_node, value, $1, $2, retry_count
            FROM messages WHERE id = $3
            ",
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r"
            UPDATE messages
            SET status = 'failed', last_error = $1,
                lease_owner = NULL, lease_deadline = NULL
            WHERE id = $2
            ",
        )
        .bind(error)
        .bind(id)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Sweep pending and processing rows whose TTL elapsed: archive each
    /// with the `ttl` tag and mark it `expired`. Returns the number of
    /// rows expired.
    pub async fn expire_due(&self, now: i64) -> Result<u64, BridgeError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO failed_messages
                (original_id, source, destination, topic_or_node, value,
                 error_message, failed_at, retry_count)
            SELECT id, source, destination, topic_or_node, value, 'ttl', $1, retry_count
            FROM messages
            WHERE expire_at <= $1 AND status IN ('pending', 'processing')
            ",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query(
            r"
            UPDATE messages
            SET status = 'expired', last_error = 'ttl',
                lease_owner = NULL, lease_deadline = NULL
            WHERE expire_at <= $1 AND status IN ('pending', 'processing')
            ",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let count = updated.rows_affected();
        if count > 0 {
            debug!(count, "expired messages past their TTL");
        }
        Ok(count)
    }

    /// Return abandoned leases (`processing` past `lease_deadline`) to
    /// `pending`, charging one attempt against the retry budget.
    pub async fn reclaim_stuck(&self, now: i64) -> Result<u64, BridgeError> {
        let result = sqlx::query(
            r"
            UPDATE messages
            SET status = 'pending',
                retry_count = MIN(retry_count + 1, max_retries),
                next_attempt_at = $1,
                lease_owner = NULL, lease_deadline = NULL
            WHERE status = 'processing' AND lease_deadline <= $1
            ",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Startup recovery: return every `processing` row to `pending`,
    /// charging one attempt, regardless of lease deadline.
    ///
    /// Only sound while holding the exclusive sidecar lock: any lease
    /// found at startup belongs to a dead process.
    pub async fn recover_abandoned(&self) -> Result<u64, BridgeError> {
        let result = sqlx::query(
            r"
            UPDATE messages
            SET status = 'pending',
                retry_count = MIN(retry_count + 1, max_retries),
                next_attempt_at = $1,
                lease_owner = NULL, lease_deadline = NULL
            WHERE status = 'processing'
            ",
        )
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Operator recovery: return every `processing` row to `pending`
    /// without touching `retry_count` or `last_error`.
    pub async fn reset_processing(&self) -> Result<u64, BridgeError> {
        let result = sqlx::query(
            r"
            UPDATE messages
            SET status = 'pending', next_attempt_at = $1,
                lease_owner = NULL, lease_deadline = NULL
            WHERE status = 'processing'
            ",
        )
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Remove `completed` rows processed before `older_than` (epoch
    /// milliseconds) and statistics rows past their 30-day retention.
    /// Returns the number of completed rows removed.
    pub async fn cleanup(&self, older_than: i64) -> Result<u64, BridgeError> {
        let removed = sqlx::query(
            "DELETE FROM messages WHERE status = 'completed' AND processed_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?
        .rows_affected();

        sqlx::query("DELETE FROM statistics WHERE timestamp < $1")
            .bind(now_millis() - STATS_RETENTION_MS)
            .execute(&self.pool)
            .await?;

        Ok(removed)
    }

    /// Live row counts per status.
    pub async fn status_counts(&self) -> Result<StatusCounts, BridgeError> {
        let rows: Vec<(Status, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM messages GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match status {
                Status::Pending => counts.pending = count,
                Status::Processing => counts.processing = count,
                Status::Completed => counts.completed = count,
                Status::Failed => counts.failed = count,
                Status::Expired => counts.expired = count,
            }
        }
        Ok(counts)
    }

    /// Number of rows currently `pending`.
    pub async fn pending_count(&self) -> Result<i64, BridgeError> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?,
        )
    }

    /// `created_at` of the oldest pending row, if any.
    pub async fn oldest_pending(&self) -> Result<Option<i64>, BridgeError> {
        Ok(
            sqlx::query_scalar("SELECT MIN(created_at) FROM messages WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?,
        )
    }

    /// Pending/processing totals grouped by `source -> destination`.
    pub async fn route_counts(&self) -> Result<Vec<RouteCount>, BridgeError> {
        Ok(sqlx::query_as(
            r"
            SELECT source, destination, COUNT(*) as count
            FROM messages
            WHERE status IN ('pending', 'processing')
            GROUP BY source, destination
            ORDER BY count DESC
            ",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// The oldest `limit` pending rows in claim order.
    pub async fn pending_messages(&self, limit: u32) -> Result<Vec<Message>, BridgeError> {
        Ok(sqlx::query_as(
            r"
            SELECT * FROM messages
            WHERE status = 'pending'
            ORDER BY priority ASC, created_at ASC
            LIMIT $1
            ",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?)
    }

    /// The newest `limit` archive rows.
    pub async fn failed_archive(&self, limit: u32) -> Result<Vec<FailedMessage>, BridgeError> {
        Ok(
            sqlx::query_as("SELECT * FROM failed_messages ORDER BY failed_at DESC, id DESC LIMIT $1")
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Total rows in the failed-message archive.
    pub async fn failed_archive_count(&self) -> Result<i64, BridgeError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM failed_messages")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Count of messages completed at or after `since` (epoch ms).
    pub async fn completed_since(&self, since: i64) -> Result<i64, BridgeError> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE status = 'completed' AND processed_at >= $1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?)
    }

    /// Append one metric snapshot: a row per `(name, value)` pair, all
    /// sharing `timestamp`.
    pub async fn record_metrics(
        &self,
        timestamp: i64,
        metrics: &[(&str, f64)],
    ) -> Result<(), BridgeError> {
        let mut tx = self.pool.begin().await?;
        for (name, value) in metrics {
            sqlx::query(
                "INSERT INTO statistics (timestamp, metric_name, metric_value) VALUES ($1, $2, $3)",
            )
            .bind(timestamp)
            .bind(name)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// The most recent snapshot (all rows sharing the latest timestamp).
    pub async fn latest_snapshot(&self) -> Result<Vec<MetricRow>, BridgeError> {
        Ok(sqlx::query_as(
            r"
            SELECT timestamp, metric_name, metric_value FROM statistics
            WHERE timestamp = (SELECT MAX(timestamp) FROM statistics)
            ORDER BY metric_name
            ",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Full metric history, oldest first.
    pub async fn metric_history(&self) -> Result<Vec<MetricRow>, BridgeError> {
        Ok(sqlx::query_as(
            "SELECT timestamp, metric_name, metric_value FROM statistics ORDER BY timestamp, metric_name",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Run SQLite's integrity check; errors with
    /// [`BridgeError::Integrity`] unless the store reports `ok`.
    pub async fn integrity_check(&self) -> Result<(), BridgeError> {
        let verdict: String = sqlx::query_scalar("PRAGMA integrity_check")
            .fetch_one(&self.pool)
            .await?;
        if verdict == "ok" {
            Ok(())
        } else {
            Err(BridgeError::Integrity(verdict))
        }
    }

    /// Messages with a given priority currently pending (test and
    /// monitoring aid).
    pub async fn pending_count_at(&self, priority: Priority) -> Result<i64, BridgeError> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE status = 'pending' AND priority = $1",
        )
        .bind(priority)
        .fetch_one(&self.pool)
        .await?)
    }

    /// Fetch a single message by id.
    pub async fn get(&self, id: i64) -> Result<Option<Message>, BridgeError> {
        Ok(sqlx::query_as("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }
}
