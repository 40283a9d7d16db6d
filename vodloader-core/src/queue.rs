use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::{write::GzEncoder, Compression};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::models::RecordedPart;
use crate::sqlite::{from_millis, millis, open_connection, open_flags};

const QUEUE_SCHEMA: &str = include_str!("../../sql/queue.sql");

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to open queue database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on queue database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("queue path not configured")]
    MissingStore,
    #[error("invalid queue status: {0}")]
    InvalidStatus(String),
    #[error("queue record not found: {0}")]
    NotFound(i64),
    #[error("part {0} is not finalized and cannot be queued")]
    PartNotEnded(Uuid),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Processing,
    Done,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Processing => "processing",
            QueueStatus::Done => "done",
            QueueStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(QueueError::InvalidStatus(other.to_string())),
        }
    }
}

/// What the queue carries for one finalized part: the file and the metadata
/// needed to find it again, never a handle to the capture's state.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub part_id: Uuid,
    pub session_id: Uuid,
    pub channel_id: String,
    pub path: PathBuf,
    pub part_started_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn from_part(part: &RecordedPart) -> QueueResult<Self> {
        if !part.is_ended() {
            return Err(QueueError::PartNotEnded(part.id));
        }
        Ok(Self {
            part_id: part.id,
            session_id: part.session_id,
            channel_id: part.channel_id.clone(),
            path: part.path.clone(),
            part_started_at: part.started_at,
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueEntry {
    pub id: i64,
    pub part_id: Uuid,
    pub session_id: Uuid,
    pub channel_id: String,
    pub path: PathBuf,
    pub part_started_at: DateTime<Utc>,
    pub status: QueueStatus,
    pub attempts: i64,
    pub failure_reason: Option<String>,
    /// False for failures that must not be retried without an operator.
    pub retryable: bool,
    pub output_path: Option<PathBuf>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let parse_uuid = |column: &str| -> rusqlite::Result<Uuid> {
            let raw: String = row.get(column)?;
            Uuid::parse_str(&raw).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })
        };
        Ok(Self {
            id: row.get("id")?,
            part_id: parse_uuid("part_id")?,
            session_id: parse_uuid("session_id")?,
            channel_id: row.get("channel_id")?,
            path: PathBuf::from(row.get::<_, String>("path")?),
            part_started_at: from_millis(row.get("part_started_at_ms")?),
            status: row
                .get::<_, String>("status")?
                .parse()
                .unwrap_or(QueueStatus::Queued),
            attempts: row.get("attempts")?,
            failure_reason: row.get("failure_reason")?,
            retryable: row.get::<_, i64>("retryable")? != 0,
            output_path: row.get::<_, Option<String>>("output_path")?.map(PathBuf::from),
            created_at: parse_timestamp(row.get("created_at")?)?,
            updated_at: parse_timestamp(row.get("updated_at")?)?,
            started_at: parse_timestamp(row.get("started_at")?)?,
            finished_at: parse_timestamp(row.get("finished_at")?)?,
        })
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueSummary {
    pub counts: HashMap<QueueStatus, i64>,
}

impl QueueSummary {
    pub fn count(&self, status: QueueStatus) -> i64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueueFilter {
    pub status: Option<QueueStatus>,
    pub limit: Option<usize>,
}

/// Result of [`QueueStore::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted(i64),
    /// A retryable failed row for the same part was put back in line.
    Requeued(i64),
    /// The part is already queued, being processed, done, or failed in a
    /// way that needs an operator.
    AlreadyPresent(i64),
}

impl EnqueueOutcome {
    pub fn id(&self) -> i64 {
        match self {
            EnqueueOutcome::Inserted(id)
            | EnqueueOutcome::Requeued(id)
            | EnqueueOutcome::AlreadyPresent(id) => *id,
        }
    }

    pub fn is_new_work(&self) -> bool {
        !matches!(self, EnqueueOutcome::AlreadyPresent(_))
    }
}

#[derive(Debug, Clone)]
pub struct QueueStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for QueueStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl QueueStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> QueueResult<QueueStore> {
        let path = self.path.ok_or(QueueError::MissingStore)?;
        let flags = open_flags(self.read_only, self.create_if_missing);
        Ok(QueueStore { path, flags })
    }
}

/// Durable FIFO of finalized parts awaiting post-processing.
///
/// Rows move `queued -> processing -> done | failed`. Claiming is a single
/// immediate transaction, so one part is held by at most one worker even when
/// several processes share the database.
#[derive(Debug, Clone)]
pub struct QueueStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl QueueStore {
    pub fn builder() -> QueueStoreBuilder {
        QueueStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> QueueResult<Self> {
        QueueStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> QueueResult<Connection> {
        open_connection(&self.path, self.flags).map_err(|source| QueueError::Open {
            source,
            path: self.path.clone(),
        })
    }

    pub fn initialize(&self) -> QueueResult<()> {
        let conn = self.open()?;
        conn.execute_batch(QUEUE_SCHEMA)?;
        Ok(())
    }

    pub fn enqueue(&self, item: &QueueItem) -> QueueResult<EnqueueOutcome> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<(i64, String, bool)> = tx
            .query_row(
                "SELECT id, status, retryable FROM post_process_queue WHERE part_id = ?1",
                [item.part_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? != 0)),
            )
            .optional()?;
        let outcome = match existing {
            Some((id, status, true)) if status == QueueStatus::Failed.as_str() => {
                tx.execute(
                    "UPDATE post_process_queue SET status='queued', failure_reason=NULL,
                        updated_at=CURRENT_TIMESTAMP, finished_at=NULL WHERE id=?1",
                    [id],
                )?;
                EnqueueOutcome::Requeued(id)
            }
            Some((id, _, _)) => EnqueueOutcome::AlreadyPresent(id),
            None => {
                tx.execute(
                    "INSERT INTO post_process_queue (
                        part_id, session_id, channel_id, path, part_started_at_ms, status
                    ) VALUES (?1, ?2, ?3, ?4, ?5, 'queued')",
                    params![
                        item.part_id.to_string(),
                        item.session_id.to_string(),
                        &item.channel_id,
                        item.path.to_string_lossy(),
                        millis(item.part_started_at)
                    ],
                )?;
                EnqueueOutcome::Inserted(tx.last_insert_rowid())
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    /// Moves the oldest queued row (by part start time) to `processing` and
    /// returns it.
    pub fn claim_next(&self) -> QueueResult<Option<QueueEntry>> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let candidate = tx
            .query_row(
                "SELECT * FROM post_process_queue WHERE status='queued'
                 ORDER BY part_started_at_ms ASC, id ASC LIMIT 1",
                [],
                QueueEntry::from_row,
            )
            .optional()?;
        let Some(mut entry) = candidate else {
            tx.commit()?;
            return Ok(None);
        };
        tx.execute(
            "UPDATE post_process_queue SET status='processing', attempts=attempts+1,
                started_at=CURRENT_TIMESTAMP, updated_at=CURRENT_TIMESTAMP, failure_reason=NULL
             WHERE id=?1",
            [entry.id],
        )?;
        tx.commit()?;
        entry.status = QueueStatus::Processing;
        entry.attempts += 1;
        entry.started_at = Some(Utc::now());
        Ok(Some(entry))
    }

    pub fn mark_done(&self, id: i64, output_path: &Path) -> QueueResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE post_process_queue SET status='done', output_path=?1, failure_reason=NULL,
                finished_at=?2, updated_at=CURRENT_TIMESTAMP WHERE id=?3",
            params![output_path.to_string_lossy(), Utc::now().naive_utc(), id],
        )?;
        if affected == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    pub fn mark_failed(&self, id: i64, reason: &str, retryable: bool) -> QueueResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE post_process_queue SET status='failed', failure_reason=?1, retryable=?2,
                finished_at=?3, updated_at=CURRENT_TIMESTAMP WHERE id=?4",
            params![reason, i64::from(retryable), Utc::now().naive_utc(), id],
        )?;
        if affected == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    /// Puts rows left `processing` by a previous run, and retryable failed
    /// rows, back in line. Returns the number of rows touched.
    pub fn recover(&self) -> QueueResult<usize> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE post_process_queue SET status='queued', started_at=NULL, finished_at=NULL,
                updated_at=CURRENT_TIMESTAMP
             WHERE status='processing' OR (status='failed' AND retryable=1)",
            [],
        )?;
        Ok(affected)
    }

    /// Like [`QueueStore::recover`] but also requeues failures that were
    /// marked non-retryable.
    pub fn recover_all(&self) -> QueueResult<usize> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE post_process_queue SET status='queued', retryable=1, started_at=NULL,
                finished_at=NULL, updated_at=CURRENT_TIMESTAMP
             WHERE status IN ('processing', 'failed')",
            [],
        )?;
        Ok(affected)
    }

    pub fn get(&self, id: i64) -> QueueResult<Option<QueueEntry>> {
        let conn = self.open()?;
        let entry = conn
            .query_row(
                "SELECT * FROM post_process_queue WHERE id=?1",
                [id],
                QueueEntry::from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn list(&self, filter: &QueueFilter) -> QueueResult<Vec<QueueEntry>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM post_process_queue");
        let mut params: Vec<Value> = Vec::new();
        if let Some(status) = filter.status {
            query.push_str(" WHERE status = ?");
            params.push(Value::Text(status.as_str().to_string()));
        }
        query.push_str(" ORDER BY part_started_at_ms ASC, id ASC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            params.push(Value::Integer(limit as i64));
        }
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(
            params.iter().map(|value| value as &dyn rusqlite::ToSql),
        ))?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(QueueEntry::from_row(row)?);
        }
        Ok(entries)
    }

    pub fn summary(&self) -> QueueResult<QueueSummary> {
        let conn = self.open()?;
        let mut counts = HashMap::new();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM post_process_queue GROUP BY status")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            counts.insert(status.parse()?, count);
        }
        Ok(QueueSummary { counts })
    }

    /// Writes a gzip-compressed SQL dump of the queue table.
    pub fn export_backup(&self, output: impl AsRef<Path>) -> QueueResult<()> {
        let output = output.as_ref();
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let entries = self.list(&QueueFilter::default())?;
        let mut dump = String::new();
        dump.push_str(QUEUE_SCHEMA);
        dump.push('\n');
        dump.push_str("BEGIN;\n");
        for entry in entries {
            dump.push_str(&format!(
                "INSERT INTO post_process_queue (id, part_id, session_id, channel_id, path, part_started_at_ms, status, attempts, failure_reason, retryable, output_path) VALUES ({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {});\n",
                entry.id,
                sql_quote(&entry.part_id.to_string()),
                sql_quote(&entry.session_id.to_string()),
                sql_quote(&entry.channel_id),
                sql_quote(&entry.path.to_string_lossy()),
                millis(entry.part_started_at),
                sql_quote(entry.status.as_str()),
                entry.attempts,
                format_optional_text(entry.failure_reason),
                i64::from(entry.retryable),
                format_optional_text(entry.output_path.map(|p| p.to_string_lossy().into_owned())),
            ));
        }
        dump.push_str("COMMIT;\n");

        let file = File::create(output)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(dump.as_bytes())?;
        encoder.finish()?;
        Ok(())
    }
}

/// Shared handle to the queue: the durable store plus an in-process wake-up
/// signal for idle workers.
#[derive(Debug, Clone)]
pub struct PostProcessQueue {
    store: QueueStore,
    notify: Arc<Notify>,
}

impl PostProcessQueue {
    pub fn new(store: QueueStore) -> Self {
        Self {
            store,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    /// Queues a finalized part. Enqueueing the same part twice is a no-op
    /// while its first entry is pending or done.
    pub fn enqueue_part(&self, part: &RecordedPart) -> QueueResult<EnqueueOutcome> {
        let item = QueueItem::from_part(part)?;
        let outcome = self.store.enqueue(&item)?;
        if outcome.is_new_work() {
            self.notify.notify_one();
        } else {
            debug!(part_id = %part.id, "part already present in post-process queue");
        }
        Ok(outcome)
    }

    pub fn claim_next(&self) -> QueueResult<Option<QueueEntry>> {
        self.store.claim_next()
    }

    pub(crate) fn wake_all(&self) {
        self.notify.notify_waiters();
    }

    pub(crate) async fn wait_for_work(&self, max_wait: StdDuration) {
        let _ = tokio::time::timeout(max_wait, self.notify.notified()).await;
    }
}

fn sql_quote(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    format!("'{}'", escaped)
}

fn format_optional_text(value: Option<String>) -> String {
    value
        .map(|v| sql_quote(&v))
        .unwrap_or_else(|| "NULL".to_string())
}

fn parse_timestamp(value: Option<NaiveDateTime>) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    Ok(value.map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc)))
}
