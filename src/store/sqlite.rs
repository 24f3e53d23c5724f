use super::{JobStore, not_deletable};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use plotq_shared::{Job, JobError, JobParameters, JobStatus, NewJob, StatusUpdate};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const JOB_COLUMNS: &str = "seq, id, filename, filepath, status, progress, created_at, started_at, completed_at, error, parameters";

/// `jobs` table in a SQLite file. Every column is plain text or integer, parameters are a
/// JSON blob and timestamps are RFC 3339 with fixed microsecond precision, so lexical
/// order equals chronological order.
///
/// rusqlite is blocking (and may sit in `busy_timeout`), so every operation runs on the
/// blocking pool through `blocking`.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JobError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(sql)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(sql)?;
        install_schema(&conn)?;
        tracing::info!("Job store opened at {}", path.display());
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, JobError> {
        let conn = Connection::open_in_memory().map_err(sql)?;
        install_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, JobError>
    where
        F: FnOnce(&mut Connection) -> Result<T, JobError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| JobError::Storage("job store connection lock poisoned".to_string()))?;
            op(&mut conn)
        })
        .await
        .map_err(|e| JobError::Storage(format!("spawn_blocking join error: {e}")))?
    }
}

fn install_schema(conn: &Connection) -> Result<(), JobError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS jobs (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            filename TEXT NOT NULL,
            filepath TEXT NOT NULL,
            status TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            error TEXT,
            parameters TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS jobs_status_fifo ON jobs(status, created_at, seq);",
    )
    .map_err(sql)
}

fn sql(err: rusqlite::Error) -> JobError {
    JobError::Storage(format!("sqlite: {err}"))
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, JobError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| JobError::Storage(format!("bad timestamp '{raw}': {e}")))
}

/// Row exactly as stored, before parsing.
struct JobRow {
    seq: i64,
    id: String,
    filename: String,
    filepath: String,
    status: String,
    progress: i64,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error: Option<String>,
    parameters: String,
}

impl JobRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            filename: row.get(2)?,
            filepath: row.get(3)?,
            status: row.get(4)?,
            progress: row.get(5)?,
            created_at: row.get(6)?,
            started_at: row.get(7)?,
            completed_at: row.get(8)?,
            error: row.get(9)?,
            parameters: row.get(10)?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let parameters: JobParameters = serde_json::from_str(&row.parameters)?;
        Ok(Job {
            seq: row.seq,
            id: row.id,
            filename: row.filename,
            filepath: PathBuf::from(row.filepath),
            status: row.status.parse()?,
            progress: row.progress.clamp(0, 100) as u8,
            created_at: parse_ts(&row.created_at)?,
            started_at: row.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: row.completed_at.as_deref().map(parse_ts).transpose()?,
            error: row.error,
            parameters,
        })
    }
}

fn select_job(conn: &Connection, id: &str) -> Result<Option<Job>, JobError> {
    let row = conn
        .query_row(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id=?1"), params![id], JobRow::read)
        .optional()
        .map_err(sql)?;
    row.map(Job::try_from).transpose()
}

fn count_where(conn: &Connection, clause: &str, args: impl rusqlite::Params) -> Result<usize, JobError> {
    let count: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM jobs WHERE {clause}"), args, |row| row.get(0))
        .map_err(sql)?;
    Ok(count.max(0) as usize)
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: NewJob) -> Result<Job, JobError> {
        let parameters = serde_json::to_string(&job.parameters)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO jobs(id, filename, filepath, status, progress, created_at, parameters) \
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
                params![
                    job.id,
                    job.filename,
                    job.filepath.to_string_lossy().into_owned(),
                    JobStatus::Queued.as_str(),
                    format_ts(job.created_at),
                    parameters,
                ],
            )
            .map_err(sql)?;
            Ok(job.into_job(conn.last_insert_rowid()))
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, JobError> {
        let id = id.to_string();
        self.blocking(move |conn| select_job(conn, &id)).await
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE ?1 IS NULL OR status=?1 \
                     ORDER BY created_at DESC, seq DESC \
                     LIMIT ?2"
                ))
                .map_err(sql)?;
            let rows = stmt
                .query_map(params![status.map(|s| s.as_str()), limit], JobRow::read)
                .map_err(sql)?;

            let mut out = Vec::new();
            for row in rows {
                out.push(Job::try_from(row.map_err(sql)?)?);
            }
            Ok(out)
        })
        .await
    }

    async fn next_queued(&self) -> Result<Option<Job>, JobError> {
        self.blocking(|conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs WHERE status=?1 \
                         ORDER BY created_at ASC, seq ASC LIMIT 1"
                    ),
                    params![JobStatus::Queued.as_str()],
                    JobRow::read,
                )
                .optional()
                .map_err(sql)?;
            row.map(Job::try_from).transpose()
        })
        .await
    }

    async fn queue_position(&self, id: &str) -> Result<usize, JobError> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction().map_err(sql)?;
            let position = match select_job(&tx, &id)? {
                Some(job) if job.status == JobStatus::Queued => count_where(
                    &tx,
                    "status=?1 AND (created_at < ?2 OR (created_at = ?2 AND seq <= ?3))",
                    params![JobStatus::Queued.as_str(), format_ts(job.created_at), job.seq],
                )?,
                _ => 0,
            };
            tx.commit().map_err(sql)?;
            Ok(position)
        })
        .await
    }

    async fn count(&self, status: JobStatus) -> Result<usize, JobError> {
        self.blocking(move |conn| count_where(conn, "status=?1", params![status.as_str()])).await
    }

    async fn update_status(&self, id: &str, update: &StatusUpdate) -> Result<Job, JobError> {
        let id = id.to_string();
        let update = update.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction().map_err(sql)?;
            let mut job = select_job(&tx, &id)?.ok_or_else(|| JobError::NotFound(id.clone()))?;
            job.apply(&update, Utc::now().trunc_subsecs(6))?;
            tx.execute(
                "UPDATE jobs SET status=?1, progress=?2, started_at=?3, completed_at=?4, error=?5 WHERE id=?6",
                params![
                    job.status.as_str(),
                    i64::from(job.progress),
                    job.started_at.map(format_ts),
                    job.completed_at.map(format_ts),
                    job.error,
                    job.id,
                ],
            )
            .map_err(sql)?;
            tx.commit().map_err(sql)?;
            Ok(job)
        })
        .await
    }

    async fn remove(&self, id: &str) -> Result<Option<Job>, JobError> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction().map_err(sql)?;
            let job = match select_job(&tx, &id)? {
                None => return Ok(None),
                Some(job) if job.status.is_active() => return Err(not_deletable(&job)),
                Some(job) => job,
            };
            tx.execute("DELETE FROM jobs WHERE id=?1", params![id]).map_err(sql)?;
            tx.commit().map_err(sql)?;
            Ok(Some(job))
        })
        .await
    }
}
