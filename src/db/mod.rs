//! SQLite persistence. All connection access funnels through one worker
//! thread via an mpsc command queue, so every statement (the daily-stat
//! upsert included) executes serialized on a single connection.

use std::{
    convert::TryFrom,
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use log::{error, info};
use rusqlite::{params, Connection, Row};
use tokio::sync::oneshot;
use uuid::Uuid;

mod migrations;

use migrations::run_migrations;

use crate::{
    models::{CloseOutcome, DailyStat, FocusSession, SessionClose, Task},
    store::{SessionStore, StatStore, TaskStore},
};

const DAY_FORMAT: &str = "%Y-%m-%d";

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to DB thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join DB thread: {join_err:?}");
            }
        }
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

fn to_u64(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("value {value} is negative"))
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid datetime '{value}': {err}"))
}

fn parse_day(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, DAY_FORMAT)
        .map_err(|err| anyhow!("invalid day key '{value}': {err}"))
}

fn day_key(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

fn row_to_session(row: &Row<'_>) -> Result<FocusSession> {
    let start_time: String = row.get("start_time")?;
    let end_time: Option<String> = row.get("end_time")?;
    let duration_secs: Option<i64> = row.get("duration_secs")?;
    let created_at: String = row.get("created_at")?;

    Ok(FocusSession {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        task_id: row.get("task_id")?,
        start_time: parse_datetime(&start_time)?,
        end_time: end_time.as_deref().map(parse_datetime).transpose()?,
        duration_secs: duration_secs.map(to_u64).transpose()?,
        completed: row.get("completed")?,
        notes: row.get("notes")?,
        created_at: parse_datetime(&created_at)?,
    })
}

fn row_to_stat(row: &Row<'_>) -> Result<DailyStat> {
    let date: String = row.get("date")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(DailyStat {
        user_id: row.get("user_id")?,
        date: parse_day(&date)?,
        total_focus_secs: to_u64(row.get("total_focus_secs")?)?,
        total_sessions: to_u64(row.get("total_sessions")?)?,
        completed_tasks: to_u64(row.get("completed_tasks")?)?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

fn row_to_task(row: &Row<'_>) -> Result<Task> {
    let deadline: Option<String> = row.get("deadline")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Task {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        priority: row.get("priority")?,
        deadline: deadline.as_deref().map(parse_datetime).transpose()?,
        completed: row.get("completed")?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

const SESSION_COLUMNS: &str =
    "id, user_id, task_id, start_time, end_time, duration_secs, completed, notes, created_at";
const STAT_COLUMNS: &str =
    "user_id, date, total_focus_secs, total_sessions, completed_tasks, created_at, updated_at";
const TASK_COLUMNS: &str =
    "id, user_id, title, description, priority, deadline, completed, created_at, updated_at";

#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    db_path: Arc<PathBuf>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("focusflow-db".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(
                            Err(anyhow::Error::new(err).context("failed to open SQLite database")),
                        );
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }
                if let Err(err) = conn.pragma_update(None, "foreign_keys", "ON") {
                    error!("Failed to enable foreign keys: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run database migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("DB initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Database thread shutting down");
            })
            .with_context(|| "failed to spawn database worker thread")?;

        ready_rx
            .recv()
            .context("database worker exited before signaling readiness")??;

        info!("Database initialized at {}", db_path.as_path().display());

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("DB caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to DB thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database thread terminated unexpectedly"))?
    }

    /// Task writes belong to the surrounding application, not the engine;
    /// this stays outside the `TaskStore` seam on purpose.
    pub async fn insert_task(&self, task: &Task) -> Result<()> {
        let record = task.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO tasks (id, user_id, title, description, priority, deadline, completed, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id,
                    record.user_id,
                    record.title,
                    record.description,
                    record.priority,
                    record.deadline.as_ref().map(|dt| dt.to_rfc3339()),
                    record.completed,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .with_context(|| "failed to insert task")?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl SessionStore for Database {
    async fn create_session(
        &self,
        user_id: &str,
        task_id: Option<&str>,
        start_time: DateTime<Utc>,
    ) -> Result<FocusSession> {
        let session = FocusSession {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            task_id: task_id.map(str::to_string),
            start_time,
            end_time: None,
            duration_secs: None,
            completed: false,
            notes: None,
            created_at: start_time,
        };

        let record = session.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO focus_sessions (id, user_id, task_id, start_time, end_time, duration_secs, completed, notes, created_at)
                 VALUES (?1, ?2, ?3, ?4, NULL, NULL, 0, NULL, ?5)",
                params![
                    record.id,
                    record.user_id,
                    record.task_id,
                    record.start_time.to_rfc3339(),
                    record.created_at.to_rfc3339(),
                ],
            )
            .with_context(|| "failed to insert focus session")?;
            Ok(())
        })
        .await?;

        Ok(session)
    }

    async fn fetch_session(&self, session_id: &str) -> Result<Option<FocusSession>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM focus_sessions WHERE id = ?1"
            ))?;

            let mut rows = stmt.query(params![session_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn close_session(&self, session_id: &str, close: SessionClose) -> Result<CloseOutcome> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE focus_sessions
                     SET end_time = ?1,
                         duration_secs = ?2,
                         completed = ?3,
                         notes = ?4
                     WHERE id = ?5 AND end_time IS NULL",
                    params![
                        close.end_time.to_rfc3339(),
                        to_i64(close.duration_secs)?,
                        close.completed,
                        close.notes,
                        session_id,
                    ],
                )
                .with_context(|| "failed to close focus session")?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM focus_sessions WHERE id = ?1"
            ))?;
            let mut rows = stmt.query(params![session_id])?;
            let session = match rows.next()? {
                Some(row) => row_to_session(row)?,
                None => bail!("session {session_id} not found"),
            };

            Ok(CloseOutcome {
                session,
                newly_closed: changed > 0,
            })
        })
        .await
    }

    async fn fetch_active_session(&self, user_id: &str) -> Result<Option<FocusSession>> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM focus_sessions
                 WHERE user_id = ?1 AND end_time IS NULL
                 LIMIT 1"
            ))?;

            let mut rows = stmt.query(params![user_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_sessions(&self, user_id: &str) -> Result<Vec<FocusSession>> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM focus_sessions
                 WHERE user_id = ?1 AND end_time IS NOT NULL
                 ORDER BY start_time DESC"
            ))?;

            let mut rows = stmt.query(params![user_id])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            Ok(sessions)
        })
        .await
    }
}

#[async_trait]
impl StatStore for Database {
    async fn upsert_daily_stat(
        &self,
        user_id: &str,
        day: NaiveDate,
        delta_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<DailyStat> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO daily_stats (user_id, date, total_focus_secs, total_sessions, completed_tasks, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 1, 0, ?4, ?4)
                 ON CONFLICT(user_id, date) DO UPDATE SET
                     total_focus_secs = total_focus_secs + excluded.total_focus_secs,
                     total_sessions = total_sessions + 1,
                     updated_at = excluded.updated_at",
                params![
                    user_id,
                    day_key(day),
                    to_i64(delta_secs)?,
                    now.to_rfc3339(),
                ],
            )
            .with_context(|| "failed to upsert daily stat")?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {STAT_COLUMNS} FROM daily_stats WHERE user_id = ?1 AND date = ?2"
            ))?;
            let mut rows = stmt.query(params![user_id, day_key(day)])?;
            match rows.next()? {
                Some(row) => row_to_stat(row),
                None => bail!("daily stat vanished after upsert"),
            }
        })
        .await
    }

    async fn fetch_daily_stat(&self, user_id: &str, day: NaiveDate) -> Result<Option<DailyStat>> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {STAT_COLUMNS} FROM daily_stats WHERE user_id = ?1 AND date = ?2"
            ))?;

            let mut rows = stmt.query(params![user_id, day_key(day)])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_stat(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn fetch_stats_range(
        &self,
        user_id: &str,
        start_day: NaiveDate,
        end_day: NaiveDate,
    ) -> Result<Vec<DailyStat>> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {STAT_COLUMNS} FROM daily_stats
                 WHERE user_id = ?1 AND date >= ?2 AND date <= ?3
                 ORDER BY date ASC"
            ))?;

            let mut rows = stmt.query(params![user_id, day_key(start_day), day_key(end_day)])?;
            let mut stats = Vec::new();
            while let Some(row) = rows.next()? {
                stats.push(row_to_stat(row)?);
            }
            Ok(stats)
        })
        .await
    }
}

#[async_trait]
impl TaskStore for Database {
    async fn list_tasks(&self, user_id: &str) -> Result<Vec<Task>> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE user_id = ?1
                 ORDER BY priority DESC, created_at ASC"
            ))?;

            let mut rows = stmt.query(params![user_id])?;
            let mut tasks = Vec::new();
            while let Some(row) = rows.next()? {
                tasks.push(row_to_task(row)?);
            }
            Ok(tasks)
        })
        .await
    }

    async fn list_incomplete_tasks(&self, user_id: &str) -> Result<Vec<Task>> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE user_id = ?1 AND completed = 0
                 ORDER BY priority DESC, created_at ASC"
            ))?;

            let mut rows = stmt.query(params![user_id])?;
            let mut tasks = Vec::new();
            while let Some(row) = rows.next()? {
                tasks.push(row_to_task(row)?);
            }
            Ok(tasks)
        })
        .await
    }
}
