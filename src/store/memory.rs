use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::models::{CloseOutcome, DailyStat, FocusSession, SessionClose, Task};

use super::{SessionStore, StatStore, TaskStore};

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, FocusSession>,
    stats: HashMap<(String, NaiveDate), DailyStat>,
    tasks: Vec<Task>,
}

/// In-process store. One mutex guards all tables, which makes the daily-stat
/// read-modify-write atomic the same way the SQLite worker thread does.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test fixture hook: task writes are otherwise the external
    /// collaborator's job.
    pub fn seed_task(&self, task: Task) {
        self.lock().tasks.push(task);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(
        &self,
        user_id: &str,
        task_id: Option<&str>,
        start_time: DateTime<Utc>,
    ) -> Result<FocusSession> {
        let mut inner = self.lock();
        if inner
            .sessions
            .values()
            .any(|s| s.user_id == user_id && s.is_open())
        {
            bail!("user {user_id} already has an open session");
        }

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
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn fetch_session(&self, session_id: &str) -> Result<Option<FocusSession>> {
        Ok(self.lock().sessions.get(session_id).cloned())
    }

    async fn close_session(&self, session_id: &str, close: SessionClose) -> Result<CloseOutcome> {
        let mut inner = self.lock();
        let session = match inner.sessions.get_mut(session_id) {
            Some(session) => session,
            None => bail!("session {session_id} not found"),
        };

        if session.end_time.is_some() {
            return Ok(CloseOutcome {
                session: session.clone(),
                newly_closed: false,
            });
        }

        session.end_time = Some(close.end_time);
        session.duration_secs = Some(close.duration_secs);
        session.completed = close.completed;
        session.notes = close.notes;
        Ok(CloseOutcome {
            session: session.clone(),
            newly_closed: true,
        })
    }

    async fn fetch_active_session(&self, user_id: &str) -> Result<Option<FocusSession>> {
        Ok(self
            .lock()
            .sessions
            .values()
            .find(|s| s.user_id == user_id && s.is_open())
            .cloned())
    }

    async fn list_sessions(&self, user_id: &str) -> Result<Vec<FocusSession>> {
        let mut sessions: Vec<FocusSession> = self
            .lock()
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && !s.is_open())
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(sessions)
    }
}

#[async_trait]
impl StatStore for MemoryStore {
    async fn upsert_daily_stat(
        &self,
        user_id: &str,
        day: NaiveDate,
        delta_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<DailyStat> {
        let mut inner = self.lock();
        let stat = inner
            .stats
            .entry((user_id.to_string(), day))
            .or_insert_with(|| DailyStat::empty(user_id, day, now));
        stat.total_focus_secs += delta_secs;
        stat.total_sessions += 1;
        stat.updated_at = now;
        Ok(stat.clone())
    }

    async fn fetch_daily_stat(&self, user_id: &str, day: NaiveDate) -> Result<Option<DailyStat>> {
        Ok(self
            .lock()
            .stats
            .get(&(user_id.to_string(), day))
            .cloned())
    }

    async fn fetch_stats_range(
        &self,
        user_id: &str,
        start_day: NaiveDate,
        end_day: NaiveDate,
    ) -> Result<Vec<DailyStat>> {
        let mut stats: Vec<DailyStat> = self
            .lock()
            .stats
            .values()
            .filter(|s| s.user_id == user_id && s.date >= start_day && s.date <= end_day)
            .cloned()
            .collect();
        stats.sort_by_key(|s| s.date);
        Ok(stats)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn list_tasks(&self, user_id: &str) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .lock()
            .tasks
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(tasks)
    }

    async fn list_incomplete_tasks(&self, user_id: &str) -> Result<Vec<Task>> {
        let mut tasks = self.list_tasks(user_id).await?;
        tasks.retain(|t| !t.completed);
        Ok(tasks)
    }
}
