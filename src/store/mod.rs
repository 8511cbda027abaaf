//! Typed repository seams between the engine and whatever persists its data.
//!
//! "Not found" is always a typed `None` or an empty vector, never a sentinel
//! error code. Two implementations ship: [`crate::db::Database`] (SQLite) and
//! [`MemoryStore`] (in-process, used by tests and embedders).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::models::{CloseOutcome, DailyStat, FocusSession, SessionClose, Task};

mod memory;

pub use memory::MemoryStore;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Creates an open session row (`end_time` null) at `start_time`.
    /// Fails if the user already has an open session.
    async fn create_session(
        &self,
        user_id: &str,
        task_id: Option<&str>,
        start_time: DateTime<Utc>,
    ) -> Result<FocusSession>;

    async fn fetch_session(&self, session_id: &str) -> Result<Option<FocusSession>>;

    /// Applies `close` only if the row is still open. An already-closed row
    /// is returned untouched with `newly_closed == false`; a missing row is
    /// an error.
    async fn close_session(&self, session_id: &str, close: SessionClose) -> Result<CloseOutcome>;

    /// The unique open row for the user, or `None`.
    async fn fetch_active_session(&self, user_id: &str) -> Result<Option<FocusSession>>;

    /// Closed sessions, newest first.
    async fn list_sessions(&self, user_id: &str) -> Result<Vec<FocusSession>>;
}

#[async_trait]
pub trait StatStore: Send + Sync {
    /// Atomically folds `delta_secs` into the `(user_id, day)` rollup,
    /// creating the row on first use. Concurrent calls for the same key must
    /// not lose updates.
    async fn upsert_daily_stat(
        &self,
        user_id: &str,
        day: NaiveDate,
        delta_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<DailyStat>;

    async fn fetch_daily_stat(&self, user_id: &str, day: NaiveDate) -> Result<Option<DailyStat>>;

    /// Rows between `start_day` and `end_day` inclusive, ascending by date.
    /// Days with no activity are omitted.
    async fn fetch_stats_range(
        &self,
        user_id: &str,
        start_day: NaiveDate,
        end_day: NaiveDate,
    ) -> Result<Vec<DailyStat>>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// All of the user's tasks, highest priority first.
    async fn list_tasks(&self, user_id: &str) -> Result<Vec<Task>>;

    /// Incomplete tasks, highest priority first. Feeds the task-selection
    /// prompt shown before starting a session.
    async fn list_incomplete_tasks(&self, user_id: &str) -> Result<Vec<Task>>;
}
