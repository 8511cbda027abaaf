use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One tracked focus interval. Created open (no `end_time`) by the engine,
/// closed exactly once, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusSession {
    pub id: String,
    pub user_id: String,
    pub task_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: Option<u64>,
    /// Whether the timer ran its full period. Sessions cut short by a break
    /// or recovered after an interruption are closed with `false`.
    pub completed: bool,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FocusSession {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Calendar day the session counts toward: the UTC day of its end time.
    pub fn stat_day(&self) -> Option<NaiveDate> {
        self.end_time.map(|t| t.date_naive())
    }
}

/// Fields applied when a session row transitions open -> closed.
#[derive(Debug, Clone)]
pub struct SessionClose {
    pub end_time: DateTime<Utc>,
    pub duration_secs: u64,
    pub completed: bool,
    pub notes: Option<String>,
}

/// Result of a conditional close. `newly_closed` is true only for the call
/// that actually transitioned the row; retries and races observe false.
#[derive(Debug, Clone)]
pub struct CloseOutcome {
    pub session: FocusSession,
    pub newly_closed: bool,
}
