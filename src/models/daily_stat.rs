use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Additive per-user per-day rollup of closed focus sessions.
///
/// `completed_tasks` is owned by the task collaborator: the engine creates
/// the column at zero and never writes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStat {
    pub user_id: String,
    pub date: NaiveDate,
    pub total_focus_secs: u64,
    pub total_sessions: u64,
    pub completed_tasks: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DailyStat {
    /// The well-defined zero-activity value for a day with no stored row.
    /// Callers cannot tell "no record" apart from "no activity".
    pub fn empty(user_id: &str, date: NaiveDate, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            date,
            total_focus_secs: 0,
            total_sessions: 0,
            completed_tasks: 0,
            created_at: now,
            updated_at: now,
        }
    }
}
