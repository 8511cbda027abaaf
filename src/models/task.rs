use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task record, read-only from the engine's perspective. The surrounding
/// application owns task CRUD; the engine only lists tasks for the
/// pre-session selection prompt and for the advisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    /// Higher sorts first.
    pub priority: i64,
    pub deadline: Option<DateTime<Utc>>,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A task the advisor proposes but has not persisted. Mirrors `Task` minus
/// the store-assigned fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDraft {
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub priority: i64,
    pub deadline: Option<DateTime<Utc>>,
    pub completed: bool,
}
