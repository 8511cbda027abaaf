//! Canned productivity analysis over the user's tasks and recent stats.
//!
//! This is the "assistant" surface of the app: a report derived from stored
//! data plus a stubbed task suggestion. No model calls happen here; the
//! suggestion is a fixed draft until a real assistant backend exists.

use std::sync::Arc;

use serde::Serialize;

use crate::{
    clock::Clock,
    error::EngineError,
    identity::IdentityProvider,
    models::{DailyStat, Task, TaskDraft},
    stats::StatsAggregator,
    store::TaskStore,
};

const REPORT_WINDOW_DAYS: i64 = 7;
const LOW_COMPLETION_RATE_PCT: f64 = 50.0;
const LOW_DAILY_FOCUS_SECS: u64 = 3600;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductivityReport {
    pub message: String,
    pub completion_rate_pct: f64,
    pub average_daily_focus_secs: u64,
    pub suggested_task: Option<TaskDraft>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSuggestion {
    pub message: String,
    pub task: TaskDraft,
}

pub struct Advisor {
    tasks: Arc<dyn TaskStore>,
    stats: StatsAggregator,
    identity: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
}

impl Advisor {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        stats: StatsAggregator,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tasks,
            stats,
            identity,
            clock,
        }
    }

    /// Builds the report from the user's tasks and the trailing seven days
    /// of daily stats (today inclusive).
    pub async fn analyze(&self) -> Result<ProductivityReport, EngineError> {
        let user_id = self.current_user()?;

        let tasks = self.tasks.list_tasks(&user_id).await?;
        let today = self.clock.now().date_naive();
        let start = today - chrono::Duration::days(REPORT_WINDOW_DAYS - 1);
        let stats = self.stats.stats_range(&user_id, start, today).await?;

        Ok(build_report(&user_id, &tasks, &stats))
    }

    /// Canned draft built from the user's free-text query.
    pub async fn suggest_task(&self, query: &str) -> Result<TaskSuggestion, EngineError> {
        let user_id = self.current_user()?;

        let task = TaskDraft {
            user_id,
            title: query.to_string(),
            description: Some("Created from assistant suggestion".to_string()),
            priority: 1,
            deadline: None,
            completed: false,
        };

        Ok(TaskSuggestion {
            message: format!("I've created a task based on your request: \"{query}\""),
            task,
        })
    }

    fn current_user(&self) -> Result<String, EngineError> {
        self.identity
            .current_user()
            .ok_or(EngineError::NotAuthenticated)
    }
}

/// Pure report assembly, separated from the store round trips for direct
/// testing. Averages run over days with records only; days the store omits
/// count as absent, not zero.
pub fn build_report(user_id: &str, tasks: &[Task], stats: &[DailyStat]) -> ProductivityReport {
    let total_tasks = tasks.len();
    let completed_tasks = tasks.iter().filter(|t| t.completed).count();
    let completion_rate_pct = if total_tasks > 0 {
        completed_tasks as f64 / total_tasks as f64 * 100.0
    } else {
        0.0
    };

    let total_focus_secs: u64 = stats.iter().map(|s| s.total_focus_secs).sum();
    let average_daily_focus_secs = if stats.is_empty() {
        0
    } else {
        total_focus_secs / stats.len() as u64
    };

    let mut message = String::from("Here's your productivity analysis:\n\n");
    message.push_str(&format!(
        "- Task Completion Rate: {completion_rate_pct:.1}%\n"
    ));
    message.push_str(&format!(
        "- Average Daily Focus Time: {} minutes\n\n",
        average_daily_focus_secs / 60
    ));

    if completion_rate_pct < LOW_COMPLETION_RATE_PCT {
        message.push_str(
            "You might want to break down your tasks into smaller, more manageable pieces.\n",
        );
    }
    if average_daily_focus_secs < LOW_DAILY_FOCUS_SECS {
        message.push_str("Consider increasing your daily focus time to improve productivity.\n");
    }

    let suggested = tasks
        .iter()
        .filter(|t| !t.completed)
        .max_by_key(|t| t.priority);

    if let Some(task) = suggested {
        message.push_str("\nSuggested next task:\n");
        message.push_str(&format!("- {}\n", task.title));
        if let Some(description) = &task.description {
            message.push_str(&format!("  {description}\n"));
        }
    }

    ProductivityReport {
        message,
        completion_rate_pct,
        average_daily_focus_secs,
        suggested_task: suggested.map(|task| TaskDraft {
            user_id: user_id.to_string(),
            title: task.title.clone(),
            description: task.description.clone(),
            priority: task.priority,
            deadline: task.deadline,
            completed: false,
        }),
    }
}
