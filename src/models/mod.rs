mod daily_stat;
mod session;
mod task;

pub use daily_stat::DailyStat;
pub use session::{CloseOutcome, FocusSession, SessionClose};
pub use task::{Task, TaskDraft};
