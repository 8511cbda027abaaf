//! Focus-session lifecycle engine.
//!
//! The crate is the core of a Pomodoro-style productivity app: a
//! finite-state timer ([`timer::TimerController`]) that tracks focus
//! sessions against tasks, persists them through typed store traits
//! ([`store`]), and rolls completed time into per-day statistics
//! ([`stats::StatsAggregator`]). Presentation, auth, and task CRUD live in
//! the embedding application; they plug in via [`identity::IdentityProvider`],
//! [`store::TaskStore`], and the [`timer::EngineEvent`] broadcast.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod insights;
pub mod models;
pub mod stats;
pub mod store;
pub mod timer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{SettingsStore, TimerSettings};
pub use db::Database;
pub use error::EngineError;
pub use identity::{IdentityProvider, StaticIdentity};
pub use insights::{build_report, Advisor, ProductivityReport, TaskSuggestion};
pub use models::{CloseOutcome, DailyStat, FocusSession, SessionClose, Task, TaskDraft};
pub use stats::StatsAggregator;
pub use store::{MemoryStore, SessionStore, StatStore, TaskStore};
pub use timer::{EngineEvent, StartOutcome, TimerController, TimerPhase, TimerSnapshot};
