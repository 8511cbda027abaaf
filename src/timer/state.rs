use serde::{Deserialize, Serialize};

use crate::models::FocusSession;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TimerPhase {
    Idle,
    Focusing,
    Paused,
    OnBreak,
    SessionComplete,
}

impl Default for TimerPhase {
    fn default() -> Self {
        TimerPhase::Idle
    }
}

/// A session whose row has been closed but whose rollup write has not
/// committed yet. Survives across retries so accumulation happens exactly
/// once per session.
#[derive(Debug, Clone)]
pub(crate) struct PendingStat {
    pub session: FocusSession,
}

/// In-memory countdown state for one controller. Never persisted.
#[derive(Debug, Clone)]
pub struct TimerState {
    pub phase: TimerPhase,
    pub remaining_secs: u64,
    pub selected_task_id: Option<String>,
    pub active_session_id: Option<String>,
    pub(crate) pending_stat: Option<PendingStat>,
}

/// What a single tick did, so the caller knows whether to keep ticking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    /// Not in a countdown phase; nothing happened.
    Ignored,
    Counting,
    FocusFinished,
    BreakFinished,
}

impl TimerState {
    pub fn new(focus_period_secs: u64) -> Self {
        Self {
            phase: TimerPhase::Idle,
            remaining_secs: focus_period_secs,
            selected_task_id: None,
            active_session_id: None,
            pending_stat: None,
        }
    }

    /// Applies one countdown second. Reaching zero is the sole trigger for
    /// leaving a countdown phase; `remaining_secs` never goes negative.
    pub(crate) fn apply_tick(&mut self, focus_period_secs: u64) -> TickOutcome {
        match self.phase {
            TimerPhase::Focusing => {
                self.remaining_secs = self.remaining_secs.saturating_sub(1);
                if self.remaining_secs == 0 {
                    self.phase = TimerPhase::SessionComplete;
                    TickOutcome::FocusFinished
                } else {
                    TickOutcome::Counting
                }
            }
            TimerPhase::OnBreak => {
                self.remaining_secs = self.remaining_secs.saturating_sub(1);
                if self.remaining_secs == 0 {
                    self.phase = TimerPhase::Idle;
                    self.remaining_secs = focus_period_secs;
                    TickOutcome::BreakFinished
                } else {
                    TickOutcome::Counting
                }
            }
            _ => TickOutcome::Ignored,
        }
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        TimerSnapshot {
            phase: self.phase,
            remaining_secs: self.remaining_secs,
            selected_task_id: self.selected_task_id.clone(),
            active_session_id: self.active_session_id.clone(),
        }
    }
}

/// Renderable view of the timer, broadcast to the presentation layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub phase: TimerPhase,
    pub remaining_secs: u64,
    pub selected_task_id: Option<String>,
    pub active_session_id: Option<String>,
}
