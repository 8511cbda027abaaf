mod controller;
mod state;

pub use controller::{EngineEvent, StartOutcome, TimerController};
pub use state::{TimerPhase, TimerSnapshot, TimerState};
