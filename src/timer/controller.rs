use std::{sync::Arc, time::Duration};

use log::{info, warn};
use serde::Serialize;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    clock::Clock,
    config::TimerSettings,
    error::EngineError,
    identity::IdentityProvider,
    models::{FocusSession, SessionClose, Task},
    stats::StatsAggregator,
    store::{SessionStore, StatStore, TaskStore},
};

use super::state::{PendingStat, TickOutcome, TimerPhase, TimerSnapshot, TimerState};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events broadcast to the presentation layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum EngineEvent {
    StateChanged { snapshot: TimerSnapshot },
    Tick { snapshot: TimerSnapshot },
    SessionCompleted { session: FocusSession },
}

/// What `start` did. A missing task selection is a UI prompt condition, not
/// an error.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    Started(TimerSnapshot),
    TaskRequired,
}

struct Ticker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Session lifecycle engine: one state machine per controller instance,
/// owning the countdown, all command transitions and the persistence side
/// effects of closing a session.
///
/// Lock discipline: the state mutex is held only for in-memory mutation
/// windows, never across a store await. The tick path performs no store I/O
/// at all.
#[derive(Clone)]
pub struct TimerController {
    state: Arc<Mutex<TimerState>>,
    sessions: Arc<dyn SessionStore>,
    tasks: Arc<dyn TaskStore>,
    stats: StatsAggregator,
    identity: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    settings: TimerSettings,
    events: broadcast::Sender<EngineEvent>,
    ticker: Arc<Mutex<Option<Ticker>>>,
    manual_ticks: bool,
}

impl TimerController {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        tasks: Arc<dyn TaskStore>,
        stats: Arc<dyn StatStore>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        settings: TimerSettings,
    ) -> Self {
        Self::build(sessions, tasks, stats, identity, clock, settings, false)
    }

    /// No ticker task is spawned; the embedder (or test) drives `tick`
    /// directly for deterministic countdowns.
    pub fn with_manual_ticks(
        sessions: Arc<dyn SessionStore>,
        tasks: Arc<dyn TaskStore>,
        stats: Arc<dyn StatStore>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        settings: TimerSettings,
    ) -> Self {
        Self::build(sessions, tasks, stats, identity, clock, settings, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        sessions: Arc<dyn SessionStore>,
        tasks: Arc<dyn TaskStore>,
        stats: Arc<dyn StatStore>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        settings: TimerSettings,
        manual_ticks: bool,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(TimerState::new(settings.focus_period_secs))),
            sessions,
            tasks,
            stats: StatsAggregator::new(stats),
            identity,
            clock,
            settings,
            events,
            ticker: Arc::new(Mutex::new(None)),
            manual_ticks,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    pub async fn snapshot(&self) -> TimerSnapshot {
        self.state.lock().await.snapshot()
    }

    /// Sets or clears the task the next focus session will track. Only
    /// meaningful while idle.
    pub async fn select_task(
        &self,
        task_id: Option<String>,
    ) -> Result<TimerSnapshot, EngineError> {
        let snapshot = {
            let mut state = self.state.lock().await;
            if state.phase != TimerPhase::Idle {
                return Err(EngineError::invariant(
                    "task selection only applies while idle",
                ));
            }
            state.selected_task_id = task_id;
            state.snapshot()
        };
        self.broadcast(EngineEvent::StateChanged {
            snapshot: snapshot.clone(),
        });
        Ok(snapshot)
    }

    /// Starts a focus session for the selected task. Requires a signed-in
    /// user, the idle phase, and no open session row for the user. A store
    /// failure leaves the engine idle.
    pub async fn start(&self) -> Result<StartOutcome, EngineError> {
        let user_id = self.current_user()?;

        let task_id = {
            let state = self.state.lock().await;
            if state.phase != TimerPhase::Idle {
                return Err(EngineError::invariant(
                    "a session or break is already in progress",
                ));
            }
            match state.selected_task_id.clone() {
                Some(task_id) => task_id,
                None => return Ok(StartOutcome::TaskRequired),
            }
        };

        if let Some(open) = self.sessions.fetch_active_session(&user_id).await? {
            return Err(EngineError::InvariantViolation(format!(
                "user already has an open session ({})",
                open.id
            )));
        }

        let session = self
            .sessions
            .create_session(&user_id, Some(task_id.as_str()), self.clock.now())
            .await?;

        let snapshot = {
            let mut state = self.state.lock().await;
            state.phase = TimerPhase::Focusing;
            state.remaining_secs = self.settings.focus_period_secs;
            state.active_session_id = Some(session.id.clone());
            state.snapshot()
        };

        self.spawn_ticker().await;
        self.broadcast(EngineEvent::StateChanged {
            snapshot: snapshot.clone(),
        });
        info!("Started focus session {} for user {}", session.id, user_id);

        Ok(StartOutcome::Started(snapshot))
    }

    /// Advances the countdown by one second. Pure in-memory transition; no
    /// store I/O ever happens on this path.
    pub async fn tick(&self) -> TimerSnapshot {
        let (snapshot, outcome) = {
            let mut state = self.state.lock().await;
            let outcome = state.apply_tick(self.settings.focus_period_secs);
            (state.snapshot(), outcome)
        };

        match outcome {
            TickOutcome::Counting => self.broadcast(EngineEvent::Tick {
                snapshot: snapshot.clone(),
            }),
            TickOutcome::FocusFinished => {
                info!("Focus period elapsed; awaiting completion confirmation");
                self.broadcast(EngineEvent::StateChanged {
                    snapshot: snapshot.clone(),
                });
            }
            TickOutcome::BreakFinished => {
                self.broadcast(EngineEvent::StateChanged {
                    snapshot: snapshot.clone(),
                });
            }
            TickOutcome::Ignored => {}
        }

        snapshot
    }

    /// Stops the countdown without touching the open session row. A no-op
    /// outside the focusing phase.
    pub async fn pause(&self) -> TimerSnapshot {
        let (snapshot, changed) = {
            let mut state = self.state.lock().await;
            if state.phase == TimerPhase::Focusing {
                state.phase = TimerPhase::Paused;
                (state.snapshot(), true)
            } else {
                (state.snapshot(), false)
            }
        };

        if changed {
            self.cancel_ticker().await;
            self.broadcast(EngineEvent::StateChanged {
                snapshot: snapshot.clone(),
            });
        }
        snapshot
    }

    /// Restarts the countdown from the paused value. A no-op outside the
    /// paused phase.
    pub async fn resume(&self) -> TimerSnapshot {
        let (snapshot, changed) = {
            let mut state = self.state.lock().await;
            if state.phase == TimerPhase::Paused {
                state.phase = TimerPhase::Focusing;
                (state.snapshot(), true)
            } else {
                (state.snapshot(), false)
            }
        };

        if changed {
            self.spawn_ticker().await;
            self.broadcast(EngineEvent::StateChanged {
                snapshot: snapshot.clone(),
            });
        }
        snapshot
    }

    /// Switches to the break countdown. Any open focus session is closed
    /// first with its actual elapsed duration and `completed = false`, and
    /// folded into the day's stats; breaks themselves are never persisted.
    /// Returns the closed session, if there was one.
    pub async fn start_break(&self) -> Result<Option<FocusSession>, EngineError> {
        self.current_user()?;

        let session_id = {
            let state = self.state.lock().await;
            if state.phase == TimerPhase::SessionComplete {
                return Err(EngineError::invariant(
                    "confirm the completed session before taking a break",
                ));
            }
            state.active_session_id.clone()
        };

        let closed = match session_id {
            Some(session_id) => Some(self.close_open_session(&session_id, false, None).await?),
            None => None,
        };

        let snapshot = {
            let mut state = self.state.lock().await;
            state.phase = TimerPhase::OnBreak;
            state.remaining_secs = self.settings.break_period_secs;
            state.active_session_id = None;
            state.selected_task_id = None;
            state.snapshot()
        };

        self.spawn_ticker().await;
        self.broadcast(EngineEvent::StateChanged { snapshot });

        Ok(closed)
    }

    /// Closes the completed session with the user's optional notes and
    /// returns to idle. A store failure leaves the engine awaiting
    /// confirmation; retrying is safe and closes/accumulates exactly once.
    pub async fn confirm_complete(
        &self,
        notes: Option<String>,
    ) -> Result<FocusSession, EngineError> {
        self.current_user()?;

        let session_id = {
            let state = self.state.lock().await;
            if state.phase != TimerPhase::SessionComplete {
                return Err(EngineError::invariant(
                    "no completed session awaiting confirmation",
                ));
            }
            state.active_session_id.clone().ok_or_else(|| {
                EngineError::invariant("completed session has no session id")
            })?
        };

        let session = self.close_open_session(&session_id, true, notes).await?;

        let snapshot = {
            let mut state = self.state.lock().await;
            state.phase = TimerPhase::Idle;
            state.remaining_secs = self.settings.focus_period_secs;
            state.active_session_id = None;
            state.snapshot()
        };

        self.broadcast(EngineEvent::StateChanged { snapshot });
        self.broadcast(EngineEvent::SessionCompleted {
            session: session.clone(),
        });

        Ok(session)
    }

    /// Resets the countdown for the current phase. Never touches the store:
    /// an open session stays open, and a completed-but-unconfirmed session
    /// is not discarded.
    pub async fn reset(&self) -> TimerSnapshot {
        let (snapshot, cancel) = {
            let mut state = self.state.lock().await;
            let cancel = match state.phase {
                TimerPhase::Idle | TimerPhase::Paused => {
                    state.remaining_secs = self.settings.focus_period_secs;
                    false
                }
                TimerPhase::Focusing => {
                    state.phase = TimerPhase::Paused;
                    state.remaining_secs = self.settings.focus_period_secs;
                    true
                }
                TimerPhase::OnBreak => {
                    state.remaining_secs = self.settings.break_period_secs;
                    false
                }
                TimerPhase::SessionComplete => false,
            };
            (state.snapshot(), cancel)
        };

        if cancel {
            self.cancel_ticker().await;
        }
        self.broadcast(EngineEvent::StateChanged {
            snapshot: snapshot.clone(),
        });
        snapshot
    }

    /// Closes an open session row left behind by a previous run (crash,
    /// forced quit) and folds it into that day's stats. Only valid while
    /// idle. Returns the recovered session, if one existed.
    pub async fn recover_open_session(&self) -> Result<Option<FocusSession>, EngineError> {
        let user_id = self.current_user()?;

        {
            let state = self.state.lock().await;
            if state.phase != TimerPhase::Idle {
                return Err(EngineError::invariant(
                    "recovery only applies while idle",
                ));
            }
        }

        match self.sessions.fetch_active_session(&user_id).await? {
            Some(open) => {
                warn!(
                    "Recovering open session {} started at {}",
                    open.id, open.start_time
                );
                let closed = self.close_open_session(&open.id, false, None).await?;
                Ok(Some(closed))
            }
            None => Ok(None),
        }
    }

    /// Incomplete tasks for the selection prompt, highest priority first.
    pub async fn incomplete_tasks(&self) -> Result<Vec<Task>, EngineError> {
        let user_id = self.current_user()?;
        Ok(self.tasks.list_incomplete_tasks(&user_id).await?)
    }

    /// Closed sessions, newest first.
    pub async fn session_history(&self) -> Result<Vec<FocusSession>, EngineError> {
        let user_id = self.current_user()?;
        Ok(self.sessions.list_sessions(&user_id).await?)
    }

    fn current_user(&self) -> Result<String, EngineError> {
        self.identity
            .current_user()
            .ok_or(EngineError::NotAuthenticated)
    }

    /// Closes a session row exactly once and accumulates it exactly once.
    ///
    /// The two writes cannot be atomic across stores, so the closed-but-not-
    /// accumulated session is parked as `pending_stat`: a retry after a
    /// failed rollup write skips straight to accumulation instead of
    /// re-closing (and an already-closed row found on re-fetch means another
    /// path owns the accumulation).
    async fn close_open_session(
        &self,
        session_id: &str,
        completed: bool,
        notes: Option<String>,
    ) -> Result<FocusSession, EngineError> {
        let pending = {
            let state = self.state.lock().await;
            state
                .pending_stat
                .as_ref()
                .filter(|p| p.session.id == session_id)
                .map(|p| p.session.clone())
        };

        let closed = match pending {
            Some(session) => session,
            None => {
                let current = self
                    .sessions
                    .fetch_session(session_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::InvariantViolation(format!(
                            "session {session_id} no longer exists"
                        ))
                    })?;

                if current.end_time.is_some() {
                    return Ok(current);
                }

                let now = self.clock.now();
                let elapsed = (now - current.start_time).num_seconds();
                let duration_secs = if elapsed < 0 {
                    warn!(
                        "{}",
                        EngineError::ClockAnomaly {
                            session_id: current.id.clone(),
                            skew_secs: -elapsed,
                        }
                    );
                    0
                } else {
                    elapsed as u64
                };

                let outcome = self
                    .sessions
                    .close_session(
                        session_id,
                        SessionClose {
                            end_time: now,
                            duration_secs,
                            completed,
                            notes,
                        },
                    )
                    .await?;

                if !outcome.newly_closed {
                    // Lost a close race; whoever closed it accumulates.
                    return Ok(outcome.session);
                }

                let mut state = self.state.lock().await;
                state.pending_stat = Some(PendingStat {
                    session: outcome.session.clone(),
                });
                outcome.session
            }
        };

        let day = closed
            .stat_day()
            .unwrap_or_else(|| self.clock.now().date_naive());
        self.stats
            .accumulate(
                &closed.user_id,
                day,
                closed.duration_secs.unwrap_or(0),
                self.clock.now(),
            )
            .await?;

        self.state.lock().await.pending_stat = None;
        Ok(closed)
    }

    async fn spawn_ticker(&self) {
        if self.manual_ticks {
            return;
        }

        let mut guard = self.ticker.lock().await;
        if let Some(ticker) = guard.take() {
            ticker.token.cancel();
            ticker.handle.abort();
        }

        let token = CancellationToken::new();
        let tick_token = token.clone();
        let controller = self.clone();

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // A fresh interval's first tick completes immediately; consume
            // it so the first decrement lands one full second after spawn.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = tick_token.cancelled() => break,
                    _ = interval.tick() => {
                        let snapshot = controller.tick().await;
                        if !matches!(
                            snapshot.phase,
                            TimerPhase::Focusing | TimerPhase::OnBreak
                        ) {
                            break;
                        }
                    }
                }
            }
        });

        *guard = Some(Ticker { token, handle });
    }

    async fn cancel_ticker(&self) {
        if let Some(ticker) = self.ticker.lock().await.take() {
            ticker.token.cancel();
            ticker.handle.abort();
        }
    }

    fn broadcast(&self, event: EngineEvent) {
        // Send fails only when nobody is subscribed.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        identity::StaticIdentity,
        store::MemoryStore,
    };
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::models::DailyStat;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    fn jan(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    struct Harness {
        controller: TimerController,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        identity: Arc<StaticIdentity>,
    }

    fn harness() -> Harness {
        harness_with_stats(None)
    }

    fn harness_with_stats(stats: Option<Arc<dyn StatStore>>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let identity = Arc::new(StaticIdentity::signed_in("u1"));
        let controller = TimerController::with_manual_ticks(
            store.clone(),
            store.clone(),
            stats.unwrap_or_else(|| store.clone() as Arc<dyn StatStore>),
            identity.clone(),
            clock.clone(),
            TimerSettings::default(),
        );
        Harness {
            controller,
            store,
            clock,
            identity,
        }
    }

    async fn start_with_task(h: &Harness, task_id: &str) -> TimerSnapshot {
        h.controller
            .select_task(Some(task_id.to_string()))
            .await
            .unwrap();
        match h.controller.start().await.unwrap() {
            StartOutcome::Started(snapshot) => snapshot,
            StartOutcome::TaskRequired => panic!("task was selected"),
        }
    }

    async fn tick_n(controller: &TimerController, n: u64) {
        for _ in 0..n {
            controller.tick().await;
        }
    }

    /// Stat store that fails exactly one upsert, for retry-path tests.
    struct FlakyStats {
        inner: Arc<MemoryStore>,
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl StatStore for FlakyStats {
        async fn upsert_daily_stat(
            &self,
            user_id: &str,
            day: NaiveDate,
            delta_secs: u64,
            now: DateTime<Utc>,
        ) -> Result<DailyStat> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(anyhow!("stat store temporarily down"));
            }
            self.inner
                .upsert_daily_stat(user_id, day, delta_secs, now)
                .await
        }

        async fn fetch_daily_stat(
            &self,
            user_id: &str,
            day: NaiveDate,
        ) -> Result<Option<DailyStat>> {
            self.inner.fetch_daily_stat(user_id, day).await
        }

        async fn fetch_stats_range(
            &self,
            user_id: &str,
            start_day: NaiveDate,
            end_day: NaiveDate,
        ) -> Result<Vec<DailyStat>> {
            self.inner.fetch_stats_range(user_id, start_day, end_day).await
        }
    }

    #[tokio::test]
    async fn start_without_task_prompts_instead_of_failing() {
        let h = harness();
        match h.controller.start().await.unwrap() {
            StartOutcome::TaskRequired => {}
            StartOutcome::Started(_) => panic!("no task was selected"),
        }
        let snapshot = h.controller.snapshot().await;
        assert_eq!(snapshot.phase, TimerPhase::Idle);
        assert!(h.store.fetch_active_session("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn start_opens_session_and_begins_focus_countdown() {
        let h = harness();
        let snapshot = start_with_task(&h, "t1").await;

        assert_eq!(snapshot.phase, TimerPhase::Focusing);
        assert_eq!(snapshot.remaining_secs, 1500);

        let open = h.store.fetch_active_session("u1").await.unwrap().unwrap();
        assert_eq!(open.task_id.as_deref(), Some("t1"));
        assert_eq!(open.start_time, t0());
        assert_eq!(snapshot.active_session_id.as_deref(), Some(open.id.as_str()));
    }

    #[tokio::test]
    async fn double_start_is_an_invariant_violation() {
        let h = harness();
        start_with_task(&h, "t1").await;

        match h.controller.start().await {
            Err(EngineError::InvariantViolation(_)) => {}
            other => panic!("expected invariant violation, got {other:?}"),
        }

        // Still exactly one open row.
        assert!(h.store.fetch_active_session("u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn countdown_reaches_completion_exactly_once() {
        let h = harness();
        start_with_task(&h, "t1").await;

        let mut previous = 1500;
        for _ in 0..1499 {
            let snapshot = h.controller.tick().await;
            assert_eq!(snapshot.phase, TimerPhase::Focusing);
            assert_eq!(snapshot.remaining_secs, previous - 1);
            previous = snapshot.remaining_secs;
        }

        let done = h.controller.tick().await;
        assert_eq!(done.phase, TimerPhase::SessionComplete);
        assert_eq!(done.remaining_secs, 0);

        // Extra ticks do nothing.
        let after = h.controller.tick().await;
        assert_eq!(after.phase, TimerPhase::SessionComplete);
        assert_eq!(after.remaining_secs, 0);
    }

    #[tokio::test]
    async fn pause_resume_round_trip_changes_nothing() {
        let h = harness();
        start_with_task(&h, "t1").await;
        tick_n(&h.controller, 10).await;

        let before = h.controller.snapshot().await;
        h.controller.pause().await;

        // Ticks while paused are ignored.
        tick_n(&h.controller, 5).await;

        let resumed = h.controller.resume().await;
        assert_eq!(resumed.phase, TimerPhase::Focusing);
        assert_eq!(resumed.remaining_secs, before.remaining_secs);

        let open = h.store.fetch_active_session("u1").await.unwrap().unwrap();
        assert_eq!(open.start_time, t0());
    }

    #[tokio::test]
    async fn full_session_persists_duration_notes_and_daily_stat() {
        let h = harness();
        start_with_task(&h, "t1").await;

        tick_n(&h.controller, 1500).await;
        h.clock.advance_secs(1500);

        let session = h
            .controller
            .confirm_complete(Some("done".into()))
            .await
            .unwrap();
        assert_eq!(session.task_id.as_deref(), Some("t1"));
        assert_eq!(session.duration_secs, Some(1500));
        assert_eq!(session.notes.as_deref(), Some("done"));
        assert!(session.completed);
        assert_eq!(session.end_time, Some(t0() + chrono::Duration::seconds(1500)));

        let snapshot = h.controller.snapshot().await;
        assert_eq!(snapshot.phase, TimerPhase::Idle);
        assert_eq!(snapshot.remaining_secs, 1500);
        assert!(snapshot.active_session_id.is_none());

        let stat = h.store.fetch_daily_stat("u1", jan(1)).await.unwrap().unwrap();
        assert_eq!(stat.total_focus_secs, 1500);
        assert_eq!(stat.total_sessions, 1);
    }

    #[tokio::test]
    async fn confirm_without_completed_session_is_rejected() {
        let h = harness();
        match h.controller.confirm_complete(None).await {
            Err(EngineError::InvariantViolation(_)) => {}
            other => panic!("expected invariant violation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn break_closes_open_session_with_elapsed_duration() {
        let h = harness();
        start_with_task(&h, "t1").await;

        h.clock.advance_secs(600);
        let closed = h.controller.start_break().await.unwrap().unwrap();
        assert_eq!(closed.duration_secs, Some(600));
        assert!(!closed.completed);
        assert!(closed.notes.is_none());

        let snapshot = h.controller.snapshot().await;
        assert_eq!(snapshot.phase, TimerPhase::OnBreak);
        assert_eq!(snapshot.remaining_secs, 300);
        assert!(snapshot.active_session_id.is_none());
        assert!(snapshot.selected_task_id.is_none());

        // The partial session still counts toward the day.
        let stat = h.store.fetch_daily_stat("u1", jan(1)).await.unwrap().unwrap();
        assert_eq!(stat.total_focus_secs, 600);
        assert_eq!(stat.total_sessions, 1);
        assert!(h.store.fetch_active_session("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn break_from_idle_is_untracked() {
        let h = harness();
        let closed = h.controller.start_break().await.unwrap();
        assert!(closed.is_none());

        let snapshot = h.controller.snapshot().await;
        assert_eq!(snapshot.phase, TimerPhase::OnBreak);
        assert_eq!(snapshot.remaining_secs, 300);

        // Break end returns to idle with a fresh focus period.
        tick_n(&h.controller, 300).await;
        let snapshot = h.controller.snapshot().await;
        assert_eq!(snapshot.phase, TimerPhase::Idle);
        assert_eq!(snapshot.remaining_secs, 1500);

        assert!(h.store.fetch_daily_stat("u1", jan(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn break_during_unconfirmed_completion_is_rejected() {
        let h = harness();
        start_with_task(&h, "t1").await;
        tick_n(&h.controller, 1500).await;

        match h.controller.start_break().await {
            Err(EngineError::InvariantViolation(_)) => {}
            other => panic!("expected invariant violation, got {other:?}"),
        }
        assert_eq!(h.controller.snapshot().await.phase, TimerPhase::SessionComplete);
    }

    #[tokio::test]
    async fn two_sessions_same_day_accumulate() {
        let h = harness();

        start_with_task(&h, "t1").await;
        h.clock.advance_secs(600);
        h.controller.start_break().await.unwrap();
        tick_n(&h.controller, 300).await;
        assert_eq!(h.controller.snapshot().await.phase, TimerPhase::Idle);

        start_with_task(&h, "t2").await;
        h.clock.advance_secs(900);
        h.controller.start_break().await.unwrap();

        let stat = h.store.fetch_daily_stat("u1", jan(1)).await.unwrap().unwrap();
        assert_eq!(stat.total_focus_secs, 1500);
        assert_eq!(stat.total_sessions, 2);
    }

    #[tokio::test]
    async fn failed_stat_write_keeps_confirmation_retryable() {
        let flaky = Arc::new(FlakyStats {
            inner: Arc::new(MemoryStore::new()),
            fail_next: AtomicBool::new(false),
        });
        let h = harness_with_stats(Some(flaky.clone() as Arc<dyn StatStore>));

        start_with_task(&h, "t1").await;
        tick_n(&h.controller, 1500).await;
        h.clock.advance_secs(1500);

        flaky.fail_next.store(true, Ordering::SeqCst);
        match h.controller.confirm_complete(Some("done".into())).await {
            Err(EngineError::StoreUnavailable(_)) => {}
            other => panic!("expected store error, got {other:?}"),
        }

        // The session row was closed, but we are still awaiting confirmation.
        assert_eq!(h.controller.snapshot().await.phase, TimerPhase::SessionComplete);
        let row = h.store.fetch_active_session("u1").await.unwrap();
        assert!(row.is_none());

        let session = h
            .controller
            .confirm_complete(Some("done".into()))
            .await
            .unwrap();
        assert_eq!(session.duration_secs, Some(1500));
        assert_eq!(session.notes.as_deref(), Some("done"));

        // Closed once, accumulated once.
        let stat = flaky
            .inner
            .fetch_daily_stat("u1", jan(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stat.total_focus_secs, 1500);
        assert_eq!(stat.total_sessions, 1);
    }

    #[tokio::test]
    async fn recovery_closes_leftover_row_once() {
        let h = harness();

        // A previous run left an open row behind.
        let leftover = h.store.create_session("u1", Some("t1"), t0()).await.unwrap();
        h.clock.advance_secs(420);

        let recovered = h.controller.recover_open_session().await.unwrap().unwrap();
        assert_eq!(recovered.id, leftover.id);
        assert_eq!(recovered.duration_secs, Some(420));
        assert!(!recovered.completed);

        let stat = h.store.fetch_daily_stat("u1", jan(1)).await.unwrap().unwrap();
        assert_eq!(stat.total_focus_secs, 420);
        assert_eq!(stat.total_sessions, 1);

        // Nothing left to recover.
        assert!(h.controller.recover_open_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn negative_duration_clamps_to_zero() {
        let h = harness();
        start_with_task(&h, "t1").await;

        // Wall clock moved backwards past the stored start time.
        h.clock.advance_secs(-120);
        let closed = h.controller.start_break().await.unwrap().unwrap();
        assert_eq!(closed.duration_secs, Some(0));

        let day = closed.end_time.unwrap().date_naive();
        let stat = h.store.fetch_daily_stat("u1", day).await.unwrap().unwrap();
        assert_eq!(stat.total_focus_secs, 0);
        assert_eq!(stat.total_sessions, 1);
    }

    #[tokio::test]
    async fn reset_maps_each_phase() {
        let h = harness();

        // Idle: refresh the focus period.
        let snapshot = h.controller.reset().await;
        assert_eq!(snapshot.phase, TimerPhase::Idle);
        assert_eq!(snapshot.remaining_secs, 1500);

        // Focusing: drop to paused with a fresh period, session untouched.
        start_with_task(&h, "t1").await;
        tick_n(&h.controller, 100).await;
        let snapshot = h.controller.reset().await;
        assert_eq!(snapshot.phase, TimerPhase::Paused);
        assert_eq!(snapshot.remaining_secs, 1500);
        assert!(h.store.fetch_active_session("u1").await.unwrap().is_some());

        // Paused: refresh again.
        let snapshot = h.controller.reset().await;
        assert_eq!(snapshot.phase, TimerPhase::Paused);
        assert_eq!(snapshot.remaining_secs, 1500);

        // SessionComplete: no-op, the unconfirmed session is preserved.
        h.controller.resume().await;
        tick_n(&h.controller, 1500).await;
        let snapshot = h.controller.reset().await;
        assert_eq!(snapshot.phase, TimerPhase::SessionComplete);

        h.clock.advance_secs(1600);
        h.controller.confirm_complete(None).await.unwrap();

        // OnBreak: restart the break period.
        h.controller.start_break().await.unwrap();
        tick_n(&h.controller, 40).await;
        let snapshot = h.controller.reset().await;
        assert_eq!(snapshot.phase, TimerPhase::OnBreak);
        assert_eq!(snapshot.remaining_secs, 300);
    }

    #[tokio::test]
    async fn everything_fails_closed_when_signed_out() {
        let h = harness();
        h.identity.sign_out();

        assert!(matches!(
            h.controller.start().await,
            Err(EngineError::NotAuthenticated)
        ));
        assert!(matches!(
            h.controller.start_break().await,
            Err(EngineError::NotAuthenticated)
        ));
        assert!(matches!(
            h.controller.confirm_complete(None).await,
            Err(EngineError::NotAuthenticated)
        ));
        assert!(matches!(
            h.controller.recover_open_session().await,
            Err(EngineError::NotAuthenticated)
        ));
        assert!(matches!(
            h.controller.incomplete_tasks().await,
            Err(EngineError::NotAuthenticated)
        ));
        assert!(matches!(
            h.controller.session_history().await,
            Err(EngineError::NotAuthenticated)
        ));

        assert!(h.store.fetch_active_session("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let h = harness();
        let mut events = h.controller.subscribe();

        start_with_task(&h, "t1").await;

        // select_task then start each broadcast a state change.
        let first = events.recv().await.unwrap();
        assert!(matches!(first, EngineEvent::StateChanged { .. }));
        let second = events.recv().await.unwrap();
        match second {
            EngineEvent::StateChanged { snapshot } => {
                assert_eq!(snapshot.phase, TimerPhase::Focusing);
            }
            other => panic!("expected state change, got {other:?}"),
        }

        h.controller.tick().await;
        match events.recv().await.unwrap() {
            EngineEvent::Tick { snapshot } => assert_eq!(snapshot.remaining_secs, 1499),
            other => panic!("expected tick, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn custom_periods_are_honored() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let identity = Arc::new(StaticIdentity::signed_in("u1"));
        let controller = TimerController::with_manual_ticks(
            store.clone(),
            store.clone(),
            store.clone(),
            identity,
            clock,
            TimerSettings {
                focus_period_secs: 10,
                break_period_secs: 3,
            },
        );

        controller.select_task(Some("t1".into())).await.unwrap();
        controller.start().await.unwrap();
        assert_eq!(controller.snapshot().await.remaining_secs, 10);

        for _ in 0..10 {
            controller.tick().await;
        }
        assert_eq!(controller.snapshot().await.phase, TimerPhase::SessionComplete);
    }

    mod real_ticker {
        use super::*;

        async fn settle() {
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
        }

        #[tokio::test(start_paused = true)]
        async fn decrements_exactly_once_per_second() {
            let store = Arc::new(MemoryStore::new());
            let clock = Arc::new(ManualClock::new(t0()));
            let identity = Arc::new(StaticIdentity::signed_in("u1"));
            let controller = TimerController::new(
                store.clone(),
                store.clone(),
                store.clone(),
                identity,
                clock,
                TimerSettings::default(),
            );

            controller.select_task(Some("t1".into())).await.unwrap();
            controller.start().await.unwrap();
            settle().await;

            for _ in 0..5 {
                tokio::time::advance(Duration::from_secs(1)).await;
                settle().await;
            }
            assert_eq!(controller.snapshot().await.remaining_secs, 1495);

            // Rapid pause/resume cycles must not leak tickers: still one
            // decrement per elapsed second afterwards.
            for _ in 0..3 {
                controller.pause().await;
                controller.resume().await;
            }
            settle().await;

            for _ in 0..5 {
                tokio::time::advance(Duration::from_secs(1)).await;
                settle().await;
            }
            assert_eq!(controller.snapshot().await.remaining_secs, 1490);
        }

        #[tokio::test(start_paused = true)]
        async fn no_ticks_while_paused() {
            let store = Arc::new(MemoryStore::new());
            let clock = Arc::new(ManualClock::new(t0()));
            let identity = Arc::new(StaticIdentity::signed_in("u1"));
            let controller = TimerController::new(
                store.clone(),
                store.clone(),
                store.clone(),
                identity,
                clock,
                TimerSettings::default(),
            );

            controller.select_task(Some("t1".into())).await.unwrap();
            controller.start().await.unwrap();
            settle().await;

            for _ in 0..2 {
                tokio::time::advance(Duration::from_secs(1)).await;
                settle().await;
            }
            assert_eq!(controller.snapshot().await.remaining_secs, 1498);

            controller.pause().await;
            settle().await;

            // Missed seconds are never replayed.
            tokio::time::advance(Duration::from_secs(60)).await;
            settle().await;
            assert_eq!(controller.snapshot().await.remaining_secs, 1498);

            controller.resume().await;
            settle().await;
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
            assert_eq!(controller.snapshot().await.remaining_secs, 1497);
        }
    }
}
