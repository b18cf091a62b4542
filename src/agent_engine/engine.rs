use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use chrono::Utc;

use crate::agent_engine::control::{AgentCommand, AgentHandle};
use crate::agent_engine::history::ActionLog;
use crate::agent_engine::loop_control::LoopController;
use crate::agent_engine::state::{AgentState, AgentStatus};
use crate::config::{AgentConfig, AppConfig, CacheConfig};
use crate::errors::{DeskError, DeskResult, PlannerError};
use crate::executor::safety::below_confidence_floor;
use crate::executor::{execute, ActionPlan, ExecutionResult, Payload, PlanSignal, Verb};
use crate::perception::fingerprint::Fingerprint;
use crate::perception::types::Observation;
use crate::planner::{propose_with_retry, should_reuse, CachedPlan, Planner, RetryPolicy};
use crate::platform::PlatformAdapter;
use crate::storage::StateStore;

/// What one iteration amounted to; decides the pause before the next one.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Not RUNNING (or shutting down); nothing was attempted.
    Inactive,
    /// A plan was dispatched (or held back by the confidence floor).
    /// `wait` is the extra pause a WAIT plan asked for.
    Acted { wait: Option<Duration> },
    /// Reflection tick: planner consulted, nothing executed.
    Reflected,
    /// Planner retries exhausted; state untouched.
    Skipped,
    /// The iteration moved the agent to ERROR, or found it there still
    /// waiting for the screen to come back.
    Failed,
}

pub struct AgentEngine {
    state: AgentState,
    handle: AgentHandle,
    adapter: Box<dyn PlatformAdapter>,
    planner: Box<dyn Planner>,
    store: StateStore,
    action_log: ActionLog,
    loop_ctrl: LoopController,
    retry: RetryPolicy,
    agent_cfg: AgentConfig,
    cache_cfg: CacheConfig,
    cache: Option<CachedPlan>,
    /// Window hint to focus at the next iteration.
    pending_focus: Option<String>,
    /// Set while ERROR was caused by a failed capture; the loop keeps
    /// polling the screen and resumes on its own once a capture succeeds.
    capture_recovery: bool,
    /// Frame seen by the previous reflection tick.
    last_reflected: Option<Fingerprint>,
    shutdown: bool,
}

impl AgentEngine {
    /// Loads the persisted state and prepares the loop. A run that was
    /// RUNNING or PAUSED when the process died comes back as IDLE.
    pub fn new(
        config: &AppConfig,
        adapter: Box<dyn PlatformAdapter>,
        planner: Box<dyn Planner>,
    ) -> DeskResult<Self> {
        let data_dir = config.agent.resolved_data_dir();
        let store = StateStore::new(&data_dir, config.agent.emotion_dims);
        let mut state = store.load()?;
        if matches!(state.status, AgentStatus::Running | AgentStatus::Paused) {
            tracing::info!(status = %state.status, "previous run was interrupted, resetting to IDLE");
            state.transition(AgentStatus::Idle)?;
        }
        tracing::info!(
            data_dir = %data_dir.display(),
            adapter = adapter.name(),
            planner = planner.name(),
            steps = state.step_count,
            "orchestrator initialized"
        );

        Ok(Self {
            handle: AgentHandle::new(state.clone()),
            state,
            adapter,
            planner,
            store,
            action_log: ActionLog::new(&data_dir),
            loop_ctrl: LoopController::new(config.agent.reflection_after_idle_iterations),
            retry: RetryPolicy::from_config(&config.planner),
            agent_cfg: config.agent.clone(),
            cache_cfg: config.cache.clone(),
            cache: None,
            pending_focus: None,
            capture_recovery: false,
            last_reflected: None,
            shutdown: false,
        })
    }

    pub fn handle(&self) -> AgentHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown
    }

    /// Runs the loop on a dedicated OS thread with its own single-threaded
    /// runtime. Input primitives are serial, so the loop never fans out.
    pub fn spawn(mut self) -> std::io::Result<std::thread::JoinHandle<()>> {
        std::thread::Builder::new()
            .name("deskpilot-orchestrator".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!(error = %e, "orchestrator runtime could not be built");
                        return;
                    }
                };
                runtime.block_on(self.run_loop());
            })
    }

    pub async fn run_loop(&mut self) {
        tracing::info!(session = %self.action_log.session_id, "agent loop started");
        self.handle.publish(&self.state);
        loop {
            let outcome = self.step().await;
            if self.shutdown {
                break;
            }
            match outcome {
                StepOutcome::Inactive | StepOutcome::Failed => {
                    if self.awaiting_capture() {
                        self.handle.sleep_interruptible(self.agent_cfg.pacing()).await;
                    } else if self.state.status != AgentStatus::Running {
                        self.handle.wait_for_command().await;
                    }
                }
                StepOutcome::Reflected => {
                    self.handle.sleep_interruptible(self.agent_cfg.reflection_pacing()).await;
                }
                StepOutcome::Acted { wait } => {
                    let pause = self.agent_cfg.pacing() + wait.unwrap_or_default();
                    self.handle.sleep_interruptible(pause).await;
                }
                StepOutcome::Skipped => {
                    self.handle.sleep_interruptible(self.agent_cfg.pacing()).await;
                }
            }
        }
        tracing::info!(session = %self.action_log.session_id, steps = self.state.step_count, "agent loop ended");
    }

    // ── One iteration ─────────────────────────────────────────────────────────

    /// observe → cache-check → plan → execute → reflect → persist.
    ///
    /// Commands are applied only at the start and right after the planner
    /// returns; a STOP that arrives mid-call discards the plan.
    pub async fn step(&mut self) -> StepOutcome {
        self.checkpoint();
        if self.shutdown {
            return StepOutcome::Inactive;
        }

        let mut recovered = None;
        if self.awaiting_capture() {
            match self.capture() {
                Ok(obs) => {
                    tracing::info!("screen capture is back, resuming the run");
                    self.resume_after_error();
                    self.state.set_monologue("Screen capture recovered.");
                    self.persist();
                    self.handle.publish(&self.state);
                    recovered = Some(obs);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "screen capture still unavailable");
                    return StepOutcome::Failed;
                }
            }
        }
        if self.state.status != AgentStatus::Running {
            return StepOutcome::Inactive;
        }

        if let Some(hint) = self.pending_focus.take() {
            self.focus_hint(&hint);
            // Focusing changes the screen.
            recovered = None;
        }

        let reflecting = self.loop_ctrl.should_reflect(&self.state);
        if reflecting != self.state.reflecting {
            tracing::info!(reflecting, idle_streak = self.loop_ctrl.idle_streak(), "reflection cadence changed");
            self.state.reflecting = reflecting;
        }
        if !reflecting {
            self.last_reflected = None;
        }

        // ── Observe ───────────────────────────────────────────────────────
        let observation = match recovered.map_or_else(|| self.capture(), Ok) {
            Ok(obs) => obs,
            Err(e) => {
                tracing::error!(error = %e, "screen capture failed");
                self.fail(format!("Screen capture failed: {e}"));
                self.capture_recovery = true;
                return StepOutcome::Failed;
            }
        };

        // ── Cache check / plan ────────────────────────────────────────────
        let hit = !reflecting
            && should_reuse(&observation.fingerprint, self.cache.as_ref(), self.cache_cfg.reuse_threshold);
        let reused = match self.cache.as_mut() {
            Some(entry) if hit => {
                let step = entry.next_step();
                if let Some(step) = &step {
                    tracing::info!(
                        pending = entry.pending_steps(),
                        replays_left = entry.remaining,
                        plan = %step.summary(),
                        "screen unchanged, continuing cached plan"
                    );
                }
                step
            }
            _ => None,
        };
        let cached = reused.is_some();
        // The planner's full answer, kept for the snapshot.
        let mut fresh = None;
        let plan = if let Some(plan) = reused {
            plan
        } else {
            let result = propose_with_retry(self.planner.as_ref(), &observation, &self.state, &self.retry).await;

            self.checkpoint();
            if self.shutdown || self.state.status != AgentStatus::Running {
                tracing::info!(status = %self.state.status, "run interrupted during planning, plan discarded");
                return StepOutcome::Inactive;
            }

            match result {
                Ok(plan) => {
                    tracing::info!(
                        planner = self.planner.name(),
                        plan = %plan.summary(),
                        steps = plan.step_count(),
                        "plan received"
                    );
                    fresh = Some(plan.clone());
                    if reflecting {
                        self.cache = None;
                        plan
                    } else {
                        let (first, entry) =
                            CachedPlan::start(plan, observation.fingerprint.clone(), self.cache_cfg.max_reuses);
                        self.cache = Some(entry);
                        first
                    }
                }
                Err(PlannerError::Fatal(msg)) => {
                    self.fail(format!("Planner unavailable: {msg}"));
                    return StepOutcome::Failed;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "no usable plan this iteration, skipping");
                    self.loop_ctrl.record_idle();
                    if self.note_failure() {
                        return StepOutcome::Failed;
                    }
                    return StepOutcome::Skipped;
                }
            }
        };

        // ── Reflect (no execution) ────────────────────────────────────────
        if reflecting {
            let actionable =
                plan.verb != Verb::Wait && !below_confidence_floor(&plan, self.agent_cfg.min_confidence);
            let screen_changed = self
                .last_reflected
                .as_ref()
                .is_some_and(|fp| observation.fingerprint.distance(fp) >= self.cache_cfg.reuse_threshold);
            self.last_reflected = Some(observation.fingerprint.clone());
            if actionable || screen_changed {
                tracing::info!(actionable, screen_changed, plan = %plan.summary(), "leaving reflection");
                self.loop_ctrl.record_active();
            }

            let thought = plan
                .rationale
                .clone()
                .unwrap_or_else(|| format!("Resting. The planner would {}.", plan.summary()));
            self.state.reflect(thought);
            if let Some(full) = &fresh {
                self.snapshot(&observation, full);
            }
            if self.persist() {
                self.handle.publish(&self.state);
            }
            return StepOutcome::Reflected;
        }

        if plan.signal == Some(PlanSignal::Unrecoverable) {
            let why = plan.rationale.clone().unwrap_or_else(|| "no reason given".into());
            tracing::warn!(reason = %why, "planner declared the goal unrecoverable");
            self.fail(format!("Planner gave up: {why}"));
            return StepOutcome::Failed;
        }

        if let Some(task) = &plan.task {
            if self.state.current_task.as_ref() != Some(task) {
                tracing::info!(task = %task, "current task changed");
                self.state.current_task = Some(task.clone());
            }
        }

        // ── Execute ───────────────────────────────────────────────────────
        let plan = self.with_window_fallback(plan);
        let mut wait = None;
        let mut succeeded = false;
        if below_confidence_floor(&plan, self.agent_cfg.min_confidence) {
            tracing::info!(
                confidence = plan.confidence,
                floor = self.agent_cfg.min_confidence,
                plan = %plan.summary(),
                "plan below confidence floor, not dispatched"
            );
            self.loop_ctrl.record_idle();
            self.state.set_monologue(format!(
                "Holding back {}: not confident enough. {}",
                plan.verb,
                plan.rationale.as_deref().unwrap_or_default()
            ));
            // Later batch steps assume this one ran.
            self.cache = None;
        } else {
            let result = execute(&plan, self.adapter.as_mut());
            succeeded = result.is_success();
            if self.record(&plan, &result, cached) {
                return StepOutcome::Failed;
            }
            wait = plan.wait_duration();
        }

        if plan.signal == Some(PlanSignal::GoalComplete) {
            if succeeded {
                tracing::info!(goal = ?self.state.goal, steps = self.state.step_count, "goal complete");
                self.set_status(AgentStatus::Idle);
                self.state.current_task = None;
                self.cache = None;
            } else {
                tracing::info!(plan = %plan.summary(), "goal_complete ignored: the step was not carried out");
            }
        }

        // ── Persist ───────────────────────────────────────────────────────
        if let Some(full) = &fresh {
            self.snapshot(&observation, full);
        }
        if !self.persist() {
            return StepOutcome::Failed;
        }
        self.handle.publish(&self.state);
        StepOutcome::Acted { wait }
    }

    fn awaiting_capture(&self) -> bool {
        self.capture_recovery && self.state.status == AgentStatus::Error
    }

    fn capture(&mut self) -> DeskResult<Observation> {
        match catch_unwind(AssertUnwindSafe(|| self.adapter.capture_screen())) {
            Ok(result) => result,
            Err(_) => Err(DeskError::Capture("capture backend panicked".into())),
        }
    }

    /// FOCUS_WINDOW without an explicit window targets the active-window hint.
    fn with_window_fallback(&self, mut plan: ActionPlan) -> ActionPlan {
        if plan.verb == Verb::FocusWindow && plan.payload == Payload::None {
            if let Some(hint) = &self.state.active_window_hint {
                plan.payload = Payload::Window { hint: hint.clone() };
            }
        }
        plan
    }

    fn focus_hint(&mut self, hint: &str) {
        let plan = ActionPlan::new(Verb::FocusWindow, None, Payload::Window { hint: hint.to_string() }, 1.0);
        let result = execute(&plan, self.adapter.as_mut());
        if !result.is_success() {
            tracing::warn!(hint, detail = %result.detail, "could not focus active window");
        }
    }

    /// Returns true when the failure moved the run to ERROR.
    fn record(&mut self, plan: &ActionPlan, result: &ExecutionResult, cached: bool) -> bool {
        let summary = plan.summary();
        self.state.record_step(summary.clone(), Some(result.clone()));
        if let Some(rationale) = &plan.rationale {
            self.state.set_monologue(rationale.clone());
        }

        let meta = serde_json::json!({
            "verb": plan.verb,
            "success": result.is_success(),
            "detail": result.detail,
            "cached": cached,
            "confidence": plan.confidence,
        });
        if let Err(e) = self.action_log.append(self.state.step_count, &summary, meta) {
            tracing::warn!(error = %e, "action log append failed");
        }

        if !result.is_success() {
            // Neither a replay nor the rest of a batch can follow a failed step.
            self.cache = None;
            return self.note_failure();
        }
        self.loop_ctrl.clear_failures();
        if plan.verb == Verb::Wait {
            self.loop_ctrl.record_idle();
        } else {
            self.loop_ctrl.record_active();
        }
        false
    }

    /// Counts a failed iteration and moves to ERROR once
    /// `max_consecutive_failures` is reached (0 never escalates).
    fn note_failure(&mut self) -> bool {
        self.loop_ctrl.record_failure();
        let failures = self.loop_ctrl.failure_count();
        let limit = self.agent_cfg.max_consecutive_failures;
        if limit == 0 || failures < limit {
            return false;
        }
        tracing::error!(failures, limit, "too many consecutive failures, giving up");
        self.fail(format!("Giving up after {failures} consecutive failed iterations."));
        true
    }

    fn snapshot(&self, observation: &Observation, plan: &ActionPlan) {
        if let Err(e) = self
            .store
            .snapshot(&self.state, Some(observation), Some(plan), self.agent_cfg.save_screenshots)
        {
            tracing::error!(error = %e, "snapshot failed");
        }
    }

    // ── Status and persistence ────────────────────────────────────────────────

    fn set_status(&mut self, to: AgentStatus) -> bool {
        if self.state.status == to {
            return true;
        }
        match self.state.transition(to) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "status change rejected");
                false
            }
        }
    }

    /// Moves to ERROR with a human-readable cause and persists it.
    fn fail(&mut self, cause: String) {
        self.state.set_monologue(cause);
        self.set_status(AgentStatus::Error);
        self.cache = None;
        self.capture_recovery = false;
        self.persist();
        self.handle.publish(&self.state);
    }

    /// Saves the current state, retrying once. A second failure moves a
    /// running agent to ERROR.
    fn persist(&mut self) -> bool {
        let first = match self.store.save(&self.state) {
            Ok(()) => return true,
            Err(e) => e,
        };
        tracing::warn!(error = %first, "state save failed, retrying once");
        match self.store.save(&self.state) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "state could not be persisted");
                self.state.set_monologue(format!("State could not be saved: {e}"));
                if self.state.status == AgentStatus::Running {
                    self.set_status(AgentStatus::Error);
                }
                self.handle.publish(&self.state);
                false
            }
        }
    }

    /// ERROR → RUNNING with a clean cache and counters.
    fn resume_after_error(&mut self) {
        self.capture_recovery = false;
        self.last_reflected = None;
        self.cache = None;
        self.loop_ctrl.reset();
        self.set_status(AgentStatus::Running);
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    /// Applies queued commands. Returns whether any were applied.
    fn checkpoint(&mut self) -> bool {
        let commands = self.handle.drain();
        if commands.is_empty() {
            return false;
        }
        for command in commands {
            self.apply(command);
        }
        self.persist();
        self.handle.publish(&self.state);
        true
    }

    fn apply(&mut self, command: AgentCommand) {
        tracing::info!(?command, status = %self.state.status, "applying command");
        match command {
            AgentCommand::Start { mode, goal } => {
                if self.state.status != AgentStatus::Idle {
                    tracing::warn!(status = %self.state.status, "start ignored: agent is not idle");
                    return;
                }
                self.state.mode = mode;
                self.state.goal = goal.filter(|g| !g.trim().is_empty());
                self.state.current_task = None;
                self.state.session_start = Utc::now();
                self.last_reflected = None;
                self.cache = None;
                self.loop_ctrl.reset();
                self.set_status(AgentStatus::Running);
            }
            AgentCommand::Stop => {
                if self.state.status != AgentStatus::Idle {
                    self.set_status(AgentStatus::Idle);
                }
                self.capture_recovery = false;
                self.cache = None;
            }
            AgentCommand::Pause => {
                if self.state.status == AgentStatus::Running {
                    self.set_status(AgentStatus::Paused);
                }
            }
            AgentCommand::Resume => {
                if self.state.status == AgentStatus::Paused {
                    self.set_status(AgentStatus::Running);
                }
            }
            AgentCommand::Restart => {
                if self.state.status == AgentStatus::Error {
                    self.resume_after_error();
                } else {
                    tracing::warn!(status = %self.state.status, "restart ignored: agent is not in ERROR");
                }
            }
            AgentCommand::SetActiveWindow(hint) => {
                let hint = hint.filter(|h| !h.trim().is_empty());
                if hint != self.state.active_window_hint {
                    self.pending_focus = hint.clone();
                    self.cache = None;
                }
                self.state.active_window_hint = hint;
                self.state.touch();
            }
            AgentCommand::SetActiveHours(hours) => {
                self.state.active_hours = hours;
                self.state.touch();
            }
            AgentCommand::Shutdown => {
                self.shutdown = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::agent_engine::state::{ActiveHours, AgentMode};
    use crate::platform::recording::RecordingAdapter;

    /// Plays back scripted results, then repeats the last one.
    struct ScriptedPlanner {
        script: Mutex<Vec<Result<ActionPlan, PlannerError>>>,
        calls: Arc<Mutex<usize>>,
        gate: Option<(Arc<Notify>, Arc<Notify>)>,
    }

    impl ScriptedPlanner {
        fn new(mut script: Vec<Result<ActionPlan, PlannerError>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                calls: Arc::new(Mutex::new(0)),
                gate: None,
            }
        }

        fn always(plan: ActionPlan) -> Self {
            Self::new(vec![Ok(plan)])
        }

        /// Signals `entered` when a call starts and blocks until `release`.
        fn gated(mut self, entered: Arc<Notify>, release: Arc<Notify>) -> Self {
            self.gate = Some((entered, release));
            self
        }
    }

    #[async_trait]
    impl Planner for ScriptedPlanner {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn propose(&self, _: &Observation, _: &AgentState) -> Result<ActionPlan, PlannerError> {
            *self.calls.lock().unwrap() += 1;
            if let Some((entered, release)) = &self.gate {
                entered.notify_one();
                release.notified().await;
            }
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop().unwrap()
            } else {
                script.last().cloned().unwrap()
            }
        }
    }

    struct Harness {
        engine: AgentEngine,
        calls: Arc<Mutex<usize>>,
        _tmp: tempfile::TempDir,
    }

    fn config(tmp: &tempfile::TempDir) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.agent.data_dir = Some(tmp.path().to_path_buf());
        cfg.planner.backoff_base_ms = 10;
        cfg
    }

    fn harness_with(adapter: RecordingAdapter, planner: ScriptedPlanner, tweak: impl FnOnce(&mut AppConfig)) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(&tmp);
        tweak(&mut cfg);
        let calls = planner.calls.clone();
        let engine = AgentEngine::new(&cfg, Box::new(adapter), Box::new(planner)).unwrap();
        Harness { engine, calls, _tmp: tmp }
    }

    fn harness(adapter: RecordingAdapter, planner: ScriptedPlanner) -> Harness {
        harness_with(adapter, planner, |_| {})
    }

    fn planner_calls(h: &Harness) -> usize {
        *h.calls.lock().unwrap()
    }

    #[tokio::test]
    async fn unchanged_screen_reuses_the_previous_plan() {
        let mut h = harness(
            RecordingAdapter::new(1000, 1000).with_frames(&[40, 41]),
            ScriptedPlanner::always(ActionPlan::click(0.1, 0.1, 0.9)),
        );
        let handle = h.engine.handle();
        handle.start(AgentMode::Goal, Some("open settings".into()));

        assert_eq!(h.engine.step().await, StepOutcome::Acted { wait: None });
        let state = handle.state();
        assert_eq!(state.step_count, 1);
        assert_eq!(state.status, AgentStatus::Running);
        assert!(state.last_result.as_ref().unwrap().is_success());

        assert_eq!(h.engine.step().await, StepOutcome::Acted { wait: None });
        assert_eq!(handle.state().step_count, 2);
        assert_eq!(planner_calls(&h), 1);

        // The persisted record matches what readers see.
        assert_eq!(h.engine.store().load().unwrap(), handle.state());
        // One snapshot per planner-produced plan.
        assert_eq!(h.engine.store().list_snapshots().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn changed_screen_asks_the_planner_again() {
        let mut h = harness(
            RecordingAdapter::new(1000, 1000).with_frames(&[40, 200]),
            ScriptedPlanner::always(ActionPlan::click(0.1, 0.1, 0.9)),
        );
        h.engine.handle().start(AgentMode::Goal, Some("open settings".into()));
        h.engine.step().await;
        h.engine.step().await;
        assert_eq!(planner_calls(&h), 2);
    }

    #[tokio::test]
    async fn replays_are_bounded_by_max_reuses() {
        let mut h = harness_with(
            RecordingAdapter::new(200, 200),
            ScriptedPlanner::always(ActionPlan::click(0.5, 0.5, 0.9)),
            |cfg| cfg.cache.max_reuses = 1,
        );
        h.engine.handle().start(AgentMode::Goal, Some("x".into()));
        for _ in 0..4 {
            h.engine.step().await;
        }
        // plan, replay, plan, replay
        assert_eq!(planner_calls(&h), 2);
        assert_eq!(h.engine.state().step_count, 4);
    }

    #[tokio::test]
    async fn stop_during_planning_lands_after_the_call_returns() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let planner = ScriptedPlanner::always(ActionPlan::click(0.1, 0.1, 0.9)).gated(entered.clone(), release.clone());
        let mut h = harness(RecordingAdapter::new(1000, 1000), planner);
        let handle = h.engine.handle();
        handle.start(AgentMode::Goal, Some("open settings".into()));

        let control = async {
            entered.notified().await;
            handle.stop();
            // Still mid-call: the command has not been applied.
            assert_eq!(handle.state().status, AgentStatus::Running);
            release.notify_one();
        };
        let (outcome, ()) = tokio::join!(h.engine.step(), control);

        assert_eq!(outcome, StepOutcome::Inactive);
        assert_eq!(handle.state().status, AgentStatus::Idle);
        assert_eq!(handle.state().step_count, 0);
        assert_eq!(h.engine.store().load().unwrap().status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn capture_failure_recovers_once_the_screen_is_back() {
        let mut adapter = RecordingAdapter::new(200, 200);
        adapter.failing_captures = 2;
        let mut h = harness(adapter, ScriptedPlanner::always(ActionPlan::click(0.5, 0.5, 0.9)));
        let handle = h.engine.handle();
        handle.start(AgentMode::Goal, Some("x".into()));

        assert_eq!(h.engine.step().await, StepOutcome::Failed);
        let state = handle.state();
        assert_eq!(state.status, AgentStatus::Error);
        assert!(state.inner_monologue.contains("Screen capture failed"));
        assert_eq!(planner_calls(&h), 0);

        // Still dark: stays in ERROR without asking the planner.
        assert_eq!(h.engine.step().await, StepOutcome::Failed);
        assert_eq!(handle.state().status, AgentStatus::Error);
        assert_eq!(planner_calls(&h), 0);

        assert_eq!(h.engine.step().await, StepOutcome::Acted { wait: None });
        let state = handle.state();
        assert_eq!(state.status, AgentStatus::Running);
        assert_eq!(state.step_count, 1);
        assert_eq!(planner_calls(&h), 1);
        assert_eq!(h.engine.store().load().unwrap().status, AgentStatus::Running);
    }

    #[tokio::test]
    async fn stop_ends_capture_polling() {
        let mut adapter = RecordingAdapter::new(200, 200);
        adapter.failing_captures = 1;
        let mut h = harness(adapter, ScriptedPlanner::always(ActionPlan::click(0.5, 0.5, 0.9)));
        let handle = h.engine.handle();
        handle.start(AgentMode::Goal, Some("x".into()));
        assert_eq!(h.engine.step().await, StepOutcome::Failed);

        handle.stop();
        assert_eq!(h.engine.step().await, StepOutcome::Inactive);
        assert_eq!(handle.state().status, AgentStatus::Idle);
        assert_eq!(planner_calls(&h), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_polls_the_screen_after_a_capture_error() {
        let mut adapter = RecordingAdapter::new(1000, 1000);
        adapter.failing_captures = 1;
        let mut h = harness(adapter, ScriptedPlanner::always(ActionPlan::click(0.2, 0.4, 0.9)));
        let handle = h.engine.handle();
        handle.start(AgentMode::Goal, Some("x".into()));

        let control = async {
            // t=0 capture fails, t=5 capture is back and acts, t=10 acts again.
            tokio::time::sleep(Duration::from_millis(12_000)).await;
            handle.shutdown();
        };
        tokio::join!(h.engine.run_loop(), control);

        let state = handle.state();
        assert_eq!(state.status, AgentStatus::Running);
        assert_eq!(state.step_count, 2);
    }

    #[tokio::test]
    async fn fatal_planner_error_halts_planning() {
        let mut h = harness(
            RecordingAdapter::new(200, 200),
            ScriptedPlanner::new(vec![Err(PlannerError::Fatal("no API key".into()))]),
        );
        let handle = h.engine.handle();
        handle.start(AgentMode::Goal, Some("x".into()));
        assert_eq!(h.engine.step().await, StepOutcome::Failed);
        assert_eq!(handle.state().status, AgentStatus::Error);
        assert!(handle.state().inner_monologue.contains("no API key"));
        assert_eq!(planner_calls(&h), 1);
        assert_eq!(h.engine.step().await, StepOutcome::Inactive);
        assert_eq!(planner_calls(&h), 1);

        // Only a restart leaves a planner-caused ERROR.
        handle.restart();
        assert_eq!(h.engine.step().await, StepOutcome::Failed);
        assert_eq!(planner_calls(&h), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_planner_failures_escalate_to_error() {
        let mut h = harness_with(
            RecordingAdapter::new(200, 200),
            ScriptedPlanner::new(vec![Err(PlannerError::Transient("503".into()))]),
            |cfg| cfg.agent.max_consecutive_failures = 2,
        );
        let handle = h.engine.handle();
        handle.start(AgentMode::Goal, Some("x".into()));
        assert_eq!(h.engine.step().await, StepOutcome::Skipped);
        assert_eq!(handle.state().status, AgentStatus::Running);
        assert_eq!(h.engine.step().await, StepOutcome::Failed);
        let state = handle.state();
        assert_eq!(state.status, AgentStatus::Error);
        assert!(state.inner_monologue.contains("2 consecutive failed iterations"));
    }

    #[tokio::test]
    async fn repeated_execution_failures_escalate_to_error() {
        let mut adapter = RecordingAdapter::new(200, 200);
        adapter.fail_input = true;
        let mut h = harness_with(adapter, ScriptedPlanner::always(ActionPlan::click(0.5, 0.5, 0.9)), |cfg| {
            cfg.agent.max_consecutive_failures = 3
        });
        let handle = h.engine.handle();
        handle.start(AgentMode::Goal, Some("x".into()));
        assert_eq!(h.engine.step().await, StepOutcome::Acted { wait: None });
        assert_eq!(h.engine.step().await, StepOutcome::Acted { wait: None });
        assert_eq!(h.engine.step().await, StepOutcome::Failed);
        let state = handle.state();
        assert_eq!(state.status, AgentStatus::Error);
        assert_eq!(state.step_count, 3);
        assert_eq!(h.engine.step().await, StepOutcome::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_skip_the_iteration() {
        let mut h = harness(
            RecordingAdapter::new(200, 200),
            ScriptedPlanner::new(vec![Err(PlannerError::Transient("503".into()))]),
        );
        let handle = h.engine.handle();
        handle.start(AgentMode::Goal, Some("x".into()));
        let before = handle.state();
        assert_eq!(h.engine.step().await, StepOutcome::Skipped);
        assert_eq!(planner_calls(&h), 3);
        let after = handle.state();
        assert_eq!(after.status, AgentStatus::Running);
        assert_eq!(after.step_count, before.step_count);
    }

    #[tokio::test]
    async fn failed_execution_is_fed_back_and_not_replayed() {
        let mut adapter = RecordingAdapter::new(200, 200);
        adapter.panic_input = true;
        let mut h = harness(adapter, ScriptedPlanner::always(ActionPlan::click(0.5, 0.5, 0.9)));
        let handle = h.engine.handle();
        handle.start(AgentMode::Goal, Some("x".into()));

        assert_eq!(h.engine.step().await, StepOutcome::Acted { wait: None });
        let state = handle.state();
        assert_eq!(state.status, AgentStatus::Running);
        assert_eq!(state.step_count, 1);
        let result = state.last_result.unwrap();
        assert!(!result.is_success());
        assert!(result.detail.contains("panicked"));

        h.engine.step().await;
        assert_eq!(planner_calls(&h), 2);
    }

    #[tokio::test]
    async fn low_confidence_plans_are_not_dispatched() {
        let mut h = harness(RecordingAdapter::new(200, 200), ScriptedPlanner::always(ActionPlan::click(0.5, 0.5, 0.3)));
        h.engine.handle().start(AgentMode::Goal, Some("x".into()));
        h.engine.step().await;
        assert_eq!(h.engine.state().step_count, 0);
        assert!(h.engine.state().inner_monologue.starts_with("Holding back CLICK"));
    }

    #[tokio::test]
    async fn goal_complete_returns_to_idle() {
        let plan = ActionPlan::wait(0.0, 1.0).with_signal(PlanSignal::GoalComplete);
        let mut h = harness(RecordingAdapter::new(200, 200), ScriptedPlanner::always(plan));
        let handle = h.engine.handle();
        handle.start(AgentMode::Goal, Some("x".into()));
        h.engine.step().await;
        assert_eq!(handle.state().status, AgentStatus::Idle);
        assert_eq!(handle.state().step_count, 1);
    }

    #[tokio::test]
    async fn goal_complete_needs_the_step_to_be_carried_out() {
        let held_back = ActionPlan::click(0.5, 0.5, 0.3).with_signal(PlanSignal::GoalComplete);
        let mut h = harness(RecordingAdapter::new(200, 200), ScriptedPlanner::always(held_back));
        let handle = h.engine.handle();
        handle.start(AgentMode::Goal, Some("x".into()));
        h.engine.step().await;
        assert_eq!(handle.state().status, AgentStatus::Running);

        let mut adapter = RecordingAdapter::new(200, 200);
        adapter.fail_input = true;
        let failing = ActionPlan::click(0.5, 0.5, 0.9).with_signal(PlanSignal::GoalComplete);
        let mut h = harness(adapter, ScriptedPlanner::always(failing));
        let handle = h.engine.handle();
        handle.start(AgentMode::Goal, Some("x".into()));
        assert_eq!(h.engine.step().await, StepOutcome::Acted { wait: None });
        let state = handle.state();
        assert_eq!(state.status, AgentStatus::Running);
        assert_eq!(state.step_count, 1);
    }

    #[tokio::test]
    async fn batch_steps_run_in_order_from_one_planner_call() {
        let batch = ActionPlan::click(0.5, 0.5, 0.9)
            .then(ActionPlan::new(Verb::Type, None, Payload::Text { text: "hello".into() }, 0.9))
            .then(ActionPlan::new(Verb::Keypress, None, Payload::Keys { chord: "enter".into() }, 0.9));
        let mut h = harness(RecordingAdapter::new(200, 200), ScriptedPlanner::always(batch));
        let handle = h.engine.handle();
        handle.start(AgentMode::Goal, Some("x".into()));

        let mut actions = Vec::new();
        for _ in 0..3 {
            assert_eq!(h.engine.step().await, StepOutcome::Acted { wait: None });
            actions.push(handle.state().last_action.unwrap());
        }
        assert_eq!(planner_calls(&h), 1);
        assert!(actions[0].starts_with("CLICK"));
        assert!(actions[1].starts_with("TYPE"));
        assert!(actions[2].starts_with("KEYPRESS"));
        // One snapshot per planner answer.
        assert_eq!(h.engine.store().list_snapshots().unwrap().len(), 1);

        h.engine.step().await;
        assert_eq!(planner_calls(&h), 2);
    }

    #[tokio::test]
    async fn held_back_step_drops_the_rest_of_the_batch() {
        let batch = ActionPlan::click(0.5, 0.5, 0.9)
            .then(ActionPlan::click(0.1, 0.1, 0.2))
            .then(ActionPlan::click(0.9, 0.9, 0.9));
        let mut h = harness(RecordingAdapter::new(200, 200), ScriptedPlanner::always(batch));
        h.engine.handle().start(AgentMode::Goal, Some("x".into()));
        h.engine.step().await;
        h.engine.step().await;
        assert_eq!(planner_calls(&h), 1);
        assert_eq!(h.engine.state().step_count, 1);
        h.engine.step().await;
        assert_eq!(planner_calls(&h), 2);
    }

    #[tokio::test]
    async fn plan_task_becomes_the_current_task() {
        let plan = ActionPlan::click(0.5, 0.5, 0.9).with_task("open the display settings");
        let mut h = harness(RecordingAdapter::new(200, 200), ScriptedPlanner::always(plan));
        let handle = h.engine.handle();
        handle.start(AgentMode::Goal, Some("change resolution".into()));
        h.engine.step().await;
        assert_eq!(handle.state().current_task.as_deref(), Some("open the display settings"));
        assert_eq!(h.engine.store().load().unwrap().current_task.as_deref(), Some("open the display settings"));
    }

    #[tokio::test]
    async fn unrecoverable_signal_moves_to_error_without_acting() {
        let plan = ActionPlan::click(0.5, 0.5, 0.9)
            .with_signal(PlanSignal::Unrecoverable)
            .with_rationale("the app is not installed");
        let mut h = harness(RecordingAdapter::new(200, 200), ScriptedPlanner::always(plan));
        let handle = h.engine.handle();
        handle.start(AgentMode::Goal, Some("x".into()));
        assert_eq!(h.engine.step().await, StepOutcome::Failed);
        assert_eq!(handle.state().status, AgentStatus::Error);
        assert!(handle.state().inner_monologue.contains("not installed"));
        assert_eq!(handle.state().step_count, 0);
    }

    #[tokio::test]
    async fn idle_free_roam_drops_into_reflection() {
        let plan = ActionPlan::wait(1.0, 0.9).with_rationale("Nothing to do yet.");
        let mut h = harness_with(
            RecordingAdapter::new(200, 200),
            ScriptedPlanner::always(plan),
            |cfg| cfg.agent.reflection_after_idle_iterations = 2,
        );
        let handle = h.engine.handle();
        handle.start(AgentMode::FreeRoam, None);

        h.engine.step().await;
        h.engine.step().await;
        assert!(!handle.state().reflecting);
        let steps = handle.state().step_count;

        assert_eq!(h.engine.step().await, StepOutcome::Reflected);
        let state = handle.state();
        assert!(state.reflecting);
        assert_eq!(state.status, AgentStatus::Running);
        assert_eq!(state.step_count, steps);
        assert_eq!(state.inner_monologue, "Nothing to do yet.");

        // A still screen and nothing but WAIT keeps the agent resting.
        assert_eq!(h.engine.step().await, StepOutcome::Reflected);
        assert_eq!(handle.state().step_count, steps);
    }

    #[tokio::test]
    async fn actionable_plan_ends_reflection() {
        let mut h = harness_with(
            RecordingAdapter::new(200, 200).with_frames(&[10, 60, 110, 160, 210]),
            ScriptedPlanner::new(vec![
                Ok(ActionPlan::wait(1.0, 0.9)),
                Ok(ActionPlan::wait(1.0, 0.9)),
                Ok(ActionPlan::click(0.5, 0.5, 0.95)),
            ]),
            |cfg| cfg.agent.reflection_after_idle_iterations = 2,
        );
        let handle = h.engine.handle();
        handle.start(AgentMode::FreeRoam, None);

        assert!(matches!(h.engine.step().await, StepOutcome::Acted { .. }));
        assert!(matches!(h.engine.step().await, StepOutcome::Acted { .. }));
        assert_eq!(h.engine.step().await, StepOutcome::Reflected);
        assert!(handle.state().reflecting);

        assert_eq!(h.engine.step().await, StepOutcome::Acted { wait: None });
        let state = handle.state();
        assert!(!state.reflecting);
        assert_eq!(state.step_count, 3);
        assert!(state.last_action.unwrap().starts_with("CLICK"));
    }

    #[tokio::test]
    async fn screen_change_ends_reflection() {
        let mut h = harness_with(
            RecordingAdapter::new(200, 200).with_frames(&[10, 60, 110, 160, 210]),
            ScriptedPlanner::always(ActionPlan::wait(1.0, 0.9)),
            |cfg| cfg.agent.reflection_after_idle_iterations = 2,
        );
        h.engine.handle().start(AgentMode::FreeRoam, None);

        let mut outcomes = Vec::new();
        for _ in 0..5 {
            outcomes.push(h.engine.step().await);
        }
        let acted = StepOutcome::Acted { wait: Some(Duration::from_secs(1)) };
        assert_eq!(
            outcomes,
            vec![acted.clone(), acted.clone(), StepOutcome::Reflected, StepOutcome::Reflected, acted]
        );
    }

    #[tokio::test]
    async fn outside_active_hours_reflects_even_with_a_goal() {
        let mut h = harness(RecordingAdapter::new(200, 200), ScriptedPlanner::always(ActionPlan::click(0.5, 0.5, 0.9)));
        let handle = h.engine.handle();
        let start = chrono::Local::now().time() + chrono::Duration::hours(3);
        let stop = start + chrono::Duration::minutes(1);
        handle.set_active_hours(Some(
            ActiveHours::parse(&start.format("%H:%M").to_string(), &stop.format("%H:%M").to_string()).unwrap(),
        ));
        handle.start(AgentMode::Goal, Some("x".into()));
        assert_eq!(h.engine.step().await, StepOutcome::Reflected);
        assert_eq!(h.engine.state().step_count, 0);
    }

    #[tokio::test]
    async fn window_hint_change_focuses_and_fills_bare_focus_plans() {
        let mut adapter = RecordingAdapter::new(200, 200);
        adapter.supports_focus = true;
        let plan = ActionPlan::new(Verb::FocusWindow, None, Payload::None, 0.9);
        let mut h = harness(adapter, ScriptedPlanner::always(plan));
        let handle = h.engine.handle();
        handle.set_active_window(Some("Notepad".into()));
        handle.start(AgentMode::Goal, Some("write".into()));
        h.engine.step().await;
        let state = handle.state();
        assert_eq!(state.active_window_hint.as_deref(), Some("Notepad"));
        assert!(state.last_result.unwrap().is_success());
        assert_eq!(state.last_action.as_deref(), Some("FOCUS_WINDOW(Notepad) (0.90)"));
    }

    #[tokio::test]
    async fn pause_and_resume_gate_execution() {
        let mut h = harness(RecordingAdapter::new(200, 200), ScriptedPlanner::always(ActionPlan::click(0.5, 0.5, 0.9)));
        let handle = h.engine.handle();
        handle.start(AgentMode::Goal, Some("x".into()));
        handle.pause();
        assert_eq!(h.engine.step().await, StepOutcome::Inactive);
        assert_eq!(handle.state().status, AgentStatus::Paused);
        handle.resume();
        assert_eq!(h.engine.step().await, StepOutcome::Acted { wait: None });
        assert_eq!(handle.state().step_count, 1);
    }

    #[tokio::test]
    async fn interrupted_run_reloads_as_idle() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(&tmp);
        let store = StateStore::new(tmp.path(), cfg.agent.emotion_dims);
        let mut saved = AgentState::new(cfg.agent.emotion_dims);
        saved.transition(AgentStatus::Running).unwrap();
        saved.step_count = 12;
        store.save(&saved).unwrap();

        let engine = AgentEngine::new(
            &cfg,
            Box::new(RecordingAdapter::new(10, 10)),
            Box::new(ScriptedPlanner::always(ActionPlan::wait(1.0, 1.0))),
        )
        .unwrap();
        assert_eq!(engine.state().status, AgentStatus::Idle);
        assert_eq!(engine.state().step_count, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_paces_and_shuts_down() {
        let mut h = harness(RecordingAdapter::new(1000, 1000), ScriptedPlanner::always(ActionPlan::click(0.2, 0.4, 0.9)));
        let handle = h.engine.handle();
        handle.start(AgentMode::Goal, Some("x".into()));

        let control = async {
            // Default pacing is 5s: iterations at t=0, 5, 10.
            tokio::time::sleep(Duration::from_millis(10_500)).await;
            handle.shutdown();
        };
        tokio::join!(h.engine.run_loop(), control);

        assert!(h.engine.is_shut_down());
        assert_eq!(handle.state().step_count, 3);
    }
}
