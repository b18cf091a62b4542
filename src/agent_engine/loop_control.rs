// Loop cadence: when to reflect instead of act.
use crate::agent_engine::state::{AgentMode, AgentState};

pub struct LoopController {
    reflect_after: u32,
    idle_streak: u32,
    failure_count: u32,
}

impl LoopController {
    pub fn new(reflect_after: u32) -> Self {
        Self {
            reflect_after,
            idle_streak: 0,
            failure_count: 0,
        }
    }

    /// An iteration that dispatched something other than WAIT.
    pub fn record_active(&mut self) {
        self.idle_streak = 0;
        self.failure_count = 0;
    }

    /// An iteration that produced nothing to do (WAIT, skipped, or below the
    /// confidence floor).
    pub fn record_idle(&mut self) {
        self.idle_streak = self.idle_streak.saturating_add(1);
    }

    /// An iteration whose plan failed or never arrived.
    pub fn record_failure(&mut self) {
        self.failure_count = self.failure_count.saturating_add(1);
    }

    /// A dispatch succeeded, whatever it was. Ends the failure streak without
    /// touching the idle streak.
    pub fn clear_failures(&mut self) {
        self.failure_count = 0;
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn idle_streak(&self) -> u32 {
        self.idle_streak
    }

    /// Reflection applies outside active hours, or in goal-less free roam
    /// after enough idle iterations in a row.
    pub fn should_reflect(&self, state: &AgentState) -> bool {
        if state.active_hours.is_some_and(|h| !h.contains_now()) {
            return true;
        }
        self.reflect_after > 0
            && state.mode == AgentMode::FreeRoam
            && !state.has_goal()
            && self.idle_streak >= self.reflect_after
    }

    pub fn reset(&mut self) {
        self.idle_streak = 0;
        self.failure_count = 0;
    }
}
