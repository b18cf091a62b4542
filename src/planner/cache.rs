//! Plan reuse under an unchanged screen.

use std::collections::VecDeque;

use crate::executor::ActionPlan;
use crate::perception::fingerprint::Fingerprint;

/// What is left of the last planner-produced plan, keyed by the fingerprint
/// of the observation it was planned from.
///
/// A batch hands out its steps in order and is consumed once the queue is
/// empty. A single-step plan may instead be replayed up to `max_reuses` times.
#[derive(Debug, Clone)]
pub struct CachedPlan {
    steps: VecDeque<ActionPlan>,
    replay: Option<ActionPlan>,
    pub fingerprint: Fingerprint,
    /// Replays left before the planner must be asked again.
    pub remaining: u32,
}

impl CachedPlan {
    /// Splits a fresh plan into the step to run now and the cache entry for
    /// the iterations after it.
    pub fn start(plan: ActionPlan, fingerprint: Fingerprint, max_reuses: u32) -> (ActionPlan, Self) {
        let (first, rest) = plan.split_first();
        let replay = rest.is_empty().then(|| first.clone());
        let remaining = if replay.is_some() { max_reuses } else { 0 };
        let entry = Self {
            steps: rest.into(),
            replay,
            fingerprint,
            remaining,
        };
        (first, entry)
    }

    /// Batch steps not yet handed out.
    pub fn pending_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn is_consumed(&self) -> bool {
        self.steps.is_empty() && (self.replay.is_none() || self.remaining == 0)
    }

    /// The next queued step, or a replay of a single-step plan.
    pub fn next_step(&mut self) -> Option<ActionPlan> {
        if let Some(step) = self.steps.pop_front() {
            return Some(step);
        }
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.replay.clone()
    }
}

/// Whether the cached plan should supply the step for a frame with
/// fingerprint `current`. The key is never refreshed, so slow drift still
/// forces a new plan once it crosses `threshold` (exclusive).
pub fn should_reuse(current: &Fingerprint, cached: Option<&CachedPlan>, threshold: f64) -> bool {
    match cached {
        Some(c) if !c.is_consumed() => current.distance(&c.fingerprint) < threshold,
        _ => false,
    }
}
