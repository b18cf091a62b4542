use std::time::Duration;

use crate::agent_engine::state::AgentState;
use crate::config::PlannerConfig;
use crate::errors::PlannerError;
use crate::executor::ActionPlan;
use crate::perception::types::Observation;
use crate::planner::provider::Planner;

/// Bounded exponential backoff for planner calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total calls per iteration, including the first. Never less than 1.
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &PlannerConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base: Duration::from_millis(cfg.backoff_base_ms),
            max: Duration::from_millis(cfg.backoff_max_ms),
        }
    }

    /// Delay after the `attempt`-th failed call (1-based): `base * 2^(attempt-1)`,
    /// capped at `max`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1 << shift).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PlannerConfig::default())
    }
}

/// Calls the planner until it succeeds, fails fatally, or the attempt budget
/// is spent. Transient and malformed outcomes are retried; the last error is
/// returned once the budget runs out.
pub async fn propose_with_retry(
    planner: &dyn Planner,
    observation: &Observation,
    state: &AgentState,
    policy: &RetryPolicy,
) -> Result<ActionPlan, PlannerError> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match planner.propose(observation, state).await {
            Ok(plan) => {
                if attempt > 1 {
                    tracing::info!(planner = planner.name(), attempt, "planner recovered after retry");
                }
                return Ok(plan);
            }
            Err(e) if !e.is_retryable() => {
                tracing::error!(planner = planner.name(), error = %e, "planner failed fatally");
                return Err(e);
            }
            Err(e) if attempt >= attempts => {
                tracing::warn!(planner = planner.name(), attempts, error = %e, "planner retries exhausted");
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    planner = planner.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "planner call failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
