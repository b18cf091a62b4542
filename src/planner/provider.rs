use async_trait::async_trait;

use crate::agent_engine::state::AgentState;
use crate::errors::PlannerError;
use crate::executor::ActionPlan;
use crate::perception::types::Observation;

/// Unified planner trait. Every backend implements this trait and is selected
/// once at startup by [`build_planner`](crate::planner::registry::build_planner).
///
/// A returned plan has already passed [`ActionPlan::validate`]; anything that
/// could not be turned into one comes back as [`PlannerError::Malformed`].
#[async_trait]
pub trait Planner: Send + Sync {
    /// Identifier used in logs.
    fn name(&self) -> &str;

    async fn propose(&self, observation: &Observation, state: &AgentState) -> Result<ActionPlan, PlannerError>;
}
