use crate::config::{PlannerBackend, PlannerConfig};
use crate::errors::DeskResult;
use crate::planner::hybrid::HybridPlanner;
use crate::planner::provider::Planner;
use crate::planner::remote::RemotePlanner;
use crate::planner::vlm::VlmPlanner;

/// Builds the configured planner backend.
pub fn build_planner(cfg: &PlannerConfig) -> DeskResult<Box<dyn Planner>> {
    let planner: Box<dyn Planner> = match cfg.backend {
        PlannerBackend::Remote => Box::new(RemotePlanner::from_config(cfg)?),
        PlannerBackend::Vlm => Box::new(VlmPlanner::from_config(cfg)?),
        PlannerBackend::Hybrid => Box::new(HybridPlanner::from_config(cfg)?),
    };
    tracing::info!(
        planner = planner.name(),
        max_attempts = cfg.max_attempts,
        timeout_secs = cfg.timeout_secs,
        "planner ready"
    );
    Ok(planner)
}
