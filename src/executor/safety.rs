// Confidence floor applied before dispatch.
use crate::executor::action::{ActionPlan, Verb};

/// True if this plan is too uncertain to touch the screen.
/// WAIT is always allowed through since it has no physical effect.
pub fn below_confidence_floor(plan: &ActionPlan, floor: f64) -> bool {
    plan.verb != Verb::Wait && plan.confidence < floor
}
