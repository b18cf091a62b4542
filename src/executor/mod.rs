pub mod action;
pub mod coordinator;
pub mod dispatcher;
pub mod safety;

pub use action::{ActionPlan, NormPoint, Payload, PlanSignal, Verb};
pub use dispatcher::{execute, ExecutionResult, ExecutionStatus};
