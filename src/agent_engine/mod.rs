pub mod control;
pub mod engine;
pub mod history;
pub mod loop_control;
pub mod state;

pub use control::{AgentCommand, AgentHandle};
pub use engine::{AgentEngine, StepOutcome};
pub use state::{ActiveHours, AgentMode, AgentState, AgentStatus};
