pub mod cache;
pub(crate) mod http;
pub mod hybrid;
pub mod prompt;
pub mod provider;
pub mod registry;
pub mod remote;
pub mod repair;
pub mod retry;
pub mod vision;
pub mod vlm;

pub use cache::{should_reuse, CachedPlan};
pub use provider::Planner;
pub use registry::build_planner;
pub use retry::{propose_with_retry, RetryPolicy};
