pub mod api;
pub mod orchestrator;
pub mod pipeline;
pub mod scheduler;

pub use api::{ApiState, router};
pub use orchestrator::Orchestrator;
pub use scheduler::TrainingScheduler;
