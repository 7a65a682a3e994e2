//! Item generation pipeline: orchestration and batch metrics.

mod metrics;
mod orchestrator;

pub use metrics::aggregate;
pub use orchestrator::{GenerateRequest, Orchestrator};
