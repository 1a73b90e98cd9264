//! The multi-device tier: device discovery, the demon partition and the fan-out.

mod discovery;
mod orchestrator;
mod partition;

pub use discovery::discover;
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use partition::Partition;
