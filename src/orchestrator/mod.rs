pub mod pipeline;
pub mod queue;
mod runner;
pub mod session;
pub mod state;

pub use pipeline::{
    Orchestrator, OrchestratorDeps, PipelineSettings, PipelineSnapshot, RunOutcome,
};
pub use queue::{PendingEntry, PendingQueue};
pub use session::SessionRegistry;
pub use state::{StageRecord, StageStatus, StageTracker};
