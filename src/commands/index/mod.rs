mod orchestrator;
mod run;

pub use orchestrator::{
    BuildCounts, BuildOutcome, BuildReport, BuildRequest, BuildStage, IndexOrchestrator,
};
pub use run::run;
