//! The phase pipeline: configuration, run state, checkpoints, phase
//! steps, and the orchestrator that sequences them.

pub mod checkpoint;
pub mod config;
pub mod orchestrator;
pub mod phases;
pub mod state;

pub use checkpoint::CheckpointStore;
pub use config::{ConfigError, PipelineConfig};
pub use orchestrator::Orchestrator;
pub use phases::{PhaseError, PhaseStep, StepOutcome};
pub use state::{FailureAnalysis, Phase, PipelineOutcome, PipelineRun, RunStatus};
