//! taskpilot: an automated work-item-to-draft-PR pipeline.
//!
//! Given a tracked work item, taskpilot plans, generates, validates,
//! and proposes a code change. The core is a durable phase pipeline:
//! strictly sequential phases, checkpointed after every transition,
//! with bounded retries, a circuit breaker in front of the generation
//! backend, human-signal gates for decisions, and a Docker sandbox that
//! validates generated code before it is ever published.

pub mod breaker;
pub mod cli;
pub mod clients;
pub mod error;
pub mod gate;
pub mod llm;
pub mod pipeline;
pub mod sandbox;
pub mod secrets;

pub use breaker::{CircuitBreaker, RetryDecision};
pub use error::{CheckpointError, GateError, LlmError, SandboxError, TrackerError, VcsError};
pub use pipeline::{Orchestrator, PipelineConfig, PipelineOutcome};
