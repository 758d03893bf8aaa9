//! Generation backend client and response parsing.

pub mod client;
pub mod parse;

pub use client::{Completion, GenerationBackend, GuardedBackend, InferenceClient, TokenUsage};
pub use parse::{extract_json, ParseOutcome};
