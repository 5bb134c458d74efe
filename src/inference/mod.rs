//! LLM inference session manager
//!
//! This module owns everything between the caller and the native engine:
//! resource handles, the decode batch, stop detection, incremental UTF-8
//! release, the session state machine and the single-worker dispatcher.

pub mod backend;
pub mod batch;
pub mod bench;
#[cfg(feature = "llama")]
pub mod llama;
#[cfg(test)]
pub(crate) mod mock;
pub mod model;
pub mod session;
pub mod stop;
pub mod streaming;
pub mod worker;

use thiserror::Error;

// Re-export main types for convenience
pub use backend::{ContextConfig, InferenceBackend, ModelSummary, SamplerConfig, Token};
pub use batch::TokenBatch;
pub use bench::{BenchParams, BenchReport};
#[cfg(feature = "llama")]
pub use llama::LlamaCppBackend;
pub use model::{probe_gguf, GgufHeader, ModelError, GGUF_MAGIC};
pub use session::{LengthLimit, PrefillReport, Session, SessionOptions, SessionPhase};
pub use stop::StopConditions;
pub use streaming::{is_valid_utf8, Step, StopReason, Utf8Accumulator};
pub use worker::{SessionWorker, TurnDefaults, TurnStream};

/// Errors surfaced by the session manager
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InferenceError {
    #[error("Failed to allocate {0}")]
    AllocationFailed(String),

    #[error("Failed to load model: {0}")]
    LoadFailed(String),

    #[error("Failed to create context: {0}")]
    ContextCreateFailed(String),

    #[error("Batch capacity exceeded ({capacity} slots)")]
    CapacityExceeded { capacity: usize },

    #[error("Too many sequence ids for one slot (max {max}, got {got})")]
    TooManySequences { max: usize, got: usize },

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Prompt too long: {required} tokens required, context holds {available}")]
    PromptTooLong { required: usize, available: usize },

    #[error("Invalid state: cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Detokenization failed: {0}")]
    Detokenization(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Worker thread error: {0}")]
    Worker(String),
}

impl From<ModelError> for InferenceError {
    fn from(e: ModelError) -> Self {
        InferenceError::ModelValidation(e.to_string())
    }
}

impl InferenceError {
    pub(crate) fn invalid_state(operation: &'static str, state: impl Into<String>) -> Self {
        InferenceError::InvalidState {
            operation,
            state: state.into(),
        }
    }
}
