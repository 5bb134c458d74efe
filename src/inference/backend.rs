//! Native engine seam
//!
//! The session manager never talks to llama.cpp directly. Everything it needs
//! from the engine goes through [`InferenceBackend`], whose associated types
//! are the owned model, context and sampler handles. Dropping a handle frees
//! it, so every allocation has exactly one matching release.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::inference::batch::TokenBatch;
use crate::inference::InferenceError;
use crate::system::resources::default_thread_count;

/// Smallest context the session will create; smaller KV caches are degenerate.
pub const MIN_CONTEXT_SIZE: u32 = 512;

/// Context size used when the caller does not ask for one.
pub const DEFAULT_CONTEXT_SIZE: u32 = 1024;

/// Seed value that asks the engine for a random seed.
pub const RANDOM_SEED: u32 = 0xFFFF_FFFF;

/// Vocabulary token id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub i32);

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Options for creating an inference context
#[derive(Debug, Clone, PartialEq)]
pub struct ContextConfig {
    /// Worker threads for decode (None = derived from available cores)
    pub threads: Option<u32>,
    /// Requested KV cache size in tokens
    pub context_size: u32,
    /// Largest number of tokens submitted in one decode call
    pub batch_capacity: u32,
    /// Number of parallel sequences the context must track
    pub max_sequences: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            threads: None,
            context_size: DEFAULT_CONTEXT_SIZE,
            batch_capacity: 512,
            max_sequences: 1,
        }
    }
}

impl ContextConfig {
    /// Thread count after applying the default and the floor of one.
    pub fn resolved_threads(&self) -> u32 {
        match self.threads {
            Some(n) => n.max(1),
            None => default_thread_count(),
        }
    }

    /// Context size with the minimum floor applied.
    pub fn resolved_context_size(&self) -> u32 {
        self.context_size.max(MIN_CONTEXT_SIZE)
    }
}

/// Sampler chain configuration
///
/// Applied in order: temperature, top-p, min-p, repetition penalties, then
/// the final distribution draw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub min_p: f32,
    /// How many recent tokens the penalties look at
    pub penalty_last_n: i32,
    pub repeat_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    /// Distribution seed ([`RANDOM_SEED`] = random)
    pub seed: u32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_p: 0.9,
            min_p: 0.05,
            penalty_last_n: 32,
            repeat_penalty: 1.1,
            frequency_penalty: 1.0,
            presence_penalty: 1.0,
            seed: RANDOM_SEED,
        }
    }
}

/// Model information reported after loading
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSummary {
    /// Path the model was loaded from
    pub path: String,
    /// Short human-readable description
    pub description: String,
    pub vocab_size: i32,
    pub embedding_dim: i32,
    /// Training context length
    pub context_length: u32,
    pub param_count: u64,
    pub size_bytes: u64,
}

/// Operations the session manager consumes from a native engine.
///
/// Implementations are not required to be `Send`; the worker builds the
/// backend on its own thread and never moves it.
pub trait InferenceBackend {
    type Model;
    type Context;
    type Sampler;

    fn load_model(&self, path: &Path, gpu_layers: u32) -> Result<Self::Model, InferenceError>;

    /// Creates a context bound to `model`. The context must keep whatever it
    /// needs from the model alive on its own.
    fn new_context(
        &self,
        model: &Self::Model,
        config: &ContextConfig,
    ) -> Result<Self::Context, InferenceError>;

    fn new_sampler(&self, config: &SamplerConfig) -> Self::Sampler;

    fn tokenize(
        &self,
        context: &Self::Context,
        text: &str,
        add_special: bool,
        parse_control: bool,
    ) -> Result<Vec<Token>, InferenceError>;

    /// Raw bytes of one token's piece. May end in the middle of a character.
    fn detokenize(&self, context: &Self::Context, token: Token) -> Result<Vec<u8>, InferenceError>;

    /// One forward pass over every filled slot of `batch`.
    fn decode(&self, context: &mut Self::Context, batch: &TokenBatch) -> Result<(), InferenceError>;

    /// Draws the next token from the logits of the last decoded slot.
    fn sample(&self, sampler: &mut Self::Sampler, context: &Self::Context) -> Token;

    fn is_end_of_generation(&self, context: &Self::Context, token: Token) -> bool;

    /// Clears the KV cache. `full` also drops the cached data buffers.
    fn clear_memory(&self, context: &mut Self::Context, full: bool);

    fn context_size(&self, context: &Self::Context) -> u32;

    fn describe(&self, model: &Self::Model) -> ModelSummary;

    /// Name shown in benchmark reports.
    fn backend_name(&self) -> &'static str;

    fn system_info(&self) -> String {
        String::new()
    }
}
