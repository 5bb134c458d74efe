//! llama.cpp backend via `llama-cpp-2`
//!
//! None of these handles are `Send`; they are created and used on the
//! session worker thread only.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::LogOptions;

use crate::inference::backend::{ContextConfig, InferenceBackend, ModelSummary, SamplerConfig, Token};
use crate::inference::batch::TokenBatch;
use crate::inference::model::probe_gguf;
use crate::inference::InferenceError;

/// Process-wide llama.cpp backend
pub struct LlamaCppBackend {
    backend: LlamaBackend,
}

impl LlamaCppBackend {
    /// Initializes llama.cpp and routes its logs into `tracing`.
    ///
    /// llama.cpp allows one backend per process; a second call fails.
    pub fn init() -> Result<Self, InferenceError> {
        llama_cpp_2::send_logs_to_tracing(LogOptions::default());
        let backend = LlamaBackend::init()
            .map_err(|e| InferenceError::AllocationFailed(format!("llama backend: {e}")))?;
        tracing::info!("LlamaBackend initialized");
        Ok(Self { backend })
    }
}

pub struct LlamaModelHandle {
    model: Arc<LlamaModel>,
    path: String,
}

/// A context plus the staging batch handed to `llama_decode`
pub struct LlamaContextHandle {
    // Declared before `model` so it is dropped first.
    context: LlamaContext<'static>,
    staging: LlamaBatch,
    staging_capacity: usize,
    staging_seq_max: usize,
    model: Arc<LlamaModel>,
}

impl LlamaContextHandle {
    /// Copies the filled slots of `batch` into the native batch, growing it
    /// when the shape changed.
    fn stage(&mut self, batch: &TokenBatch) -> Result<(), InferenceError> {
        if self.staging_capacity != batch.capacity() || self.staging_seq_max != batch.n_seq_max() {
            self.staging = LlamaBatch::new(batch.capacity(), batch.n_seq_max() as i32);
            self.staging_capacity = batch.capacity();
            self.staging_seq_max = batch.n_seq_max();
        }
        self.staging.clear();
        for slot in batch.filled() {
            self.staging
                .add(LlamaToken::new(slot.token.0), slot.pos, &slot.seq_ids, slot.logits)
                .map_err(|e| InferenceError::DecodeFailed(e.to_string()))?;
        }
        Ok(())
    }
}

/// True when the caller asked for control text to stay literal but the
/// prompt has some; `str_to_token` always parses it as special tokens.
fn control_text_forced(text: &str, parse_control: bool) -> bool {
    !parse_control && text.contains("<|")
}

impl InferenceBackend for LlamaCppBackend {
    type Model = LlamaModelHandle;
    type Context = LlamaContextHandle;
    type Sampler = LlamaSampler;

    fn load_model(&self, path: &Path, gpu_layers: u32) -> Result<LlamaModelHandle, InferenceError> {
        let header = probe_gguf(path)?;
        tracing::debug!(
            "GGUF v{}: {} tensors, {} metadata entries",
            header.version,
            header.tensor_count,
            header.metadata_kv_count
        );

        let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
        let model = LlamaModel::load_from_file(&self.backend, path, &model_params)
            .map_err(|e| InferenceError::LoadFailed(e.to_string()))?;

        Ok(LlamaModelHandle {
            model: Arc::new(model),
            path: path.to_string_lossy().to_string(),
        })
    }

    fn new_context(
        &self,
        model: &LlamaModelHandle,
        config: &ContextConfig,
    ) -> Result<LlamaContextHandle, InferenceError> {
        let threads = config.resolved_threads() as i32;
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(config.resolved_context_size()))
            .with_n_batch(config.batch_capacity)
            .with_n_threads(threads)
            .with_n_threads_batch(threads)
            .with_n_seq_max(config.max_sequences);

        let owner = Arc::clone(&model.model);
        // SAFETY: the handle keeps `owner` alive and drops `context` first,
        // so the model outlives every use of this reference.
        let model_ref: &'static LlamaModel = unsafe { &*Arc::as_ptr(&owner) };
        let context = model_ref
            .new_context(&self.backend, ctx_params)
            .map_err(|e| InferenceError::ContextCreateFailed(e.to_string()))?;

        let capacity = config.batch_capacity as usize;
        let seq_max = config.max_sequences as usize;
        Ok(LlamaContextHandle {
            context,
            staging: LlamaBatch::new(capacity, seq_max as i32),
            staging_capacity: capacity,
            staging_seq_max: seq_max,
            model: owner,
        })
    }

    fn new_sampler(&self, config: &SamplerConfig) -> LlamaSampler {
        LlamaSampler::chain_simple([
            LlamaSampler::temp(config.temperature),
            LlamaSampler::top_p(config.top_p, 1),
            LlamaSampler::min_p(config.min_p, 1),
            LlamaSampler::penalties(
                config.penalty_last_n,
                config.repeat_penalty,
                config.frequency_penalty,
                config.presence_penalty,
            ),
            LlamaSampler::dist(config.seed),
        ])
    }

    fn tokenize(
        &self,
        context: &LlamaContextHandle,
        text: &str,
        add_special: bool,
        parse_control: bool,
    ) -> Result<Vec<Token>, InferenceError> {
        if control_text_forced(text, parse_control) {
            tracing::warn!(
                "parse_control=false is not supported by llama.cpp tokenization; control text in the prompt is parsed as special tokens"
            );
        }
        let add_bos = if add_special {
            AddBos::Always
        } else {
            AddBos::Never
        };
        let tokens = context
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| InferenceError::Tokenization(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| Token(t.0)).collect())
    }

    fn detokenize(&self, context: &LlamaContextHandle, token: Token) -> Result<Vec<u8>, InferenceError> {
        context
            .model
            .token_to_bytes(LlamaToken::new(token.0), Special::Tokenize)
            .map_err(|e| InferenceError::Detokenization(e.to_string()))
    }

    fn decode(&self, context: &mut LlamaContextHandle, batch: &TokenBatch) -> Result<(), InferenceError> {
        context.stage(batch)?;
        context
            .context
            .decode(&mut context.staging)
            .map_err(|e| InferenceError::DecodeFailed(e.to_string()))
    }

    fn sample(&self, sampler: &mut LlamaSampler, context: &LlamaContextHandle) -> Token {
        // The sampler chain accepts the token itself
        Token(sampler.sample(&context.context, -1).0)
    }

    fn is_end_of_generation(&self, context: &LlamaContextHandle, token: Token) -> bool {
        context.model.is_eog_token(LlamaToken::new(token.0))
    }

    fn clear_memory(&self, context: &mut LlamaContextHandle, _full: bool) {
        context.context.clear_kv_cache();
    }

    fn context_size(&self, context: &LlamaContextHandle) -> u32 {
        context.context.n_ctx()
    }

    fn describe(&self, model: &LlamaModelHandle) -> ModelSummary {
        let m = &model.model;
        let description = Path::new(&model.path)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| model.path.clone());
        ModelSummary {
            path: model.path.clone(),
            description,
            vocab_size: m.n_vocab(),
            embedding_dim: m.n_embd(),
            context_length: m.n_ctx_train(),
            param_count: m.n_params() as u64,
            size_bytes: m.size() as u64,
        }
    }

    fn backend_name(&self) -> &'static str {
        if self.backend.supports_gpu_offload() {
            "llama.cpp (gpu)"
        } else {
            "llama.cpp (cpu)"
        }
    }

    fn system_info(&self) -> String {
        format!(
            "llama.cpp: gpu_offload={}, mmap={}, mlock={}, cores={}",
            self.backend.supports_gpu_offload(),
            self.backend.supports_mmap(),
            self.backend.supports_mlock(),
            crate::system::resources::available_cores()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_text_forced() {
        assert!(control_text_forced("<|im_start|>user\nhi", false));
        assert!(!control_text_forced("<|im_start|>user\nhi", true));
        assert!(!control_text_forced("plain prompt", false));
    }
}
