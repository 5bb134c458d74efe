//! Deterministic backend for tests
//!
//! Vocabulary: ids 0..=255 are raw bytes, followed by a handful of special
//! tokens. Sampling replays a script, then repeats a filler token.

use std::cell::Cell;
use std::collections::VecDeque;
use std::path::Path;

use crate::inference::backend::{ContextConfig, InferenceBackend, ModelSummary, SamplerConfig, Token};
use crate::inference::batch::TokenBatch;
use crate::inference::InferenceError;

pub const BOS: Token = Token(256);
pub const EOS: Token = Token(257);
pub const IM_END: Token = Token(258);
pub const END_OF_TEXT: Token = Token(259);
pub const IM_START: Token = Token(260);

const SPECIALS: &[(Token, &str)] = &[
    (IM_END, "<|im_end|>"),
    (END_OF_TEXT, "<|endoftext|>"),
    (IM_START, "<|im_start|>"),
];

/// Byte tokens spelling `text`.
pub fn bytes_of(text: &str) -> Vec<Token> {
    text.bytes().map(|b| Token(b as i32)).collect()
}

pub struct MockModel {
    pub path: String,
}

pub struct MockContext {
    pub n_ctx: u32,
    /// Every (token, position) submitted since the last clear
    pub decoded: Vec<(Token, i32)>,
    pub decode_calls: usize,
    pub clears: usize,
    pub logits_ready: bool,
}

pub struct MockSampler {
    script: VecDeque<Token>,
    filler: Token,
}

pub struct ScriptedBackend {
    pub script: Vec<Token>,
    pub filler: Token,
    pub fail_model_load: bool,
    /// Context creations allowed before `new_context` starts failing
    pub contexts_before_failure: Option<usize>,
    /// 1-based decode call (per context) that fails
    pub fail_decode_at: Option<usize>,
    contexts_created: Cell<usize>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Token>) -> Self {
        Self {
            script,
            filler: EOS,
            fail_model_load: false,
            contexts_before_failure: None,
            fail_decode_at: None,
            contexts_created: Cell::new(0),
        }
    }

    /// Script that spells `text` byte by byte and then ends with `end`.
    pub fn spelling(text: &str, end: Token) -> Self {
        let mut script = bytes_of(text);
        script.push(end);
        Self::new(script)
    }

    pub fn with_filler(mut self, filler: Token) -> Self {
        self.filler = filler;
        self
    }

    pub fn contexts_created(&self) -> usize {
        self.contexts_created.get()
    }
}

impl InferenceBackend for ScriptedBackend {
    type Model = MockModel;
    type Context = MockContext;
    type Sampler = MockSampler;

    fn load_model(&self, path: &Path, _gpu_layers: u32) -> Result<MockModel, InferenceError> {
        if self.fail_model_load {
            return Err(InferenceError::LoadFailed(format!(
                "cannot read {}",
                path.display()
            )));
        }
        Ok(MockModel {
            path: path.to_string_lossy().to_string(),
        })
    }

    fn new_context(
        &self,
        _model: &MockModel,
        config: &ContextConfig,
    ) -> Result<MockContext, InferenceError> {
        if let Some(limit) = self.contexts_before_failure {
            if self.contexts_created.get() >= limit {
                return Err(InferenceError::ContextCreateFailed(
                    "out of memory".to_string(),
                ));
            }
        }
        self.contexts_created.set(self.contexts_created.get() + 1);
        Ok(MockContext {
            n_ctx: config.resolved_context_size(),
            decoded: Vec::new(),
            decode_calls: 0,
            clears: 0,
            logits_ready: false,
        })
    }

    fn new_sampler(&self, _config: &SamplerConfig) -> MockSampler {
        MockSampler {
            script: self.script.iter().copied().collect(),
            filler: self.filler,
        }
    }

    fn tokenize(
        &self,
        _context: &MockContext,
        text: &str,
        add_special: bool,
        parse_control: bool,
    ) -> Result<Vec<Token>, InferenceError> {
        let mut tokens = Vec::new();
        if add_special {
            tokens.push(BOS);
        }
        let mut rest = text;
        'outer: while !rest.is_empty() {
            if parse_control {
                for (token, literal) in SPECIALS {
                    if let Some(after) = rest.strip_prefix(literal) {
                        tokens.push(*token);
                        rest = after;
                        continue 'outer;
                    }
                }
            }
            let ch = rest.chars().next().unwrap_or_default();
            let mut buf = [0u8; 4];
            tokens.extend(bytes_of(ch.encode_utf8(&mut buf)));
            rest = &rest[ch.len_utf8()..];
        }
        Ok(tokens)
    }

    fn detokenize(&self, _context: &MockContext, token: Token) -> Result<Vec<u8>, InferenceError> {
        if (0..=255).contains(&token.0) {
            return Ok(vec![token.0 as u8]);
        }
        if token == BOS || token == EOS {
            return Ok(Vec::new());
        }
        SPECIALS
            .iter()
            .find(|(t, _)| *t == token)
            .map(|(_, literal)| literal.as_bytes().to_vec())
            .ok_or_else(|| InferenceError::Detokenization(format!("unknown token {token}")))
    }

    fn decode(&self, context: &mut MockContext, batch: &TokenBatch) -> Result<(), InferenceError> {
        context.decode_calls += 1;
        if self.fail_decode_at == Some(context.decode_calls) {
            return Err(InferenceError::DecodeFailed("injected failure".to_string()));
        }
        if batch.is_empty() {
            return Err(InferenceError::DecodeFailed("empty batch".to_string()));
        }
        for slot in batch.filled() {
            if slot.pos as u32 >= context.n_ctx {
                return Err(InferenceError::DecodeFailed("KV cache full".to_string()));
            }
            context.decoded.push((slot.token, slot.pos));
        }
        context.logits_ready = batch.last_wants_logits();
        Ok(())
    }

    fn sample(&self, sampler: &mut MockSampler, context: &MockContext) -> Token {
        assert!(context.logits_ready, "sampled without logits");
        sampler.script.pop_front().unwrap_or(sampler.filler)
    }

    fn is_end_of_generation(&self, _context: &MockContext, token: Token) -> bool {
        token == EOS
    }

    fn clear_memory(&self, context: &mut MockContext, _full: bool) {
        context.decoded.clear();
        context.clears += 1;
    }

    fn context_size(&self, context: &MockContext) -> u32 {
        context.n_ctx
    }

    fn describe(&self, model: &MockModel) -> ModelSummary {
        ModelSummary {
            path: model.path.clone(),
            description: "mock 1M".to_string(),
            vocab_size: 261,
            embedding_dim: 8,
            context_length: 4096,
            param_count: 1_000_000,
            size_bytes: 4_000_000,
        }
    }

    fn backend_name(&self) -> &'static str {
        "mock"
    }

    fn system_info(&self) -> String {
        "mock backend".to_string()
    }
}
