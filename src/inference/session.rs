//! Inference session state machine
//!
//! A [`Session`] owns the model, context, batch and sampler of one loaded
//! model and drives a turn: one prefill over the prompt, then repeated
//! [`Session::decode_step`] calls that each sample, check stop conditions,
//! release text and resubmit the new token.
//!
//! # States
//!
//! - `Idle`: nothing allocated.
//! - `Loaded`: every handle is live; turns may run.
//! - `Faulted`: a context reload failed after the old context was freed.
//!   Only [`Session::unload`] is accepted; recover with unload then load.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::inference::backend::{ContextConfig, InferenceBackend, ModelSummary, SamplerConfig};
use crate::inference::batch::TokenBatch;
use crate::inference::bench::{self, BenchParams, BenchReport};
use crate::inference::stop::{StopConditions, DEFAULT_STOP_MARKERS, DEFAULT_STOP_STRINGS};
use crate::inference::streaming::{Step, StopReason, Utf8Accumulator};
use crate::inference::InferenceError;

/// How the per-turn length ceiling is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthLimit {
    /// Stop once `max_new_tokens` tokens were generated after the prompt
    #[default]
    Generated,
    /// Stop once the cursor (prompt + generated) reaches `max_new_tokens`
    Absolute,
}

impl LengthLimit {
    fn reached(self, cursor: usize, prompt_tokens: usize, max_new_tokens: usize) -> bool {
        match self {
            LengthLimit::Generated => cursor.saturating_sub(prompt_tokens) >= max_new_tokens,
            LengthLimit::Absolute => cursor >= max_new_tokens,
        }
    }
}

/// Everything a session needs to allocate its handles
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub context: ContextConfig,
    /// Layers offloaded to the GPU when loading
    pub gpu_layers: u32,
    pub sampler: SamplerConfig,
    pub stop_strings: Vec<String>,
    pub stop_markers: Vec<String>,
    pub length_limit: LengthLimit,
    /// Refuse prompts that leave no room for `max_new_tokens`
    pub reject_long_prompts: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            context: ContextConfig::default(),
            gpu_layers: 0,
            sampler: SamplerConfig::default(),
            stop_strings: DEFAULT_STOP_STRINGS.iter().map(|s| s.to_string()).collect(),
            stop_markers: DEFAULT_STOP_MARKERS.iter().map(|s| s.to_string()).collect(),
            length_limit: LengthLimit::default(),
            reject_long_prompts: false,
        }
    }
}

/// Coarse session state, for callers and log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Loaded,
    Faulted,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Loaded => "loaded",
            SessionPhase::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// What a prefill did
#[derive(Debug, Clone, PartialEq)]
pub struct PrefillReport {
    /// Identifies the turn this prefill started
    pub turn_id: u64,
    /// Tokens in the prompt; also the starting cursor
    pub prompt_tokens: usize,
    /// KV slots the whole turn needs (prompt + max new tokens)
    pub required: usize,
    /// KV slots the context has
    pub context_size: usize,
}

impl PrefillReport {
    /// True when the turn may run out of KV cache before its length limit.
    pub fn exceeds_context(&self) -> bool {
        self.required > self.context_size
    }
}

// Field order is drop order: the context goes before the model it uses.
struct Resources<B: InferenceBackend> {
    context: B::Context,
    sampler: B::Sampler,
    batch: TokenBatch,
    stop: StopConditions,
    model: B::Model,
    summary: ModelSummary,
    context_config: ContextConfig,
}

enum State<B: InferenceBackend> {
    Idle,
    Loaded(Box<Resources<B>>),
    Faulted { _model: B::Model, reason: String },
}

struct Turn {
    id: u64,
    cursor: usize,
    prompt_tokens: usize,
    max_new_tokens: usize,
    /// Every byte decoded this turn, for marker detection
    text: Vec<u8>,
    /// Bytes of `text` already handed to `utf8`
    released: usize,
    utf8: Utf8Accumulator,
    finished: Option<StopReason>,
}

impl Turn {
    /// Feeds `text[released..end]` to the UTF-8 accumulator.
    fn release_up_to(&mut self, end: usize) -> String {
        if end <= self.released {
            return String::new();
        }
        let fragment = self.utf8.push(&self.text[self.released..end]);
        self.released = end;
        fragment
    }
}

/// One model's inference session
pub struct Session<B: InferenceBackend> {
    backend: B,
    options: SessionOptions,
    state: State<B>,
    turn: Option<Turn>,
    next_turn_id: u64,
}

impl<B: InferenceBackend> Session<B> {
    pub fn new(backend: B, options: SessionOptions) -> Self {
        Self {
            backend,
            options,
            state: State::Idle,
            turn: None,
            next_turn_id: 1,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        match self.state {
            State::Idle => SessionPhase::Idle,
            State::Loaded(_) => SessionPhase::Loaded,
            State::Faulted { .. } => SessionPhase::Faulted,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Summary of the loaded model, if any
    pub fn model_summary(&self) -> Option<&ModelSummary> {
        match &self.state {
            State::Loaded(res) => Some(&res.summary),
            _ => None,
        }
    }

    /// Cursor of the current turn (next position to be written)
    pub fn cursor(&self) -> Option<usize> {
        self.turn.as_ref().map(|t| t.cursor)
    }

    /// Id of the current turn, finished or not
    pub fn turn_id(&self) -> Option<u64> {
        self.turn.as_ref().map(|t| t.id)
    }

    /// Context size of the live context
    pub fn context_size(&self) -> Option<u32> {
        match &self.state {
            State::Loaded(res) => Some(self.backend.context_size(&res.context)),
            _ => None,
        }
    }

    fn state_name(&self) -> String {
        match &self.state {
            State::Faulted { reason, .. } => format!("faulted ({reason})"),
            _ => self.phase().to_string(),
        }
    }

    fn ensure_loaded(&self, operation: &'static str) -> Result<(), InferenceError> {
        match self.state {
            State::Loaded(_) => Ok(()),
            _ => Err(InferenceError::invalid_state(operation, self.state_name())),
        }
    }

    /// Loads a model and allocates its context, batch and sampler.
    ///
    /// Only valid while idle. If any allocation fails, the handles built so
    /// far are dropped and the session stays idle.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<ModelSummary, InferenceError> {
        if !matches!(self.state, State::Idle) {
            return Err(InferenceError::invalid_state("load", self.state_name()));
        }
        let path = path.as_ref();
        tracing::info!("Loading model from {}", path.display());

        let resources = self.allocate(path).map_err(|e| {
            tracing::error!("Model load failed, partial handles released: {}", e);
            e
        })?;

        let summary = resources.summary.clone();
        tracing::info!(
            "Model loaded: {} ({} params, {} vocab, n_ctx {})",
            summary.path,
            summary.param_count,
            summary.vocab_size,
            self.backend.context_size(&resources.context)
        );
        self.state = State::Loaded(Box::new(resources));
        self.turn = None;
        Ok(summary)
    }

    fn allocate(&self, path: &Path) -> Result<Resources<B>, InferenceError> {
        let model = self.backend.load_model(path, self.options.gpu_layers)?;
        let context_config = self.options.context.clone();
        let context = self.backend.new_context(&model, &context_config)?;
        let batch = TokenBatch::new(
            context_config.batch_capacity as usize,
            0,
            context_config.max_sequences as usize,
        )?;
        let sampler = self.backend.new_sampler(&self.options.sampler);
        let summary = self.backend.describe(&model);

        Ok(Resources {
            context,
            sampler,
            batch,
            stop: self.new_stop_conditions(),
            model,
            summary,
            context_config,
        })
    }

    fn new_stop_conditions(&self) -> StopConditions {
        StopConditions::new(
            self.options.stop_strings.clone(),
            self.options.stop_markers.clone(),
        )
    }

    /// Replaces the context with one using new thread/size settings.
    ///
    /// The old context is freed before the new one is created. If creation
    /// fails the session becomes `Faulted` and must be unloaded.
    pub fn reload_context(
        &mut self,
        threads: Option<u32>,
        context_size: Option<u32>,
    ) -> Result<(), InferenceError> {
        self.ensure_loaded("reload the context")?;
        let State::Loaded(resources) = std::mem::replace(&mut self.state, State::Idle) else {
            unreachable!("checked above");
        };
        let Resources {
            context,
            sampler,
            batch,
            stop: _,
            model,
            summary,
            mut context_config,
        } = *resources;

        self.turn = None;
        drop(context);

        if threads.is_some() {
            context_config.threads = threads;
        }
        if let Some(size) = context_size {
            context_config.context_size = size;
        }
        tracing::info!(
            "Reloading context: threads={}, n_ctx={}",
            context_config.resolved_threads(),
            context_config.resolved_context_size()
        );

        match self.backend.new_context(&model, &context_config) {
            Ok(context) => {
                self.state = State::Loaded(Box::new(Resources {
                    context,
                    sampler,
                    batch,
                    stop: self.new_stop_conditions(),
                    model,
                    summary,
                    context_config,
                }));
                Ok(())
            }
            Err(e) => {
                tracing::error!("Context reload failed; session needs unload and load: {}", e);
                self.state = State::Faulted {
                    _model: model,
                    reason: e.to_string(),
                };
                Err(e)
            }
        }
    }

    /// Tokenizes `prompt`, decodes it in one batch and starts a new turn.
    ///
    /// Prompt tokens go to positions `[0, n)` with logits requested only for
    /// the last one. Prompts longer than the batch are decoded in
    /// batch-sized chunks. A prompt that leaves no room for `max_new_tokens` is
    /// logged and flagged in the report, or rejected with `PromptTooLong`
    /// when the session is configured to.
    pub fn prefill(
        &mut self,
        prompt: &str,
        parse_control: bool,
        max_new_tokens: usize,
    ) -> Result<PrefillReport, InferenceError> {
        self.ensure_loaded("prefill")?;
        let reject_long_prompts = self.options.reject_long_prompts;
        let turn_id = self.next_turn_id;
        let backend = &self.backend;
        let State::Loaded(res) = &mut self.state else {
            unreachable!("checked above");
        };
        // A failed prefill leaves no turn to step
        self.turn = None;

        res.stop
            .initialize(|s| backend.tokenize(&res.context, s, false, true))?;

        let tokens = backend.tokenize(&res.context, prompt, true, parse_control)?;
        if tokens.is_empty() {
            return Err(InferenceError::Tokenization(
                "prompt produced no tokens".to_string(),
            ));
        }

        let context_size = backend.context_size(&res.context) as usize;
        let required = tokens.len() + max_new_tokens;
        tracing::info!(
            "n_len = {}, n_ctx = {}, n_kv_req = {}",
            max_new_tokens,
            context_size,
            required
        );
        if required > context_size {
            if reject_long_prompts {
                tracing::warn!("Rejecting prompt: {} KV slots required, {} available", required, context_size);
                return Err(InferenceError::PromptTooLong {
                    required,
                    available: context_size,
                });
            }
            tracing::warn!(
                "Required KV cache size ({}) exceeds the context ({}); output may be cut short",
                required,
                context_size
            );
        }

        if tracing::enabled!(tracing::Level::TRACE) {
            for token in &tokens {
                let piece = backend.detokenize(&res.context, *token).unwrap_or_default();
                tracing::trace!("token: `{}` -> {}", String::from_utf8_lossy(&piece), token);
            }
        }

        // Prompts longer than the batch go in consecutive chunks
        let chunk_len = res.batch.capacity();
        let last_chunk = (tokens.len() - 1) / chunk_len;
        for (chunk_index, chunk) in tokens.chunks(chunk_len).enumerate() {
            let start = chunk_index * chunk_len;
            res.batch.clear();
            for (i, token) in chunk.iter().enumerate() {
                res.batch.add(*token, (start + i) as i32, &[0], false)?;
            }
            if chunk_index == last_chunk {
                res.batch.set_logits(chunk.len() - 1, true)?;
            }
            res.batch.submit(backend, &mut res.context)?;
        }
        if last_chunk > 0 {
            tracing::debug!("Prompt decoded in {} chunks of up to {} tokens", last_chunk + 1, chunk_len);
        }

        self.next_turn_id += 1;
        self.turn = Some(Turn {
            id: turn_id,
            cursor: tokens.len(),
            prompt_tokens: tokens.len(),
            max_new_tokens,
            text: Vec::new(),
            released: 0,
            utf8: Utf8Accumulator::new(),
            finished: None,
        });

        tracing::debug!("Prefilled turn {} with {} tokens", turn_id, tokens.len());
        Ok(PrefillReport {
            turn_id,
            prompt_tokens: tokens.len(),
            required,
            context_size,
        })
    }

    /// Produces the next fragment of the current turn.
    ///
    /// Trailing bytes that could be the start of a stop marker are held
    /// back until the next piece shows whether they are.
    ///
    /// Returns `EndOfStream` once a stop condition holds, and keeps returning
    /// it until a new turn is prefilled. A decode failure ends the turn and
    /// is returned as `DecodeFailed`; text already released stays released.
    pub fn decode_step(&mut self) -> Result<Step, InferenceError> {
        let Session {
            backend,
            options,
            state,
            turn,
            ..
        } = self;
        let backend: &B = backend;

        let res = match state {
            State::Loaded(res) => res,
            State::Idle => return Err(InferenceError::invalid_state("decode", "idle")),
            State::Faulted { reason, .. } => {
                return Err(InferenceError::invalid_state(
                    "decode",
                    format!("faulted ({reason})"),
                ))
            }
        };
        let Some(current) = turn.as_mut() else {
            return Err(InferenceError::invalid_state(
                "decode",
                "no turn has been prefilled",
            ));
        };
        if let Some(reason) = &current.finished {
            return Ok(Step::EndOfStream(reason.clone()));
        }

        let token = backend.sample(&mut res.sampler, &res.context);
        let cursor = current.cursor;
        let context_size = backend.context_size(&res.context) as usize;

        let stop = if backend.is_end_of_generation(&res.context, token) {
            Some(StopReason::EndOfGeneration)
        } else if res.stop.is_stop_token(token) {
            Some(StopReason::StopToken)
        } else if options
            .length_limit
            .reached(cursor, current.prompt_tokens, current.max_new_tokens)
        {
            Some(StopReason::MaxLength)
        } else if cursor >= context_size {
            Some(StopReason::ContextFull)
        } else {
            None
        };
        if let Some(reason) = stop {
            tracing::info!(
                "Stopping generation: reason={:?}, token={}, n_cur={}",
                reason,
                token,
                cursor
            );
            current.finished = Some(reason.clone());
            // Bytes held back as a possible marker start were plain text
            let held = current.release_up_to(current.text.len());
            if !held.is_empty() {
                return Ok(Step::Fragment(held));
            }
            return Ok(Step::EndOfStream(reason));
        }

        let piece = match backend.detokenize(&res.context, token) {
            Ok(piece) => piece,
            Err(e) => {
                tracing::error!("Generation failed at n_cur={}: {}", cursor, e);
                *turn = None;
                return Err(e);
            }
        };
        current.text.extend_from_slice(&piece);

        if let Some(marker) = res.stop.find_marker(&current.text, piece.len()) {
            tracing::info!("Found stop marker {:?} in generated text", marker);
            let reason = StopReason::StopMarker(marker.to_string());
            current.finished = Some(reason.clone());

            // Text in front of the marker is still released; the marker is not
            let start = StopConditions::marker_start(&current.text, marker).unwrap_or(current.released);
            let before = current.release_up_to(start);
            current.released = current.text.len();
            current.utf8.reset();
            if !before.is_empty() {
                return Ok(Step::Fragment(before));
            }
            return Ok(Step::EndOfStream(reason));
        }

        let safe_end = current.text.len() - res.stop.partial_marker_len(&current.text);
        let fragment = current.release_up_to(safe_end);
        tracing::trace!("token {} -> {:?} (released {:?})", token, String::from_utf8_lossy(&piece), fragment);

        res.batch.clear();
        let submitted = res
            .batch
            .add(token, cursor as i32, &[0], true)
            .and_then(|_| {
                current.cursor += 1;
                res.batch.submit(backend, &mut res.context)
            });
        if let Err(e) = submitted {
            tracing::error!("Generation failed at n_cur={}: {}", cursor, e);
            *turn = None;
            return Err(e);
        }

        Ok(Step::Fragment(fragment))
    }

    /// Like [`Session::decode_step`], but only for the turn `turn_id`.
    ///
    /// Fails with `InvalidState` if another turn has started since.
    pub fn decode_step_for(&mut self, turn_id: u64) -> Result<Step, InferenceError> {
        match self.turn_id() {
            Some(current) if current != turn_id => Err(InferenceError::invalid_state(
                "continue a replaced turn",
                format!("turn {turn_id} was replaced by turn {current}"),
            )),
            _ => self.decode_step(),
        }
    }

    /// Clears the KV cache. A turn in progress ends as `Interrupted`.
    pub fn clear_cache(&mut self, full: bool) -> Result<(), InferenceError> {
        self.ensure_loaded("clear the cache")?;
        let backend = &self.backend;
        let State::Loaded(res) = &mut self.state else {
            unreachable!("checked above");
        };
        backend.clear_memory(&mut res.context, full);
        interrupt(&mut self.turn);
        tracing::debug!("KV cache cleared (full={})", full);
        Ok(())
    }

    /// Runs synthetic prefill and generation passes and reports throughput.
    ///
    /// Uses the session's own context and batch and clears the cache around
    /// every pass, so a turn in progress ends as `Interrupted`.
    pub fn benchmark(&mut self, params: &BenchParams) -> Result<BenchReport, InferenceError> {
        self.ensure_loaded("benchmark")?;
        let backend = &self.backend;
        let State::Loaded(res) = &mut self.state else {
            unreachable!("checked above");
        };
        interrupt(&mut self.turn);
        bench::run(backend, &mut res.context, &mut res.batch, &res.summary, params)
    }

    /// Frees every handle. Does nothing when already idle.
    pub fn unload(&mut self) {
        if matches!(self.state, State::Idle) {
            return;
        }
        self.turn = None;
        self.state = State::Idle;
        tracing::info!("Model unloaded");
    }

    #[cfg(test)]
    fn context(&self) -> Option<&B::Context> {
        match &self.state {
            State::Loaded(res) => Some(&res.context),
            _ => None,
        }
    }

    #[cfg(test)]
    fn stop_conditions(&self) -> Option<&StopConditions> {
        match &self.state {
            State::Loaded(res) => Some(&res.stop),
            _ => None,
        }
    }
}

fn interrupt(turn: &mut Option<Turn>) {
    if let Some(turn) = turn.as_mut() {
        if turn.finished.is_none() {
            turn.finished = Some(StopReason::Interrupted);
        }
    }
}
