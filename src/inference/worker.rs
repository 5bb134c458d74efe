//! Single-worker session dispatcher
//!
//! # Architecture
//!
//! Native engine handles (llama.cpp's backend, model and context) contain raw
//! pointers that are not `Send`. The backend is therefore built on, and
//! never leaves, a dedicated worker thread that owns the [`Session`]. Callers
//! talk to it through a command channel; every command carries its own
//! response channel, so operations run strictly one at a time and in the
//! order they were sent.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use crate::inference::backend::{InferenceBackend, ModelSummary};
use crate::inference::bench::{BenchParams, BenchReport};
use crate::inference::session::{PrefillReport, Session, SessionOptions};
use crate::inference::streaming::{Step, StopReason};
use crate::inference::InferenceError;
use crate::prompt::{ChatMlBuilder, Conversation};
use crate::types::message::Message;

/// Per-turn settings used by [`SessionWorker::send`] and
/// [`SessionWorker::stream_turn`]
#[derive(Debug, Clone)]
pub struct TurnDefaults {
    pub max_new_tokens: usize,
    /// Parse special-token text in prompts as control tokens
    pub parse_special: bool,
    /// Clear the KV cache before each prefill
    pub clear_cache_between_turns: bool,
}

impl Default for TurnDefaults {
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            parse_special: true,
            clear_cache_between_turns: true,
        }
    }
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Load {
        path: PathBuf,
        response_tx: Sender<Result<ModelSummary, InferenceError>>,
    },
    ReloadContext {
        threads: Option<u32>,
        context_size: Option<u32>,
        response_tx: Sender<Result<(), InferenceError>>,
    },
    BeginTurn {
        prompt: String,
        parse_control: bool,
        max_new_tokens: usize,
        clear_cache: bool,
        response_tx: Sender<Result<PrefillReport, InferenceError>>,
    },
    Step {
        turn_id: Option<u64>,
        response_tx: Sender<Result<Step, InferenceError>>,
    },
    ClearCache {
        response_tx: Sender<Result<(), InferenceError>>,
    },
    Benchmark {
        params: BenchParams,
        response_tx: Sender<Result<BenchReport, InferenceError>>,
    },
    SystemInfo {
        response_tx: Sender<String>,
    },
    Unload {
        response_tx: Sender<()>,
    },
    Shutdown,
}

/// Handle to the worker thread that owns the session
pub struct SessionWorker {
    /// Channel to send commands to the worker thread
    command_tx: Option<Sender<WorkerCommand>>,
    /// Handle to the worker thread
    worker_handle: Option<JoinHandle<()>>,
    defaults: TurnDefaults,
}

impl SessionWorker {
    /// Starts the worker thread and builds the backend on it.
    ///
    /// Returns once `factory` has run; its error, if any, is returned here
    /// and the thread exits.
    pub fn spawn<B, F>(
        factory: F,
        options: SessionOptions,
        defaults: TurnDefaults,
    ) -> Result<Self, InferenceError>
    where
        B: InferenceBackend + 'static,
        F: FnOnce() -> Result<B, InferenceError> + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("inference-worker".to_string())
            .spawn(move || worker_thread_main(factory, options, ready_tx, command_rx))
            .map_err(|e| InferenceError::Worker(e.to_string()))?;

        let ready = ready_rx
            .recv()
            .map_err(|e| InferenceError::Worker(e.to_string()))?;
        if let Err(e) = ready {
            let _ = handle.join();
            return Err(e);
        }

        tracing::info!("Inference worker thread started");
        Ok(Self {
            command_tx: Some(command_tx),
            worker_handle: Some(handle),
            defaults,
        })
    }

    pub fn defaults(&self) -> &TurnDefaults {
        &self.defaults
    }

    /// Sends one command and waits for its response.
    fn request<T>(
        &self,
        command: impl FnOnce(Sender<T>) -> WorkerCommand,
    ) -> Result<T, InferenceError> {
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or_else(|| InferenceError::Worker("worker has shut down".to_string()))?;

        let (response_tx, response_rx) = mpsc::channel();
        command_tx
            .send(command(response_tx))
            .map_err(|e| InferenceError::Worker(e.to_string()))?;
        response_rx
            .recv()
            .map_err(|e| InferenceError::Worker(e.to_string()))
    }

    /// Loads a model and allocates its context, batch and sampler
    pub fn load_model<P: AsRef<Path>>(&self, path: P) -> Result<ModelSummary, InferenceError> {
        let path = path.as_ref().to_path_buf();
        self.request(|response_tx| WorkerCommand::Load { path, response_tx })?
    }

    /// Recreates the context with new thread/size settings
    pub fn reload_context(
        &self,
        threads: Option<u32>,
        context_size: Option<u32>,
    ) -> Result<(), InferenceError> {
        self.request(|response_tx| WorkerCommand::ReloadContext {
            threads,
            context_size,
            response_tx,
        })?
    }

    /// Prefills `prompt` and starts a new turn.
    ///
    /// The cache is not cleared first; see [`SessionWorker::stream_turn`].
    pub fn begin_turn(
        &self,
        prompt: &str,
        parse_control: bool,
        max_new_tokens: usize,
    ) -> Result<PrefillReport, InferenceError> {
        self.begin(prompt, parse_control, max_new_tokens, false)
    }

    fn begin(
        &self,
        prompt: &str,
        parse_control: bool,
        max_new_tokens: usize,
        clear_cache: bool,
    ) -> Result<PrefillReport, InferenceError> {
        let prompt = prompt.to_string();
        self.request(|response_tx| WorkerCommand::BeginTurn {
            prompt,
            parse_control,
            max_new_tokens,
            clear_cache,
            response_tx,
        })?
    }

    /// One decode step of whatever turn is current
    pub fn step_turn(&self) -> Result<Step, InferenceError> {
        self.step(None)
    }

    fn step(&self, turn_id: Option<u64>) -> Result<Step, InferenceError> {
        self.request(|response_tx| WorkerCommand::Step {
            turn_id,
            response_tx,
        })?
    }

    /// Starts a turn and returns a lazy stream of its text.
    ///
    /// Clears the cache first when the defaults ask for it.
    pub fn stream_turn(
        &self,
        prompt: &str,
        parse_control: bool,
        max_new_tokens: usize,
    ) -> Result<TurnStream<'_>, InferenceError> {
        let report = self.begin(
            prompt,
            parse_control,
            max_new_tokens,
            self.defaults.clear_cache_between_turns,
        )?;
        Ok(TurnStream::new(self, report))
    }

    /// Renders the conversation plus a new user message as ChatML and
    /// streams the reply.
    ///
    /// The user message is added to `conversation` only once the prefill
    /// succeeded, so a failed send leaves the history untouched.
    pub fn send(
        &self,
        conversation: &mut Conversation,
        text: &str,
    ) -> Result<TurnStream<'_>, InferenceError> {
        let message = Message::user(text);
        let mut pending = conversation.clone();
        pending.push(message.clone());
        let prompt = pending.render(&ChatMlBuilder);

        let stream = self.stream_turn(
            &prompt,
            self.defaults.parse_special,
            self.defaults.max_new_tokens,
        )?;
        conversation.push(message);
        Ok(stream)
    }

    /// Clears the KV cache
    pub fn clear_cache(&self) -> Result<(), InferenceError> {
        self.request(|response_tx| WorkerCommand::ClearCache { response_tx })?
    }

    /// Runs the throughput benchmark on the loaded model
    pub fn benchmark(&self, params: BenchParams) -> Result<BenchReport, InferenceError> {
        self.request(|response_tx| WorkerCommand::Benchmark {
            params,
            response_tx,
        })?
    }

    /// Engine build and hardware details
    pub fn system_info(&self) -> Result<String, InferenceError> {
        self.request(|response_tx| WorkerCommand::SystemInfo { response_tx })
    }

    /// Frees the model and every handle tied to it
    pub fn unload(&self) -> Result<(), InferenceError> {
        self.request(|response_tx| WorkerCommand::Unload { response_tx })
    }
}

impl Drop for SessionWorker {
    fn drop(&mut self) {
        // Send shutdown command
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        // Wait for worker thread to finish
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Worker thread main loop
///
/// Builds the backend, then owns the session until shutdown.
fn worker_thread_main<B, F>(
    factory: F,
    options: SessionOptions,
    ready_tx: Sender<Result<(), InferenceError>>,
    command_rx: Receiver<WorkerCommand>,
) where
    B: InferenceBackend,
    F: FnOnce() -> Result<B, InferenceError>,
{
    let backend = match factory() {
        Ok(backend) => backend,
        Err(e) => {
            tracing::error!("Failed to init backend: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    let mut session = Session::new(backend, options);

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Load { path, response_tx }) => {
                let _ = response_tx.send(session.load(&path));
            }
            Ok(WorkerCommand::ReloadContext {
                threads,
                context_size,
                response_tx,
            }) => {
                let _ = response_tx.send(session.reload_context(threads, context_size));
            }
            Ok(WorkerCommand::BeginTurn {
                prompt,
                parse_control,
                max_new_tokens,
                clear_cache,
                response_tx,
            }) => {
                let result = begin_turn(&mut session, &prompt, parse_control, max_new_tokens, clear_cache);
                if let Err(e) = &result {
                    tracing::error!("Failed to begin turn: {}", e);
                }
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::Step {
                turn_id,
                response_tx,
            }) => {
                let result = match turn_id {
                    Some(id) => session.decode_step_for(id),
                    None => session.decode_step(),
                };
                match &result {
                    Err(e) => tracing::error!("Turn ended with failure: {}", e),
                    Ok(Step::EndOfStream(reason)) => {
                        tracing::debug!("Turn ended cleanly: {:?}", reason)
                    }
                    Ok(Step::Fragment(_)) => {}
                }
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::ClearCache { response_tx }) => {
                let _ = response_tx.send(session.clear_cache(true));
            }
            Ok(WorkerCommand::Benchmark {
                params,
                response_tx,
            }) => {
                let _ = response_tx.send(session.benchmark(&params));
            }
            Ok(WorkerCommand::SystemInfo { response_tx }) => {
                let _ = response_tx.send(session.backend().system_info());
            }
            Ok(WorkerCommand::Unload { response_tx }) => {
                session.unload();
                let _ = response_tx.send(());
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                // Channel closed, exit
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }

    session.unload();
}

fn begin_turn<B: InferenceBackend>(
    session: &mut Session<B>,
    prompt: &str,
    parse_control: bool,
    max_new_tokens: usize,
    clear_cache: bool,
) -> Result<PrefillReport, InferenceError> {
    if clear_cache {
        session.clear_cache(true)?;
    }
    session.prefill(prompt, parse_control, max_new_tokens)
}

/// Pull-based stream of one turn's text
///
/// Each call to `next` runs one decode step on the worker. Empty fragments
/// (bytes waiting for the rest of a character) are skipped. Dropping the
/// stream abandons the turn; tokens already decoded stay in the KV cache.
pub struct TurnStream<'a> {
    worker: &'a SessionWorker,
    report: PrefillReport,
    text: String,
    stop_reason: Option<StopReason>,
    done: bool,
}

impl<'a> TurnStream<'a> {
    fn new(worker: &'a SessionWorker, report: PrefillReport) -> Self {
        Self {
            worker,
            report,
            text: String::new(),
            stop_reason: None,
            done: false,
        }
    }

    /// What the prefill of this turn reported
    pub fn report(&self) -> &PrefillReport {
        &self.report
    }

    /// Text released so far
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Why the turn ended; `None` while running or after a failure
    pub fn stop_reason(&self) -> Option<&StopReason> {
        self.stop_reason.as_ref()
    }

    /// Drains the stream and returns the whole reply.
    pub fn collect_text(mut self) -> Result<String, InferenceError> {
        self.drain()?;
        Ok(self.text)
    }

    /// Drains the stream and appends the reply to `conversation`.
    pub fn finish_into(mut self, conversation: &mut Conversation) -> Result<String, InferenceError> {
        self.drain()?;
        conversation.push(Message::assistant(self.text.clone()));
        Ok(self.text)
    }

    fn drain(&mut self) -> Result<(), InferenceError> {
        for fragment in self.by_ref() {
            fragment?;
        }
        Ok(())
    }
}

impl Iterator for TurnStream<'_> {
    type Item = Result<String, InferenceError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.worker.step(Some(self.report.turn_id)) {
                Ok(Step::Fragment(fragment)) if fragment.is_empty() => continue,
                Ok(Step::Fragment(fragment)) => {
                    self.text.push_str(&fragment);
                    return Some(Ok(fragment));
                }
                Ok(Step::EndOfStream(reason)) => {
                    self.stop_reason = Some(reason);
                    self.done = true;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::mock::{ScriptedBackend, EOS, IM_END};
    use crate::inference::Token;

    fn worker_with(backend: ScriptedBackend) -> SessionWorker {
        SessionWorker::spawn(
            move || Ok(backend),
            SessionOptions::default(),
            TurnDefaults::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_stream_turn_to_end() {
        let worker = worker_with(ScriptedBackend::spelling("Hello, 世界", IM_END));
        worker.load_model("qwen.gguf").unwrap();

        let mut stream = worker.stream_turn("Hello", true, 512).unwrap();
        assert!(stream.report().prompt_tokens > 0);

        let fragments: Vec<String> = stream.by_ref().map(Result::unwrap).collect();
        assert!(fragments.iter().all(|f| !f.is_empty()));
        assert_eq!(fragments.concat(), "Hello, 世界");
        assert_eq!(stream.stop_reason(), Some(&StopReason::StopToken));
        assert_eq!(stream.next(), None);
    }

    #[test]
    fn test_step_before_begin_is_invalid() {
        let worker = worker_with(ScriptedBackend::new(vec![]));
        assert!(matches!(
            worker.step_turn(),
            Err(InferenceError::InvalidState { .. })
        ));
        worker.load_model("qwen.gguf").unwrap();
        assert!(matches!(
            worker.step_turn(),
            Err(InferenceError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_begin_and_step_directly() {
        let worker = worker_with(ScriptedBackend::spelling("ab", EOS));
        worker.load_model("qwen.gguf").unwrap();
        let report = worker.begin_turn("q", true, 16).unwrap();
        assert_eq!(report.prompt_tokens, 2);

        assert_eq!(worker.step_turn().unwrap(), Step::Fragment("a".to_string()));
        assert_eq!(worker.step_turn().unwrap(), Step::Fragment("b".to_string()));
        assert_eq!(
            worker.step_turn().unwrap(),
            Step::EndOfStream(StopReason::EndOfGeneration)
        );
    }

    #[test]
    fn test_abandoned_stream_then_new_turn() {
        let backend = ScriptedBackend::new(vec![]).with_filler(Token(b'x' as i32));
        let worker = worker_with(backend);
        worker.load_model("qwen.gguf").unwrap();

        let mut first = worker.stream_turn("one", true, 100).unwrap();
        assert_eq!(first.next().unwrap().unwrap(), "x");
        drop(first);

        let second = worker.stream_turn("two", true, 3).unwrap();
        assert_eq!(second.collect_text().unwrap(), "xxx");
    }

    #[test]
    fn test_replaced_turn_stream_fails() {
        let backend = ScriptedBackend::new(vec![]).with_filler(Token(b'x' as i32));
        let worker = worker_with(backend);
        worker.load_model("qwen.gguf").unwrap();

        let mut first = worker.stream_turn("one", true, 100).unwrap();
        worker.begin_turn("two", true, 100).unwrap();
        assert!(matches!(
            first.next(),
            Some(Err(InferenceError::InvalidState { .. }))
        ));
        assert_eq!(first.next(), None);
    }

    #[test]
    fn test_send_records_reply() {
        let worker = worker_with(ScriptedBackend::spelling("Hi!", IM_END));
        worker.load_model("qwen.gguf").unwrap();

        let mut conversation = Conversation::with_system_prompt("Be nice.");
        let reply = worker
            .send(&mut conversation, "Hello")
            .unwrap()
            .finish_into(&mut conversation)
            .unwrap();
        assert_eq!(reply, "Hi!");
        assert_eq!(conversation.messages().len(), 3);
        assert_eq!(conversation.messages()[2], Message::assistant("Hi!"));
    }

    #[test]
    fn test_factory_failure_surfaces() {
        let result = SessionWorker::spawn(
            || -> Result<ScriptedBackend, InferenceError> {
                Err(InferenceError::LoadFailed("no backend".to_string()))
            },
            SessionOptions::default(),
            TurnDefaults::default(),
        );
        assert!(matches!(result, Err(InferenceError::LoadFailed(_))));
    }

    #[test]
    fn test_load_unload_cycle() {
        let worker = worker_with(ScriptedBackend::new(vec![]));
        let summary = worker.load_model("qwen.gguf").unwrap();
        assert_eq!(summary.path, "qwen.gguf");
        assert!(matches!(
            worker.load_model("qwen.gguf"),
            Err(InferenceError::InvalidState { .. })
        ));

        worker.unload().unwrap();
        worker.unload().unwrap();
        worker.load_model("qwen.gguf").unwrap();
        worker.reload_context(Some(2), Some(2048)).unwrap();
        worker.clear_cache().unwrap();
        assert_eq!(worker.system_info().unwrap(), "mock backend");
    }

    #[test]
    fn test_benchmark_through_worker() {
        let worker = worker_with(ScriptedBackend::new(vec![]));
        worker.load_model("qwen.gguf").unwrap();
        let report = worker
            .benchmark(BenchParams {
                pp: 16,
                tg: 2,
                pl: 1,
                nr: 1,
            })
            .unwrap();
        assert_eq!(report.pp_std, 0.0);
    }

    #[test]
    fn test_failed_send_keeps_history() {
        let options = SessionOptions {
            reject_long_prompts: true,
            ..SessionOptions::default()
        };
        let defaults = TurnDefaults {
            max_new_tokens: 2000,
            ..TurnDefaults::default()
        };
        let worker = SessionWorker::spawn(
            || Ok(ScriptedBackend::spelling("Hi!", IM_END)),
            options,
            defaults,
        )
        .unwrap();
        worker.load_model("qwen.gguf").unwrap();

        let mut conversation = Conversation::new();
        assert!(matches!(
            worker.send(&mut conversation, "hello"),
            Err(InferenceError::PromptTooLong { .. })
        ));
        assert!(conversation.messages().is_empty());
    }
}
