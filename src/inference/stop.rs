//! Stop condition evaluation
//!
//! Two independent checks decide whether a turn must end early:
//! token-id membership in a set derived from the stop strings, and a literal
//! scan of the turn's decoded bytes for stop markers. The byte scan catches
//! markers whose text was split across token boundaries in ways that never
//! produce the marker's own token.

use std::collections::HashSet;

use once_cell::sync::OnceCell;

use crate::inference::backend::Token;
use crate::inference::InferenceError;

/// Stop strings tokenized into the stop-token set (ChatML / Qwen)
pub const DEFAULT_STOP_STRINGS: &[&str] = &["<|im_end|>", "<|endoftext|>"];

/// Literal markers searched for in decoded text
pub const DEFAULT_STOP_MARKERS: &[&str] = &["<|im_end|>"];

/// Stop-token set plus textual markers for one context
#[derive(Debug)]
pub struct StopConditions {
    stop_strings: Vec<String>,
    markers: Vec<String>,
    tokens: OnceCell<HashSet<Token>>,
    longest_marker: usize,
}

impl StopConditions {
    pub fn new(stop_strings: Vec<String>, markers: Vec<String>) -> Self {
        let markers: Vec<String> = markers.into_iter().filter(|m| !m.is_empty()).collect();
        let longest_marker = markers.iter().map(String::len).max().unwrap_or(0);
        Self {
            stop_strings,
            markers,
            tokens: OnceCell::new(),
            longest_marker,
        }
    }

    /// Builds the stop-token set once.
    ///
    /// Only the first caller runs `tokenize`; every other caller, concurrent
    /// or later, sees the set it produced. A tokenizer failure leaves the set
    /// uninitialized so a later call may try again.
    pub fn initialize<F>(&self, mut tokenize: F) -> Result<(), InferenceError>
    where
        F: FnMut(&str) -> Result<Vec<Token>, InferenceError>,
    {
        self.tokens
            .get_or_try_init(|| {
                let mut set = HashSet::new();
                for stop in &self.stop_strings {
                    let tokens = tokenize(stop)?;
                    if tokens.len() > 1 {
                        tracing::warn!(
                            "Stop string {:?} is not a single token ({} tokens); all of them will stop generation",
                            stop,
                            tokens.len()
                        );
                    }
                    tracing::info!("Stop string {:?} tokenized to {} tokens", stop, tokens.len());
                    set.extend(tokens);
                }
                tracing::info!("Initialized {} stop tokens total", set.len());
                Ok(set)
            })
            .map(|_| ())
    }

    pub fn is_initialized(&self) -> bool {
        self.tokens.get().is_some()
    }

    /// Membership check; false until initialized.
    pub fn is_stop_token(&self, token: Token) -> bool {
        self.tokens
            .get()
            .map(|set| set.contains(&token))
            .unwrap_or(false)
    }

    /// Snapshot of the stop-token set, if initialized.
    pub fn stop_tokens(&self) -> Option<&HashSet<Token>> {
        self.tokens.get()
    }

    /// Looks for a marker that the last `appended` bytes of `turn` could
    /// have completed.
    ///
    /// Earlier bytes were already scanned when they arrived, so only a window
    /// of `appended + longest_marker - 1` trailing bytes is searched.
    pub fn find_marker(&self, turn: &[u8], appended: usize) -> Option<&str> {
        if self.longest_marker == 0 || appended == 0 {
            return None;
        }
        let window = appended
            .saturating_add(self.longest_marker - 1)
            .min(turn.len());
        let tail = &turn[turn.len() - window..];

        self.markers
            .iter()
            .find(|marker| contains_bytes(tail, marker.as_bytes()))
            .map(String::as_str)
    }

    /// Length of the longest tail of `turn` that is the start of a marker
    /// but not a whole one. Those bytes may still turn into a marker.
    pub fn partial_marker_len(&self, turn: &[u8]) -> usize {
        self.markers
            .iter()
            .map(|marker| {
                let marker = marker.as_bytes();
                let longest = (marker.len() - 1).min(turn.len());
                (1..=longest)
                    .rev()
                    .find(|&k| turn.ends_with(&marker[..k]))
                    .unwrap_or(0)
            })
            .max()
            .unwrap_or(0)
    }

    /// Offset of the last occurrence of `marker` in `turn`.
    pub fn marker_start(turn: &[u8], marker: &str) -> Option<usize> {
        let marker = marker.as_bytes();
        if marker.is_empty() || marker.len() > turn.len() {
            return None;
        }
        turn.windows(marker.len()).rposition(|w| w == marker)
    }

    pub fn markers(&self) -> &[String] {
        &self.markers
    }
}

impl Default for StopConditions {
    fn default() -> Self {
        Self::new(
            DEFAULT_STOP_STRINGS.iter().map(|s| s.to_string()).collect(),
            DEFAULT_STOP_MARKERS.iter().map(|s| s.to_string()).collect(),
        )
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    needle.len() <= haystack.len() && haystack.windows(needle.len()).any(|w| w == needle)
}
