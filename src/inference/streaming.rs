//! Streaming inference support
//!
//! A single token's piece can end in the middle of a multi-byte character.
//! [`Utf8Accumulator`] holds such bytes back until they form complete text,
//! and [`Step`] is what one decode step hands to the caller.

/// Why a turn stopped producing text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The engine reported an end-of-generation token
    EndOfGeneration,
    /// The sampled token is in the stop-token set
    StopToken,
    /// A stop marker appeared in the decoded text
    StopMarker(String),
    /// The configured length ceiling was reached
    MaxLength,
    /// The KV cache has no room for another token
    ContextFull,
    /// The turn was cut short by a cache clear or context reload
    Interrupted,
}

/// Result of one decode step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Newly released text; empty while a character is still incomplete
    Fragment(String),
    /// The turn is over
    EndOfStream(StopReason),
}

impl Step {
    /// Returns true if this is a fragment
    pub fn is_fragment(&self) -> bool {
        matches!(self, Step::Fragment(_))
    }

    /// Returns true if the turn is over
    pub fn is_end(&self) -> bool {
        matches!(self, Step::EndOfStream(_))
    }

    /// Extracts the fragment text if this is a Fragment variant
    pub fn as_fragment(&self) -> Option<&str> {
        match self {
            Step::Fragment(s) => Some(s),
            _ => None,
        }
    }
}

/// Outcome of scanning a byte buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Utf8Scan {
    /// Every character is complete
    Complete,
    /// The buffer ends inside a character that later bytes may finish
    Incomplete,
    /// A byte can never be part of valid text at this position
    Malformed,
}

/// Classifies `bytes` by lead-byte pattern.
///
/// Each lead byte announces 1, 2, 3 or 4 bytes and must be followed by that
/// many `10xxxxxx` continuation bytes. Running out of bytes while a
/// character is open is `Incomplete`; anything else out of place is
/// `Malformed`.
pub fn scan_utf8(bytes: &[u8]) -> Utf8Scan {
    let mut i = 0;
    while i < bytes.len() {
        let lead = bytes[i];
        let width = if lead & 0x80 == 0x00 {
            1
        } else if lead & 0xE0 == 0xC0 {
            2
        } else if lead & 0xF0 == 0xE0 {
            3
        } else if lead & 0xF8 == 0xF0 {
            4
        } else {
            return Utf8Scan::Malformed;
        };

        i += 1;
        for _ in 1..width {
            match bytes.get(i) {
                None => return Utf8Scan::Incomplete,
                Some(b) if b & 0xC0 != 0x80 => return Utf8Scan::Malformed,
                Some(_) => i += 1,
            }
        }
    }
    Utf8Scan::Complete
}

/// Strict check: true only when every character in `bytes` is complete.
pub fn is_valid_utf8(bytes: &[u8]) -> bool {
    scan_utf8(bytes) == Utf8Scan::Complete
}

/// Buffers token pieces until they form complete text
#[derive(Debug, Default)]
pub struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one piece and returns the text that may be released now.
    ///
    /// The whole pending buffer is released at once or not at all: an
    /// unfinished trailing character holds back the complete text before it
    /// as well.
    ///
    /// Malformed input is not held. A buffer that can never become valid is
    /// released with U+FFFD replacements and cleared, instead of being kept
    /// behind an empty fragment where it would stall every later piece.
    pub fn push(&mut self, piece: &[u8]) -> String {
        self.pending.extend_from_slice(piece);

        match scan_utf8(&self.pending) {
            Utf8Scan::Complete => {
                let bytes = std::mem::take(&mut self.pending);
                match String::from_utf8(bytes) {
                    Ok(s) => s,
                    // Lead-byte shape is fine but the encoding is not
                    // (overlong or surrogate); release it anyway.
                    Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
                }
            }
            Utf8Scan::Incomplete => String::new(),
            Utf8Scan::Malformed => {
                tracing::debug!(
                    "Releasing {} malformed bytes with replacement characters",
                    self.pending.len()
                );
                let bytes = std::mem::take(&mut self.pending);
                String::from_utf8_lossy(&bytes).into_owned()
            }
        }
    }

    /// Bytes still waiting for the rest of their character.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }
}
