//! Decode batch buffer
//!
//! Capacity-bounded staging area for the tokens of one decode call. Storage
//! for every slot is reserved up front, so `add` never allocates and can
//! refuse writes past the end instead of growing.

use crate::inference::backend::{InferenceBackend, Token};
use crate::inference::InferenceError;

/// One staged token
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSlot {
    pub token: Token,
    /// Position of the token in its sequence
    pub pos: i32,
    /// Sequences this token belongs to
    pub seq_ids: Vec<i32>,
    /// Whether the engine should produce logits for this slot
    pub logits: bool,
}

/// Fixed-capacity token batch
#[derive(Debug)]
pub struct TokenBatch {
    slots: Vec<BatchSlot>,
    n_tokens: usize,
    n_seq_max: usize,
    embedding_width: usize,
    embeddings: Vec<f32>,
}

impl TokenBatch {
    /// Allocates a batch able to hold `capacity` tokens.
    ///
    /// When `embedding_width` is non-zero the batch also reserves
    /// `capacity * embedding_width` floats for embedding input. Every
    /// reservation is fallible; on failure whatever was already reserved is
    /// released before the error is returned.
    pub fn new(
        capacity: usize,
        embedding_width: usize,
        n_seq_max: usize,
    ) -> Result<Self, InferenceError> {
        if capacity == 0 {
            return Err(InferenceError::AllocationFailed(
                "batch with zero capacity".to_string(),
            ));
        }
        if n_seq_max == 0 {
            return Err(InferenceError::AllocationFailed(
                "batch with zero sequences per slot".to_string(),
            ));
        }

        let mut embeddings = Vec::new();
        if embedding_width > 0 {
            let len = capacity.checked_mul(embedding_width).ok_or_else(|| {
                InferenceError::AllocationFailed("batch embeddings (size overflow)".to_string())
            })?;
            embeddings
                .try_reserve_exact(len)
                .map_err(|e| InferenceError::AllocationFailed(format!("batch embeddings: {e}")))?;
            embeddings.resize(len, 0.0);
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|e| InferenceError::AllocationFailed(format!("batch slots: {e}")))?;

        for _ in 0..capacity {
            let mut seq_ids = Vec::new();
            seq_ids
                .try_reserve_exact(n_seq_max)
                .map_err(|e| InferenceError::AllocationFailed(format!("batch seq ids: {e}")))?;
            slots.push(BatchSlot {
                token: Token(0),
                pos: 0,
                seq_ids,
                logits: false,
            });
        }

        Ok(Self {
            slots,
            n_tokens: 0,
            n_seq_max,
            embedding_width,
            embeddings,
        })
    }

    /// Resets the batch to zero filled slots.
    pub fn clear(&mut self) {
        self.n_tokens = 0;
    }

    /// Appends one token.
    ///
    /// Fails with `CapacityExceeded` when every slot is already filled; the
    /// batch is left untouched in that case.
    pub fn add(
        &mut self,
        token: Token,
        pos: i32,
        seq_ids: &[i32],
        logits: bool,
    ) -> Result<(), InferenceError> {
        if self.n_tokens >= self.slots.len() {
            return Err(InferenceError::CapacityExceeded {
                capacity: self.slots.len(),
            });
        }
        if seq_ids.len() > self.n_seq_max {
            return Err(InferenceError::TooManySequences {
                max: self.n_seq_max,
                got: seq_ids.len(),
            });
        }

        let slot = &mut self.slots[self.n_tokens];
        slot.token = token;
        slot.pos = pos;
        slot.seq_ids.clear();
        slot.seq_ids.extend_from_slice(seq_ids);
        slot.logits = logits;

        self.n_tokens += 1;
        Ok(())
    }

    /// Sets the logits flag of an already filled slot.
    pub fn set_logits(&mut self, index: usize, logits: bool) -> Result<(), InferenceError> {
        if index >= self.n_tokens {
            return Err(InferenceError::CapacityExceeded {
                capacity: self.n_tokens,
            });
        }
        self.slots[index].logits = logits;
        Ok(())
    }

    /// True when the last filled slot asks for logits.
    pub fn last_wants_logits(&self) -> bool {
        self.filled().last().map(|slot| slot.logits).unwrap_or(false)
    }

    /// Runs one decode over the filled slots.
    ///
    /// Errors are reported as `DecodeFailed` and never retried here.
    pub fn submit<B: InferenceBackend>(
        &self,
        backend: &B,
        context: &mut B::Context,
    ) -> Result<(), InferenceError> {
        backend.decode(context, self).map_err(|e| match e {
            InferenceError::DecodeFailed(msg) => InferenceError::DecodeFailed(msg),
            other => InferenceError::DecodeFailed(other.to_string()),
        })
    }

    /// The filled slots in insertion order.
    pub fn filled(&self) -> &[BatchSlot] {
        &self.slots[..self.n_tokens]
    }

    pub fn len(&self) -> usize {
        self.n_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.n_tokens == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn n_seq_max(&self) -> usize {
        self.n_seq_max
    }

    pub fn embedding_width(&self) -> usize {
        self.embedding_width
    }

    /// Embedding input storage (empty for token batches).
    pub fn embeddings_mut(&mut self) -> &mut [f32] {
        &mut self.embeddings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_until_full() {
        for capacity in [1usize, 2, 7, 32] {
            let mut batch = TokenBatch::new(capacity, 0, 1).unwrap();
            for i in 0..capacity {
                batch.add(Token(i as i32), i as i32, &[0], false).unwrap();
            }

            let overflow = batch.add(Token(99), capacity as i32, &[0], true);
            assert_eq!(overflow, Err(InferenceError::CapacityExceeded { capacity }));
            assert_eq!(batch.len(), capacity);
            // The rejected write must not have touched the last slot
            assert_eq!(batch.filled()[capacity - 1].token, Token(capacity as i32 - 1));
            assert!(!batch.last_wants_logits());
        }
    }

    #[test]
    fn test_clear_reuses_slots() {
        let mut batch = TokenBatch::new(2, 0, 1).unwrap();
        batch.add(Token(1), 0, &[0], false).unwrap();
        batch.add(Token(2), 1, &[0], true).unwrap();
        assert!(batch.last_wants_logits());

        batch.clear();
        assert!(batch.is_empty());
        assert!(!batch.last_wants_logits());

        batch.add(Token(3), 5, &[0], true).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.filled()[0].pos, 5);
    }

    #[test]
    fn test_sequence_limit() {
        let mut batch = TokenBatch::new(4, 0, 2).unwrap();
        batch.add(Token(1), 0, &[0, 1], false).unwrap();
        assert_eq!(
            batch.add(Token(1), 1, &[0, 1, 2], false),
            Err(InferenceError::TooManySequences { max: 2, got: 3 })
        );
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_set_logits() {
        let mut batch = TokenBatch::new(3, 0, 1).unwrap();
        batch.add(Token(1), 0, &[0], false).unwrap();
        batch.add(Token(2), 1, &[0], false).unwrap();
        batch.set_logits(1, true).unwrap();
        assert!(batch.last_wants_logits());
        assert!(batch.set_logits(2, true).is_err());
    }

    #[test]
    fn test_invalid_allocation() {
        assert!(matches!(
            TokenBatch::new(0, 0, 1),
            Err(InferenceError::AllocationFailed(_))
        ));
        assert!(matches!(
            TokenBatch::new(8, 0, 0),
            Err(InferenceError::AllocationFailed(_))
        ));
        assert!(matches!(
            TokenBatch::new(usize::MAX, 2, 1),
            Err(InferenceError::AllocationFailed(_))
        ));
    }

    #[test]
    fn test_embedding_storage() {
        let mut batch = TokenBatch::new(4, 16, 1).unwrap();
        assert_eq!(batch.embedding_width(), 16);
        assert_eq!(batch.embeddings_mut().len(), 64);

        let mut tokens = TokenBatch::new(4, 0, 1).unwrap();
        assert!(tokens.embeddings_mut().is_empty());
    }
}
