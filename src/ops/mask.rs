//! Attention mask construction
//!
//! Key padding masks and causal masking are merged into one `(B, S, T)` map of
//! [`KeyState`]. Causally hidden keys are excluded outright and score `-inf`.
//! Padded keys have their logit replaced by `mask_filter_value`. Rows with no
//! visible key are flagged so the score engine emits a zero probability row
//! instead of a uniform one.

use crate::params::MaskType;
use crate::tensor::TensorView;

/// How one key position is seen by one query row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum KeyState {
    #[default]
    Visible,
    /// Hidden by causality; scores `-inf`.
    Excluded,
    /// Hidden by a padding mask; scores `mask_filter_value`.
    Filtered,
}

pub(crate) struct AttentionMask<'m> {
    padding: Option<(MaskType, TensorView<'m, i32>)>,
    /// Per-batch past length; position `t` is hidden from query `s` when
    /// `t > past[b] + s`.
    causal: Option<&'m [usize]>,
    batch_size: usize,
    sequence_length: usize,
    total_sequence_length: usize,
    past_sequence_length: usize,
}

impl<'m> AttentionMask<'m> {
    pub(crate) fn new(
        batch_size: usize,
        sequence_length: usize,
        past_sequence_length: usize,
        total_sequence_length: usize,
    ) -> Self {
        Self {
            padding: None,
            causal: None,
            batch_size,
            sequence_length,
            total_sequence_length,
            past_sequence_length,
        }
    }

    pub(crate) fn with_padding(mut self, mask_type: MaskType, mask: Option<TensorView<'m, i32>>) -> Self {
        self.padding = mask.filter(|_| mask_type != MaskType::None).map(|m| (mask_type, m));
        self
    }

    pub(crate) fn with_causal(mut self, past_per_batch: &'m [usize]) -> Self {
        self.causal = Some(past_per_batch);
        self
    }

    pub(crate) fn is_active(&self) -> bool {
        self.padding.is_some() || self.causal.is_some()
    }

    #[inline]
    fn is_future(&self, b: usize, s: usize, t: usize) -> bool {
        self.causal.is_some_and(|past| t > past[b] + s)
    }

    #[inline]
    fn is_padded(&self, b: usize, s: usize, t: usize) -> bool {
        let Some((mask_type, mask)) = &self.padding else {
            return false;
        };
        let data = mask.as_slice();
        let total = self.total_sequence_length;
        match mask_type {
            MaskType::None => false,
            MaskType::KeySeqLen => t >= data[b].max(0) as usize,
            MaskType::KeySeqLenStart => {
                let end = data[b].max(0) as usize;
                let start = data[b + self.batch_size].max(0) as usize;
                t >= end || t < start
            }
            MaskType::KeyPadding2d => {
                let width = mask.dim(1);
                if width == total {
                    data[b * width + t] == 0
                } else if t < self.past_sequence_length {
                    // (B, L) covers only the new keys
                    false
                } else {
                    data[b * width + t - self.past_sequence_length] == 0
                }
            }
            MaskType::Attention3d => data[(b * self.sequence_length + s) * total + t] == 0,
        }
    }

    /// Fills `states` `(B, S, T)` and sets `fully_masked[b * S + s]` for rows
    /// with no visible key. Causal exclusion wins over padding.
    pub(crate) fn fill(&self, states: &mut [KeyState], fully_masked: &mut [bool]) {
        let (s_len, t_len) = (self.sequence_length, self.total_sequence_length);
        debug_assert_eq!(states.len(), self.batch_size * s_len * t_len);
        debug_assert_eq!(fully_masked.len(), self.batch_size * s_len);

        for (row_idx, (row, dead)) in states
            .chunks_mut(t_len.max(1))
            .zip(fully_masked.iter_mut())
            .enumerate()
        {
            let (b, s) = (row_idx / s_len, row_idx % s_len);
            for (t, state) in row.iter_mut().enumerate() {
                *state = if self.is_future(b, s, t) {
                    KeyState::Excluded
                } else if self.is_padded(b, s, t) {
                    KeyState::Filtered
                } else {
                    KeyState::Visible
                };
            }
            *dead = !row.contains(&KeyState::Visible);
        }
    }
}
