//! Score pass
//!
//! ```text
//!   logit[b, h, s, t] = alpha * q[b, h, s] . k[b, kv(h), t]   visible
//!                     = filter_value                           padded
//!                     = -inf                                   future / t >= valid
//!   probs[b, h, s, t] = softmax(logit[b, h, s, :] + attention_bias[b|0, h, s, :])
//! ```
//!
//! Key positions at or beyond a batch entry's valid length, and keys hidden
//! by causality, score `-inf` and receive exactly zero probability.
//! One task per `(b, h)` pair; the key cache is only read here.

use crate::cache::KvReader;
use crate::ops::mask::KeyState;
use crate::ops::softmax_row;
use crate::parallel::{TensorOpCost, ThreadPool};
use crate::tensor::{Element, TensorView};

pub(crate) struct ScoreInputs<'a, T> {
    /// `[B, N, S, H]`
    pub(crate) q: &'a [f32],
    pub(crate) keys: KvReader<'a, T>,
    /// `[B, S, T]`
    pub(crate) mask: Option<&'a [KeyState]>,
    /// `[B, N or 1, S, T]`
    pub(crate) attention_bias: Option<TensorView<'a, T>>,
    /// Readable key positions per batch entry.
    pub(crate) kv_len: &'a [usize],
}

/// Shape of one score computation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScoreDims {
    pub(crate) num_heads: usize,
    pub(crate) seq_len: usize,
    pub(crate) total_len: usize,
    pub(crate) head_size: usize,
    pub(crate) alpha: f32,
    /// Logit substituted for padded keys.
    pub(crate) filter_value: f32,
}

/// Fills `probs` `[B, N, S, T]` with scaled, masked logits.
pub(crate) fn compute_scores<T: Element>(
    probs: &mut [f32],
    inputs: &ScoreInputs<'_, T>,
    dims: ScoreDims,
    pool: &ThreadPool,
) {
    let ScoreDims {
        num_heads,
        seq_len,
        total_len,
        head_size,
        alpha,
        filter_value,
    } = dims;
    let chunk = seq_len * total_len;
    let elem = std::mem::size_of::<T>();
    let mut cost = TensorOpCost {
        compute_cycles: (2 * seq_len * head_size * total_len) as f64,
        bytes_loaded: ((seq_len * 4 + total_len * elem) * head_size) as f64,
        bytes_stored: (chunk * 4) as f64,
    };
    if inputs.mask.is_some() {
        cost.bytes_loaded += (chunk * std::mem::size_of::<KeyState>()) as f64;
    }

    pool.parallel_for_chunks_mut(probs, chunk, &cost, |i, out| {
        let (b, h) = (i / num_heads, i % num_heads);
        let valid = inputs.kv_len[b].min(total_len);
        let bias = inputs.attention_bias.and_then(|bias| {
            let bb = if bias.dim(0) == 1 { 0 } else { b };
            bias.sub(&[bb, h])
        });

        for (s, row) in out.chunks_mut(total_len).enumerate() {
            let q_start = (i * seq_len + s) * head_size;
            let q = &inputs.q[q_start..q_start + head_size];
            let states = inputs
                .mask
                .map(|mask| &mask[(b * seq_len + s) * total_len..][..total_len]);
            for (t, score) in row[..valid].iter_mut().enumerate() {
                *score = match states.map_or(KeyState::Visible, |m| m[t]) {
                    KeyState::Visible => alpha * T::dot_f32(q, inputs.keys.row(b, h, t)),
                    KeyState::Filtered => filter_value,
                    KeyState::Excluded => f32::NEG_INFINITY,
                };
            }
            row[valid..].fill(f32::NEG_INFINITY);

            if let Some(bias) = bias {
                let r = &bias[s * total_len..(s + 1) * total_len];
                for (x, &bv) in row[..valid].iter_mut().zip(r) {
                    *x += bv.to_f32();
                }
            }
        }
    });
}

/// Turns logits into probabilities. Rows flagged in `fully_masked`
/// (`[B, S]`) become zero.
pub(crate) fn normalize(
    probs: &mut [f32],
    fully_masked: Option<&[bool]>,
    num_heads: usize,
    seq_len: usize,
    total_len: usize,
    pool: &ThreadPool,
) {
    let cost = TensorOpCost {
        bytes_loaded: (total_len * 4) as f64,
        bytes_stored: (total_len * 4) as f64,
        compute_cycles: (total_len * 7) as f64,
    };
    pool.parallel_for_chunks_mut(probs, total_len, &cost, |row_idx, row| {
        let b = row_idx / (num_heads * seq_len);
        let s = row_idx % seq_len;
        if fully_masked.is_some_and(|dead| dead[b * seq_len + s]) {
            row.fill(0.0);
        } else {
            softmax_row(row);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    #[test]
    fn test_grouped_heads_score_identically_for_equal_queries() {
        // B=1, N=2 sharing one kv head, S=1, T=3, H=2
        let cache = Tensor::from_vec(vec![1.0f32, 0.0, 0.0, 1.0, 1.0, 1.0], &[1, 1, 3, 2]).unwrap();
        let q = [0.5f32, 2.0, 0.5, 2.0];
        let inputs = ScoreInputs {
            q: &q,
            keys: KvReader::new(cache.view(), 2, None),
            mask: None,
            attention_bias: None,
            kv_len: &[3],
        };
        let dims = ScoreDims {
            num_heads: 2,
            seq_len: 1,
            total_len: 3,
            head_size: 2,
            alpha: 1.0,
            filter_value: -10000.0,
        };
        let mut probs = vec![0.0; 6];
        compute_scores(&mut probs, &inputs, dims, &ThreadPool::sequential());
        assert_eq!(&probs[..3], &[0.5, 2.0, 2.5]);
        assert_eq!(probs[..3], probs[3..]);
    }

    #[test]
    fn test_positions_past_valid_length_score_neg_inf() {
        let cache = Tensor::full(&[1, 1, 4, 1], 1.0f32).unwrap();
        let inputs = ScoreInputs {
            q: &[1.0],
            keys: KvReader::new(cache.view(), 1, None),
            mask: None,
            attention_bias: None,
            kv_len: &[2],
        };
        let dims = ScoreDims {
            num_heads: 1,
            seq_len: 1,
            total_len: 4,
            head_size: 1,
            alpha: 0.5,
            filter_value: -10000.0,
        };
        let mut probs = vec![0.0; 4];
        compute_scores(&mut probs, &inputs, dims, &ThreadPool::sequential());
        assert_eq!(&probs[..2], &[0.5, 0.5]);
        assert!(probs[2..].iter().all(|&x| x == f32::NEG_INFINITY));

        normalize(&mut probs, None, 1, 1, 4, &ThreadPool::sequential());
        assert_eq!(probs, [0.5, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_fully_masked_rows_are_zero() {
        let mut probs = vec![1.0f32, 2.0, 3.0, 4.0];
        normalize(&mut probs, Some(&[true, false]), 1, 2, 2, &ThreadPool::sequential());
        assert_eq!(&probs[..2], &[0.0, 0.0]);
        assert!((probs[2] + probs[3] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_masked_keys_ignore_large_logits() {
        // key 1 would dominate if its score leaked through the mask
        let cache = Tensor::from_vec(vec![0.0f32, 20000.0], &[1, 1, 2, 1]).unwrap();
        let dims = ScoreDims {
            num_heads: 1,
            seq_len: 1,
            total_len: 2,
            head_size: 1,
            alpha: 1.0,
            filter_value: -10000.0,
        };
        for (state, logit) in [(KeyState::Excluded, f32::NEG_INFINITY), (KeyState::Filtered, -10000.0)] {
            let mask = [KeyState::Visible, state];
            let inputs = ScoreInputs {
                q: &[1.0],
                keys: KvReader::new(cache.view(), 1, None),
                mask: Some(&mask[..]),
                attention_bias: None,
                kv_len: &[2],
            };
            let mut probs = vec![0.0; 2];
            compute_scores(&mut probs, &inputs, dims, &ThreadPool::sequential());
            assert_eq!(probs, [0.0, logit]);

            normalize(&mut probs, Some(&[false][..]), 1, 1, 2, &ThreadPool::sequential());
            assert_eq!(probs, [1.0, 0.0]);
        }
    }
}
