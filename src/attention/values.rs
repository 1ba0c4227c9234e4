//! Value pass
//!
//! ```text
//!   tmp[b, h, s, :]  = sum_t probs[b, h, s, t] * v[b, kv(h), t, :]
//!   out[b, s, h*Hv..] = tmp[b, h, s, :]
//! ```
//!
//! The first loop runs one task per `(b, h)`; the transpose runs one task
//! per output token, so each writes a disjoint region.

use crate::cache::KvReader;
use crate::parallel::{TensorOpCost, ThreadPool};
use crate::tensor::Element;

#[derive(Debug, Clone, Copy)]
pub(crate) struct ValueDims {
    pub(crate) num_heads: usize,
    pub(crate) seq_len: usize,
    pub(crate) total_len: usize,
    pub(crate) v_head_size: usize,
}

/// `tmp` `[B, N, S, Hv]` = `probs` `[B, N, S, T]` x values.
pub(crate) fn weighted_values<T: Element>(
    tmp: &mut [f32],
    probs: &[f32],
    values: &KvReader<'_, T>,
    kv_len: &[usize],
    dims: ValueDims,
    pool: &ThreadPool,
) {
    let ValueDims {
        num_heads,
        seq_len,
        total_len,
        v_head_size,
    } = dims;
    let chunk = seq_len * v_head_size;
    let cost = TensorOpCost {
        compute_cycles: (2 * seq_len * v_head_size * total_len) as f64,
        bytes_loaded: ((seq_len * 4 + v_head_size * std::mem::size_of::<T>()) * total_len) as f64,
        bytes_stored: (chunk * 4) as f64,
    };

    pool.parallel_for_chunks_mut(tmp, chunk, &cost, |i, out| {
        let b = i / num_heads;
        let h = i % num_heads;
        let valid = kv_len[b].min(total_len);
        for (s, acc) in out.chunks_mut(v_head_size).enumerate() {
            acc.fill(0.0);
            let p = &probs[(i * seq_len + s) * total_len..][..valid];
            for (t, &w) in p.iter().enumerate() {
                if w != 0.0 {
                    T::axpy_f32(acc, w, values.row(b, h, t));
                }
            }
        }
    });
}

/// Transposes `tmp` `[B, N, S, Hv]` into `output` `[B, S, N * Hv]`.
pub(crate) fn transpose_heads<T: Element>(
    output: &mut [T],
    tmp: &[f32],
    dims: ValueDims,
    pool: &ThreadPool,
) {
    let ValueDims {
        num_heads,
        seq_len,
        v_head_size,
        ..
    } = dims;
    let row_len = num_heads * v_head_size;
    let cost = TensorOpCost {
        bytes_loaded: (row_len * 4) as f64,
        bytes_stored: (row_len * std::mem::size_of::<T>()) as f64,
        compute_cycles: row_len as f64,
    };
    pool.parallel_for_chunks_mut(output, row_len, &cost, |row_idx, dst| {
        let (b, s) = (row_idx / seq_len, row_idx % seq_len);
        for (h, head) in dst.chunks_mut(v_head_size).enumerate() {
            let src = ((b * num_heads + h) * seq_len + s) * v_head_size;
            T::narrow_into(head, &tmp[src..src + v_head_size]);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    #[test]
    fn test_weighted_sum_and_transpose() {
        // B=1, N=2 (own kv heads), S=1, T=2, Hv=2
        let cache = Tensor::from_vec(
            vec![1.0f32, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0],
            &[1, 2, 2, 2],
        )
        .unwrap();
        let reader = KvReader::new(cache.view(), 1, None);
        let probs = [0.25f32, 0.75, 1.0, 0.0];
        let dims = ValueDims {
            num_heads: 2,
            seq_len: 1,
            total_len: 2,
            v_head_size: 2,
        };
        let mut tmp = vec![f32::NAN; 4];
        weighted_values(&mut tmp, &probs, &reader, &[2], dims, &ThreadPool::sequential());
        assert_eq!(tmp, [2.5, 3.5, 10.0, 20.0]);

        let mut out = vec![0.0f32; 4];
        transpose_heads(&mut out, &tmp, dims, &ThreadPool::sequential());
        assert_eq!(out, [2.5, 3.5, 10.0, 20.0]);
    }

    #[test]
    fn test_transpose_interleaves_tokens() {
        // B=1, N=2, S=2, Hv=1: tmp = [h0s0, h0s1, h1s0, h1s1]
        let tmp = [1.0f32, 2.0, 3.0, 4.0];
        let dims = ValueDims {
            num_heads: 2,
            seq_len: 2,
            total_len: 1,
            v_head_size: 1,
        };
        let mut out = vec![half::f16::ZERO; 4];
        transpose_heads(&mut out, &tmp, dims, &ThreadPool::sequential());
        let out: Vec<f32> = out.iter().map(|x| x.to_f32()).collect();
        assert_eq!(out, [1.0, 3.0, 2.0, 4.0]);
    }
}
