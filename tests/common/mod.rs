//! Shared helpers for the operator integration tests.
#![allow(dead_code)]

use kvattn::Tensor;

/// Deterministic pseudo-random data using a sin-based pattern.
pub fn det_data(n: usize, seed: f32) -> Vec<f32> {
    (0..n).map(|i| ((i as f32 + seed) * 0.37).sin() * 0.5).collect()
}

pub fn det_tensor(shape: &[usize], seed: f32) -> Tensor<f32> {
    let n = shape.iter().product();
    Tensor::from_vec(det_data(n, seed), shape).unwrap()
}

pub fn i32_tensor(data: &[i32], shape: &[usize]) -> Tensor<i32> {
    Tensor::from_slice(data, shape).unwrap()
}

/// Shape of a reference attention computation.
#[derive(Debug, Clone, Copy)]
pub struct RefDims {
    pub batch: usize,
    /// query tokens
    pub seq: usize,
    /// key tokens, past included
    pub total: usize,
    pub heads: usize,
    pub kv_heads: usize,
    pub head_size: usize,
    pub v_head_size: usize,
    pub causal: bool,
}

/// Naive attention over token-major buffers.
///
/// `q` is `(B, S, N * H)`, `k` is `(B, T, N_kv * H)`, `v` is
/// `(B, T, N_kv * Hv)`. `visible(b, s, t)` hides extra key positions. The
/// result is `(B, S, N * Hv)`.
pub fn reference_attention(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    d: RefDims,
    visible: impl Fn(usize, usize, usize) -> bool,
) -> Vec<f32> {
    let scale = (d.head_size as f32).sqrt().recip();
    let group = d.heads / d.kv_heads;
    let past = d.total - d.seq;
    let mut out = vec![0.0f32; d.batch * d.seq * d.heads * d.v_head_size];

    for b in 0..d.batch {
        for n in 0..d.heads {
            let kv = n / group;
            for s in 0..d.seq {
                let q_row = &q[(b * d.seq + s) * d.heads * d.head_size + n * d.head_size..][..d.head_size];
                let keys: Vec<usize> = (0..d.total)
                    .filter(|&t| (!d.causal || t <= past + s) && visible(b, s, t))
                    .collect();
                if keys.is_empty() {
                    continue;
                }
                let scores: Vec<f32> = keys
                    .iter()
                    .map(|&t| {
                        let k_row =
                            &k[(b * d.total + t) * d.kv_heads * d.head_size + kv * d.head_size..][..d.head_size];
                        scale * q_row.iter().zip(k_row).map(|(a, b)| a * b).sum::<f32>()
                    })
                    .collect();
                let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let exps: Vec<f32> = scores.iter().map(|x| (x - max).exp()).collect();
                let sum: f32 = exps.iter().sum();

                let dst = &mut out[(b * d.seq + s) * d.heads * d.v_head_size + n * d.v_head_size..][..d.v_head_size];
                for (&t, e) in keys.iter().zip(&exps) {
                    let v_row =
                        &v[(b * d.total + t) * d.kv_heads * d.v_head_size + kv * d.v_head_size..][..d.v_head_size];
                    for (o, x) in dst.iter_mut().zip(v_row) {
                        *o += e / sum * x;
                    }
                }
            }
        }
    }
    out
}

/// Rows `[from, to)` of every batch entry of a token-major `(B, T, W)` buffer.
pub fn token_slice(data: &[f32], batch: usize, total: usize, width: usize, from: usize, to: usize) -> Vec<f32> {
    (0..batch)
        .flat_map(|b| data[(b * total + from) * width..(b * total + to) * width].iter().copied())
        .collect()
}

/// Token-major `(B, T, N * H)` rearranged into head-major `(B, N, T, H)`.
pub fn to_head_major(data: &[f32], batch: usize, total: usize, heads: usize, head_size: usize) -> Vec<f32> {
    let mut out = vec![0.0; data.len()];
    for b in 0..batch {
        for t in 0..total {
            for n in 0..heads {
                let src = ((b * total + t) * heads + n) * head_size;
                let dst = ((b * heads + n) * total + t) * head_size;
                out[dst..dst + head_size].copy_from_slice(&data[src..src + head_size]);
            }
        }
    }
    out
}

pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "length mismatch");
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}
