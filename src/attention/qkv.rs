//! Q/K/V preparation
//!
//! Every accepted input layout is gathered into head-major `f32` scratch:
//!
//! ```text
//!   q: [B, N,    S, H]
//!   k: [B, N_kv, L, H]
//!   v: [B, N_kv, L, Hv]
//! ```
//!
//! The optional `(D + D + Dv)` bias is added on the way.

use crate::error::{Error, Result};
use crate::memory::{Scratch, ScratchAllocator};
use crate::parallel::{TensorOpCost, ThreadPool};
use crate::params::{AttentionKind, AttentionParameters, QkvFormat};
use crate::tensor::{Element, TensorView};

/// Where head `n` of token `(b, s)` starts inside a source buffer.
#[derive(Clone, Copy)]
struct HeadSource<'a, T> {
    data: &'a [T],
    batch_stride: usize,
    seq_stride: usize,
    head_stride: usize,
    offset: usize,
}

impl<'a, T: Copy> HeadSource<'a, T> {
    /// Token-major source `(B, S, W)` whose heads start at column `column`.
    fn token_major(view: &TensorView<'a, T>, column: usize, head_size: usize) -> Self {
        let strides = view.layout().strides();
        Self {
            data: view.as_slice(),
            batch_stride: strides[0],
            seq_stride: strides[1],
            head_stride: head_size,
            offset: column,
        }
    }

    /// Head-major source `(B, N, L, H)`.
    fn head_major(view: &TensorView<'a, T>) -> Self {
        let strides = view.layout().strides();
        Self {
            data: view.as_slice(),
            batch_stride: strides[0],
            seq_stride: strides[2],
            head_stride: strides[1],
            offset: 0,
        }
    }

    /// Packed `(B, S, N, k, H)` source, selecting slot `slot` of the `k` axis.
    fn packed(view: &TensorView<'a, T>, slot: usize) -> Self {
        let strides = view.layout().strides();
        Self {
            data: view.as_slice(),
            batch_stride: strides[0],
            seq_stride: strides[1],
            head_stride: strides[2],
            offset: slot * strides[3],
        }
    }

    #[inline]
    fn row(&self, b: usize, s: usize, n: usize, len: usize) -> &'a [T] {
        let start = self.offset + b * self.batch_stride + s * self.seq_stride + n * self.head_stride;
        &self.data[start..start + len]
    }
}

/// Gathered Q, K and V scratch.
pub(crate) struct PreparedQkv<'s> {
    pub(crate) q: Scratch<'s, f32>,
    pub(crate) k: Scratch<'s, f32>,
    pub(crate) v: Scratch<'s, f32>,
}

struct Sources<'a, T> {
    q: HeadSource<'a, T>,
    k: HeadSource<'a, T>,
    v: HeadSource<'a, T>,
}

fn missing(arg: &'static str) -> Error {
    Error::invalid(arg, "required by the validated layout")
}

fn resolve_sources<'a, T: Copy>(
    query: &TensorView<'a, T>,
    key: Option<&TensorView<'a, T>>,
    value: Option<&TensorView<'a, T>>,
    params: &AttentionParameters,
) -> Result<Sources<'a, T>> {
    let (d, h) = (params.hidden_size, params.head_size);
    let q = HeadSource::token_major(query, 0, h);

    if params.kind == AttentionKind::GroupQuery && params.is_packed_qkv {
        let kv_hidden = params.kv_num_heads * h;
        return Ok(Sources {
            q,
            k: HeadSource::token_major(query, d, h),
            v: HeadSource::token_major(query, d + kv_hidden, h),
        });
    }

    let sources = match params.qkv_format {
        QkvFormat::SeparateBsnh => Sources {
            q,
            k: HeadSource::token_major(key.ok_or_else(|| missing("key"))?, 0, h),
            v: HeadSource::token_major(value.ok_or_else(|| missing("value"))?, 0, params.v_head_size),
        },
        QkvFormat::CrossBnsh => Sources {
            q,
            k: HeadSource::head_major(key.ok_or_else(|| missing("key"))?),
            v: HeadSource::head_major(value.ok_or_else(|| missing("value"))?),
        },
        QkvFormat::PackedKv => {
            let kv = key.ok_or_else(|| missing("key"))?;
            Sources {
                q,
                k: HeadSource::packed(kv, 0),
                v: HeadSource::packed(kv, 1),
            }
        }
        QkvFormat::PackedQkv => Sources {
            q: HeadSource::packed(query, 0),
            k: HeadSource::packed(query, 1),
            v: HeadSource::packed(query, 2),
        },
        QkvFormat::PackedQkvBs3nh => Sources {
            q,
            k: HeadSource::token_major(query, d, h),
            v: HeadSource::token_major(query, 2 * d, h),
        },
    };
    Ok(sources)
}

/// Copies `src` into `[B, heads, len, head_size]` f32 `out`, adding `bias`
/// (`heads * head_size` long) to every token.
fn gather<T: Element>(
    src: HeadSource<'_, T>,
    bias: Option<&[T]>,
    (heads, len, head_size): (usize, usize, usize),
    out: &mut [f32],
    pool: &ThreadPool,
) {
    let chunk = len * head_size;
    let bytes = (chunk * std::mem::size_of::<T>()) as f64;
    let cost = TensorOpCost {
        bytes_loaded: bytes,
        bytes_stored: (chunk * 4) as f64,
        compute_cycles: chunk as f64,
    };
    pool.parallel_for_chunks_mut(out, chunk, &cost, |i, dst| {
        let (b, n) = (i / heads, i % heads);
        let bias = bias.map(|bias| &bias[n * head_size..(n + 1) * head_size]);
        for (s, row) in dst.chunks_mut(head_size).enumerate() {
            T::widen_into(row, src.row(b, s, n, head_size));
            if let Some(bias) = bias {
                for (x, &bv) in row.iter_mut().zip(bias) {
                    *x += bv.to_f32();
                }
            }
        }
    });
}

/// Gathers Q, K and V for one call into scratch taken from `allocator`.
pub(crate) fn prepare_qkv<'s, T: Element>(
    query: &TensorView<'_, T>,
    key: Option<&TensorView<'_, T>>,
    value: Option<&TensorView<'_, T>>,
    bias: Option<&TensorView<'_, T>>,
    params: &AttentionParameters,
    allocator: &'s dyn ScratchAllocator,
    pool: &ThreadPool,
) -> Result<PreparedQkv<'s>> {
    let sources = resolve_sources(query, key, value, params)?;
    let (b, n, n_kv) = (params.batch_size, params.num_heads, params.kv_num_heads);
    let (s, l) = (params.sequence_length, params.kv_sequence_length);
    let (h, hv) = (params.head_size, params.v_head_size);

    let mut q = Scratch::<f32>::zeroed(allocator, b * n * s * h, "query")?;
    let mut k = Scratch::<f32>::zeroed(allocator, b * n_kv * l * h, "key")?;
    let mut v = Scratch::<f32>::zeroed(allocator, b * n_kv * l * hv, "value")?;

    let bias = bias.map(|t| t.as_slice());
    let d = params.hidden_size;
    let (q_bias, kv_bias) = match bias {
        // key/value given per head are already projected
        Some(bias) if params.qkv_format == QkvFormat::CrossBnsh => (Some(&bias[..d]), None),
        Some(bias) => (Some(&bias[..d]), Some((&bias[d..2 * d], &bias[2 * d..]))),
        None => (None, None),
    };

    gather(sources.q, q_bias, (n, s, h), &mut q, pool);
    gather(sources.k, kv_bias.map(|(kb, _)| kb), (n_kv, l, h), &mut k, pool);
    gather(sources.v, kv_bias.map(|(_, vb)| vb), (n_kv, l, hv), &mut v, pool);

    Ok(PreparedQkv { q, k, v })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttentionConfig;
    use crate::memory::CpuScratchAllocator;
    use crate::params::{AttentionInputs, check_inputs};
    use crate::tensor::Tensor;

    fn params_for(inputs: &AttentionInputs<'_, f32>, heads: usize, kind: AttentionKind) -> AttentionParameters {
        check_inputs(inputs, None, None, &AttentionConfig::new(heads), kind).unwrap()
    }

    #[test]
    fn test_separate_layout_splits_heads() {
        // B=1, S=2, N=2, H=2
        let q = Tensor::from_vec((0..8).map(|x| x as f32).collect(), &[1, 2, 4]).unwrap();
        let k = Tensor::from_vec((10..18).map(|x| x as f32).collect(), &[1, 2, 4]).unwrap();
        let inputs = AttentionInputs::new(q.view()).with_key_value(k.view(), Some(k.view()));
        let params = params_for(&inputs, 2, AttentionKind::MultiHead);
        let alloc = CpuScratchAllocator::new();
        let out = prepare_qkv(
            &inputs.query,
            inputs.key.as_ref(),
            inputs.value.as_ref(),
            None,
            &params,
            &alloc,
            &ThreadPool::sequential(),
        )
        .unwrap();
        // head 0: tokens (0,1), (4,5); head 1: (2,3), (6,7)
        assert_eq!(&out.q[..], &[0.0, 1.0, 4.0, 5.0, 2.0, 3.0, 6.0, 7.0]);
        assert_eq!(&out.k[..4], &[10.0, 11.0, 14.0, 15.0]);
    }

    #[test]
    fn test_bs3nh_with_bias() {
        // B=1, S=1, N=1, H=2 -> query (1, 1, 6)
        let q = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[1, 1, 6]).unwrap();
        let bias = Tensor::from_vec(vec![0.5; 6], &[6]).unwrap();
        let inputs = AttentionInputs::new(q.view()).with_bias(bias.view());
        let params = params_for(&inputs, 1, AttentionKind::DecoderMasked);
        let alloc = CpuScratchAllocator::new();
        let out = prepare_qkv(
            &inputs.query,
            None,
            None,
            inputs.bias.as_ref(),
            &params,
            &alloc,
            &ThreadPool::sequential(),
        )
        .unwrap();
        assert_eq!(&out.q[..], &[1.5, 2.5]);
        assert_eq!(&out.k[..], &[3.5, 4.5]);
        assert_eq!(&out.v[..], &[5.5, 6.5]);
    }

    #[test]
    fn test_packed_qkv_bsn3h() {
        // B=1, S=1, N=2, 3, H=1
        let q = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[1, 1, 2, 3, 1]).unwrap();
        let inputs = AttentionInputs::new(q.view());
        let params = params_for(&inputs, 2, AttentionKind::MultiHead);
        let alloc = CpuScratchAllocator::new();
        let out = prepare_qkv(&inputs.query, None, None, None, &params, &alloc, &ThreadPool::sequential())
            .unwrap();
        assert_eq!(&out.q[..], &[1.0, 4.0]);
        assert_eq!(&out.k[..], &[2.0, 5.0]);
        assert_eq!(&out.v[..], &[3.0, 6.0]);
    }
}
