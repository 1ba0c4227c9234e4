//! MultiHeadAttention front-end
//!
//! Also hosts the shared driver used by the decode-step operator: both
//! validate with [`check_inputs`] and differ only in the accepted layouts and
//! the beam-search extras.

use std::sync::Arc;

use tracing::debug;

use super::apply::{AttentionPlan, apply_attention};
use super::qkv::prepare_qkv;
use super::{AttentionOutputs, LocalCacheStorage, OperatorCore, expect_cache_shape, split_caches};
use crate::cache::BeamIndirection;
use crate::config::AttentionConfig;
use crate::error::{Error, Result};
use crate::memory::{ScratchAllocator, ScratchStats};
use crate::ops::mask::AttentionMask;
use crate::parallel::ThreadPool;
use crate::params::{AttentionInputs, AttentionKind, AttentionParameters, check_decoder_masked, check_inputs};
use crate::tensor::{Element, TensorViewMut};

/// General multi-head attention over any query length.
///
/// Past state is carried by the caches handed in with the outputs: a
/// [`KvCache::Growing`](crate::cache::KvCache::Growing) pair copies its past
/// into a larger present tensor, a
/// [`KvCache::Fixed`](crate::cache::KvCache::Fixed) pair is updated in place
/// and requires `past_present_share_buffer`.
///
/// # Example
///
/// ```
/// use kvattn::{AttentionConfig, AttentionInputs, AttentionOutputs, MultiHeadAttention, Tensor, ThreadPool};
///
/// let mha = MultiHeadAttention::new(AttentionConfig::new(2), ThreadPool::sequential())?;
/// let q = Tensor::full(&[1, 3, 4], 0.5f32)?;
/// let k = Tensor::full(&[1, 3, 4], 1.0f32)?;
/// let v = Tensor::full(&[1, 3, 4], 2.0f32)?;
/// let mut out = Tensor::<f32>::zeros(&[1, 3, 4])?;
///
/// let inputs = AttentionInputs::new(q.view()).with_key_value(k.view(), Some(v.view()));
/// let params = mha.compute(&inputs, AttentionOutputs::new(out.view_mut()))?;
/// assert_eq!(params.total_sequence_length, 3);
/// assert!(out.as_slice().iter().all(|&x| (x - 2.0).abs() < 1e-6));
/// # Ok::<(), kvattn::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    core: OperatorCore,
}

impl MultiHeadAttention {
    pub fn new(config: AttentionConfig, pool: ThreadPool) -> Result<Self> {
        Ok(Self {
            core: OperatorCore::new(config, pool)?,
        })
    }

    /// Builds the worker pool from `config.num_threads`.
    pub fn from_config(config: AttentionConfig) -> Result<Self> {
        let pool = config.thread_pool()?;
        Self::new(config, pool)
    }

    /// Takes scratch buffers from `allocator` instead of the default heap allocator.
    pub fn with_allocator(mut self, allocator: Arc<dyn ScratchAllocator>) -> Self {
        self.core.allocator = allocator;
        self
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.core.config
    }

    pub fn scratch_stats(&self) -> ScratchStats {
        self.core.allocator.stats()
    }

    /// Runs one attention step and returns the validated parameters.
    pub fn compute<T: Element>(
        &self,
        inputs: &AttentionInputs<'_, T>,
        outputs: AttentionOutputs<'_, T>,
    ) -> Result<AttentionParameters> {
        run_multi_head(&self.core, AttentionKind::MultiHead, inputs, outputs)
    }
}

fn expect_shape<T: Copy>(arg: &'static str, tensor: &TensorViewMut<'_, T>, expected: &[usize]) -> Result<()> {
    if tensor.shape() != expected {
        return Err(Error::invalid(
            arg,
            format!("expected shape {expected:?}, got {:?}", tensor.shape()),
        ));
    }
    Ok(())
}

pub(crate) fn run_multi_head<T: Element>(
    core: &OperatorCore,
    kind: AttentionKind,
    inputs: &AttentionInputs<'_, T>,
    outputs: AttentionOutputs<'_, T>,
) -> Result<AttentionParameters> {
    let AttentionOutputs {
        mut output,
        present_key,
        present_value,
        output_qk,
    } = outputs;
    let caches = split_caches(present_key, present_value)?;

    let (past_key, past_value) = match &caches {
        Some((k, v)) => (k.past_shape(), v.past_shape()),
        None => (None, None),
    };
    let params = check_inputs(inputs, past_key, past_value, &core.config, kind)?;
    let beam_width = match kind {
        AttentionKind::DecoderMasked => check_decoder_masked(inputs, &params)?,
        _ => None,
    };
    debug!(?params, beam_width, "attention inputs validated");

    let (batch, heads) = (params.batch_size, params.num_heads);
    let (h, hv) = (params.head_size, params.v_head_size);
    let total = params.total_sequence_length;

    if let Some((k, v)) = &caches {
        if k.is_shared() != params.past_present_share_buffer {
            return Err(Error::invalid(
                "present_key",
                if k.is_shared() {
                    "a fixed cache buffer requires past_present_share_buffer"
                } else {
                    "past_present_share_buffer requires fixed cache buffers"
                },
            ));
        }
        let rows = if k.is_shared() { params.max_sequence_length } else { total };
        expect_cache_shape("present_key", k, [batch, heads, rows, h])?;
        expect_cache_shape("present_value", v, [batch, heads, rows, hv])?;
    }
    expect_shape("output", &output, &[batch, params.sequence_length, heads * hv])?;
    if let Some(qk) = &output_qk {
        expect_shape("output_qk", qk, &[batch, heads, params.sequence_length, total])?;
    }

    let offsets = vec![params.past_sequence_length; batch];
    let mut mask = AttentionMask::new(batch, params.sequence_length, params.past_sequence_length, total)
        .with_padding(params.mask_type, inputs.key_padding_mask);
    if params.is_unidirectional {
        mask = mask.with_causal(&offsets);
    }
    let indirection = match (beam_width, inputs.cache_indirection) {
        (Some(width), Some(table)) => Some(BeamIndirection::new(table, width, params.past_sequence_length)?),
        _ => None,
    };

    let allocator = core.allocator.as_ref();
    let mut local;
    let (mut key_cache, mut value_cache) = match caches {
        Some(pair) => pair,
        None => {
            local = LocalCacheStorage::<T>::new(allocator, [batch, heads, total, h], [batch, heads, total, hv])?;
            local.caches()?
        }
    };

    let qkv = prepare_qkv(
        &inputs.query,
        inputs.key.as_ref(),
        inputs.value.as_ref(),
        inputs.bias.as_ref(),
        &params,
        allocator,
        &core.pool,
    )?;
    let plan = AttentionPlan {
        params: &params,
        offsets: &offsets,
        mask,
        attention_bias: inputs.attention_bias,
        indirection: indirection.as_ref(),
    };
    apply_attention(
        &plan,
        &qkv,
        &mut key_cache,
        &mut value_cache,
        output.as_mut_slice(),
        output_qk.map(TensorViewMut::into_mut_slice),
        allocator,
        &core.pool,
    )?;

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KvCache;
    use crate::memory::CpuScratchAllocator;
    use crate::tensor::Tensor;

    #[test]
    fn test_uniform_keys_average_values() {
        let mha = MultiHeadAttention::new(AttentionConfig::new(1), ThreadPool::sequential()).unwrap();
        let q = Tensor::from_vec(vec![1.0f32, -1.0], &[1, 1, 2]).unwrap();
        let k = Tensor::full(&[1, 2, 2], 1.0f32).unwrap();
        let v = Tensor::from_vec(vec![0.0f32, 2.0, 4.0, 6.0], &[1, 2, 2]).unwrap();
        let mut out = Tensor::<f32>::zeros(&[1, 1, 2]).unwrap();

        let inputs = AttentionInputs::new(q.view()).with_key_value(k.view(), Some(v.view()));
        mha.compute(&inputs, AttentionOutputs::new(out.view_mut())).unwrap();
        assert_eq!(out.as_slice(), &[2.0, 4.0]);
    }

    #[test]
    fn test_rejects_wrong_output_shape() {
        let mha = MultiHeadAttention::new(AttentionConfig::new(1), ThreadPool::sequential()).unwrap();
        let q = Tensor::<f32>::zeros(&[1, 2, 4]).unwrap();
        let mut out = Tensor::<f32>::zeros(&[1, 1, 4]).unwrap();
        let inputs = AttentionInputs::new(q.view()).with_key_value(q.view(), Some(q.view()));
        let err = mha.compute(&inputs, AttentionOutputs::new(out.view_mut())).unwrap_err();
        assert!(err.to_string().contains("output"));
    }

    #[test]
    fn test_fixed_cache_requires_share_buffer_flag() {
        let mha = MultiHeadAttention::new(AttentionConfig::new(1), ThreadPool::sequential()).unwrap();
        let q = Tensor::<f32>::zeros(&[1, 1, 2]).unwrap();
        let mut out = Tensor::<f32>::zeros(&[1, 1, 2]).unwrap();
        let mut kb = Tensor::<f32>::zeros(&[1, 1, 4, 2]).unwrap();
        let mut vb = Tensor::<f32>::zeros(&[1, 1, 4, 2]).unwrap();
        let outputs = AttentionOutputs::new(out.view_mut()).with_cache(
            KvCache::fixed(kb.view_mut()).unwrap(),
            KvCache::fixed(vb.view_mut()).unwrap(),
        );
        let inputs = AttentionInputs::new(q.view()).with_key_value(q.view(), Some(q.view()));
        let err = mha.compute(&inputs, outputs).unwrap_err();
        assert!(err.to_string().contains("past_present_share_buffer"));
    }

    #[test]
    fn test_scratch_released_after_call() {
        let alloc = Arc::new(CpuScratchAllocator::new());
        let mha = MultiHeadAttention::new(AttentionConfig::new(2), ThreadPool::sequential())
            .unwrap()
            .with_allocator(alloc.clone());
        let q = Tensor::full(&[2, 3, 4], 0.25f32).unwrap();
        let mut out = Tensor::<f32>::zeros(&[2, 3, 4]).unwrap();
        let inputs = AttentionInputs::new(q.view()).with_key_value(q.view(), Some(q.view()));
        mha.compute(&inputs, AttentionOutputs::new(out.view_mut())).unwrap();

        let stats = mha.scratch_stats();
        assert_eq!(stats.bytes_in_use, 0);
        assert!(stats.peak_bytes > 0);
    }
}
