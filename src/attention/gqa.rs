//! GroupQueryAttention front-end

use std::sync::Arc;

use tracing::debug;

use super::apply::{AttentionPlan, apply_attention};
use super::qkv::prepare_qkv;
use super::{AttentionOutputs, LocalCacheStorage, OperatorCore, expect_cache_shape, split_caches};
use crate::config::AttentionConfig;
use crate::error::{Error, Result};
use crate::memory::{ScratchAllocator, ScratchStats};
use crate::ops::mask::AttentionMask;
use crate::parallel::ThreadPool;
use crate::params::{AttentionParameters, GqaInputs, check_gqa_inputs};
use crate::tensor::Element;

/// Grouped-query attention: `num_heads / kv_num_heads` query heads share each
/// key/value head.
///
/// Every batch entry has its own past length (`seqlens_k`); the new tokens
/// are written at that row of the present cache and attention is always
/// causal. Cache rows past `seqlens_k[b] + S` are never read.
#[derive(Debug, Clone)]
pub struct GroupQueryAttention {
    core: OperatorCore,
}

impl GroupQueryAttention {
    pub fn new(config: AttentionConfig, pool: ThreadPool) -> Result<Self> {
        Ok(Self {
            core: OperatorCore::new(config, pool)?,
        })
    }

    pub fn from_config(config: AttentionConfig) -> Result<Self> {
        let pool = config.thread_pool()?;
        Self::new(config, pool)
    }

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

    pub fn compute<T: Element>(
        &self,
        inputs: &GqaInputs<'_, T>,
        outputs: AttentionOutputs<'_, T>,
    ) -> Result<AttentionParameters> {
        let core = &self.core;
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
        let params = check_gqa_inputs(inputs, past_key, past_value, &core.config)?;
        debug!(?params, "grouped-query inputs validated");

        let (batch, seq) = (params.batch_size, params.sequence_length);
        let (heads, kv_heads, h) = (params.num_heads, params.kv_num_heads, params.head_size);
        let present = params.present_sequence_length;

        if let Some((k, v)) = &caches {
            expect_cache_shape("present_key", k, [batch, kv_heads, present, h])?;
            expect_cache_shape("present_value", v, [batch, kv_heads, present, h])?;
        }
        if output.shape() != [batch, seq, heads * h] {
            return Err(Error::invalid(
                "output",
                format!("expected shape {:?}, got {:?}", [batch, seq, heads * h], output.shape()),
            ));
        }
        if let Some(qk) = &output_qk {
            if qk.shape() != [batch, heads, seq, present] {
                return Err(Error::invalid(
                    "output_qk",
                    format!("expected shape {:?}, got {:?}", [batch, heads, seq, present], qk.shape()),
                ));
            }
        }

        // validated non-negative
        let offsets: Vec<usize> = inputs.seqlens_k.as_slice().iter().map(|&len| len as usize).collect();
        let mask = AttentionMask::new(batch, seq, params.past_sequence_length, present).with_causal(&offsets);

        let allocator = core.allocator.as_ref();
        let mut local;
        let (mut key_cache, mut value_cache) = match caches {
            Some(pair) => pair,
            None => {
                let shape = [batch, kv_heads, present, h];
                local = LocalCacheStorage::<T>::new(allocator, shape, shape)?;
                local.caches()?
            }
        };

        let qkv = prepare_qkv(
            &inputs.query,
            inputs.key.as_ref(),
            inputs.value.as_ref(),
            None,
            &params,
            allocator,
            &core.pool,
        )?;
        let plan = AttentionPlan {
            params: &params,
            offsets: &offsets,
            mask,
            attention_bias: None,
            indirection: None,
        };
        apply_attention(
            &plan,
            &qkv,
            &mut key_cache,
            &mut value_cache,
            output.as_mut_slice(),
            output_qk.map(|qk| qk.into_mut_slice()),
            allocator,
            &core.pool,
        )?;

        Ok(params)
    }
}
