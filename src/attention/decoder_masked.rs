//! DecoderMaskedMultiHeadAttention front-end

use std::sync::Arc;

use super::multi_head::run_multi_head;
use super::{AttentionOutputs, OperatorCore};
use crate::config::AttentionConfig;
use crate::error::{Error, Result};
use crate::memory::{ScratchAllocator, ScratchStats};
use crate::parallel::ThreadPool;
use crate::params::{AttentionInputs, AttentionKind, AttentionParameters};
use crate::tensor::Element;

/// One-token decode step.
///
/// Accepts the packed `(B, 1, 3 * D)` query in addition to the layouts of
/// [`MultiHeadAttention`](super::MultiHeadAttention). With a shared cache
/// buffer, a `cache_indirection` table lets every beam read its ancestors'
/// past rows.
#[derive(Debug, Clone)]
pub struct DecoderMaskedMultiHeadAttention {
    core: OperatorCore,
}

impl DecoderMaskedMultiHeadAttention {
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

    /// Runs one decode step. `outputs.output_qk` must be given exactly when
    /// the `output_qk` attribute is set.
    pub fn compute<T: Element>(
        &self,
        inputs: &AttentionInputs<'_, T>,
        outputs: AttentionOutputs<'_, T>,
    ) -> Result<AttentionParameters> {
        match (self.core.config.output_qk, outputs.output_qk.is_some()) {
            (true, false) => {
                return Err(Error::invalid("output_qk", "required when the output_qk attribute is set"));
            }
            (false, true) => {
                return Err(Error::invalid("output_qk", "given but the output_qk attribute is not set"));
            }
            _ => {}
        }
        run_multi_head(&self.core, AttentionKind::DecoderMasked, inputs, outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    #[test]
    fn test_packed_bs3nh_step_without_cache() {
        let op = DecoderMaskedMultiHeadAttention::new(AttentionConfig::new(1), ThreadPool::sequential()).unwrap();
        // q | k | v with H = 2: a single key, so the output is v
        let qkv = Tensor::from_vec(vec![1.0f32, 0.0, 3.0, 1.0, 7.0, -2.0], &[1, 1, 6]).unwrap();
        let mut out = Tensor::<f32>::zeros(&[1, 1, 2]).unwrap();
        let params = op
            .compute(&AttentionInputs::new(qkv.view()), AttentionOutputs::new(out.view_mut()))
            .unwrap();
        assert_eq!(params.sequence_length, 1);
        assert_eq!(out.as_slice(), &[7.0, -2.0]);
    }

    #[test]
    fn test_output_qk_must_match_attribute() {
        let op = DecoderMaskedMultiHeadAttention::new(AttentionConfig::new(1).output_qk(true), ThreadPool::sequential())
            .unwrap();
        let qkv = Tensor::<f32>::zeros(&[1, 1, 6]).unwrap();
        let mut out = Tensor::<f32>::zeros(&[1, 1, 2]).unwrap();
        let err = op
            .compute(&AttentionInputs::new(qkv.view()), AttentionOutputs::new(out.view_mut()))
            .unwrap_err();
        assert!(err.to_string().contains("output_qk"));
    }

    #[test]
    fn test_rejects_multi_token_query() {
        let op = DecoderMaskedMultiHeadAttention::new(AttentionConfig::new(1), ThreadPool::sequential()).unwrap();
        let qkv = Tensor::<f32>::zeros(&[1, 2, 6]).unwrap();
        let mut out = Tensor::<f32>::zeros(&[1, 2, 2]).unwrap();
        assert!(op
            .compute(&AttentionInputs::new(qkv.view()), AttentionOutputs::new(out.view_mut()))
            .is_err());
    }
}
