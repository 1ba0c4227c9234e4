//! Attention operators
//!
//! ```text
//!   inputs ──► validator ──► AttentionParameters
//!                                   │
//!          qkv gather (f32 scratch) ▼
//!   K/V ──► cache append ──► score pass ──► softmax ──► value pass ──► output
//!                              ▲                           ▲
//!                              └──── beam indirection ─────┘
//! ```
//!
//! - [`MultiHeadAttention`]: any sequence length, optional growing or shared cache
//! - [`DecoderMaskedMultiHeadAttention`]: one-token decode steps with beam search
//! - [`GroupQueryAttention`]: grouped K/V heads with per-batch past lengths

mod apply;
mod decoder_masked;
mod gqa;
mod multi_head;
mod qkv;
mod scores;
mod values;

pub use decoder_masked::DecoderMaskedMultiHeadAttention;
pub use gqa::GroupQueryAttention;
pub use multi_head::MultiHeadAttention;

use std::sync::Arc;

use crate::cache::KvCache;
use crate::config::AttentionConfig;
use crate::error::{Error, Result};
use crate::memory::{CpuScratchAllocator, Scratch, ScratchAllocator};
use crate::parallel::ThreadPool;
use crate::tensor::{Element, TensorViewMut};

/// Buffers an attention call writes.
#[derive(Debug)]
pub struct AttentionOutputs<'a, T> {
    /// `(B, S, N * Hv)`
    pub output: TensorViewMut<'a, T>,
    pub present_key: Option<KvCache<'a, T>>,
    pub present_value: Option<KvCache<'a, T>>,
    /// `(B, N, S, T)` scaled logits before softmax
    pub output_qk: Option<TensorViewMut<'a, f32>>,
}

impl<'a, T: Element> AttentionOutputs<'a, T> {
    pub fn new(output: TensorViewMut<'a, T>) -> Self {
        Self {
            output,
            present_key: None,
            present_value: None,
            output_qk: None,
        }
    }

    pub fn with_cache(mut self, key: KvCache<'a, T>, value: KvCache<'a, T>) -> Self {
        self.present_key = Some(key);
        self.present_value = Some(value);
        self
    }

    pub fn with_output_qk(mut self, output_qk: TensorViewMut<'a, f32>) -> Self {
        self.output_qk = Some(output_qk);
        self
    }
}

/// State shared by every operator: attributes, workers, scratch accounting.
#[derive(Clone)]
pub(crate) struct OperatorCore {
    pub(crate) config: AttentionConfig,
    pub(crate) pool: ThreadPool,
    pub(crate) allocator: Arc<dyn ScratchAllocator>,
}

impl OperatorCore {
    pub(crate) fn new(config: AttentionConfig, pool: ThreadPool) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            pool,
            allocator: Arc::new(CpuScratchAllocator::new()),
        })
    }
}

impl std::fmt::Debug for OperatorCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorCore")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("scratch", &self.allocator.stats())
            .finish()
    }
}

/// Checks that a cache's storage has the expected shape.
pub(crate) fn expect_cache_shape<T: Element>(
    arg: &'static str,
    cache: &KvCache<'_, T>,
    expected: [usize; 4],
) -> Result<()> {
    if cache.shape() != expected {
        return Err(Error::invalid(
            arg,
            format!("expected shape {expected:?}, got {:?}", cache.shape()),
        ));
    }
    Ok(())
}

/// Backing storage for call-local caches.
pub(crate) struct LocalCacheStorage<'s, T> {
    key: Scratch<'s, T>,
    value: Scratch<'s, T>,
    key_shape: [usize; 4],
    value_shape: [usize; 4],
}

impl<'s, T: Element> LocalCacheStorage<'s, T> {
    pub(crate) fn new(
        allocator: &'s dyn ScratchAllocator,
        key_shape: [usize; 4],
        value_shape: [usize; 4],
    ) -> Result<Self> {
        Ok(Self {
            key: Scratch::zeroed(allocator, key_shape.iter().product(), "key cache")?,
            value: Scratch::zeroed(allocator, value_shape.iter().product(), "value cache")?,
            key_shape,
            value_shape,
        })
    }

    pub(crate) fn caches(&mut self) -> Result<(KvCache<'_, T>, KvCache<'_, T>)> {
        let key = KvCache::growing(None, TensorViewMut::new(&mut self.key[..], &self.key_shape)?)?;
        let value = KvCache::growing(None, TensorViewMut::new(&mut self.value[..], &self.value_shape)?)?;
        Ok((key, value))
    }
}

/// Both caches or neither.
pub(crate) fn split_caches<'a, T: Element>(
    key: Option<KvCache<'a, T>>,
    value: Option<KvCache<'a, T>>,
) -> Result<Option<(KvCache<'a, T>, KvCache<'a, T>)>> {
    match (key, value) {
        (Some(k), Some(v)) => {
            if k.is_shared() != v.is_shared() {
                return Err(Error::invalid(
                    "present_value",
                    "key and value caches must use the same storage strategy",
                ));
            }
            Ok(Some((k, v)))
        }
        (None, None) => Ok(None),
        _ => Err(Error::invalid(
            "present_key",
            "present_key and present_value shall be both present or both absent",
        )),
    }
}
