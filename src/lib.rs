//! # kvattn
//!
//! **CPU attention operators with in-place key/value caches.**
//!
//! kvattn runs the masked multi-head attention used by autoregressive
//! decoders: a shape validator that normalizes every accepted input layout,
//! a score engine, a value engine and the orchestration between them, with
//! grouped-query heads and beam-search cache indirection.
//!
//! ## Layers
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  attention: MultiHeadAttention, DecoderMasked..., GroupQuery │
//! └──────────────┬───────────────────────────────┬───────────────┘
//! ┌──────────────▼───────────┐   ┌───────────────▼──────────────┐
//! │ params: validators,      │   │ cache: KvCache (growing or   │
//! │ AttentionParameters      │   │ fixed), BeamIndirection      │
//! └──────────────┬───────────┘   └───────────────┬──────────────┘
//! ┌──────────────▼───────────────────────────────▼──────────────┐
//! │ ops (dot, softmax, mask) · tensor views · scratch · rayon    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - **Validated once**: operators consume an [`AttentionParameters`] record,
//!   never raw shapes
//! - **Caches own the past**: growing caches copy past rows into a present
//!   tensor, fixed caches are updated in place
//! - **f32 accumulation**: `f32`, `f16` and `bf16` inputs are widened while
//!   scoring and narrowed on the way out
//! - **Scoped scratch**: temporaries are accounted by a [`ScratchAllocator`]
//!   and released on every return path

pub mod attention;
pub mod cache;
pub mod config;
pub mod error;
pub mod memory;
pub mod ops;
pub mod parallel;
pub mod params;
pub mod tensor;

pub use attention::{AttentionOutputs, DecoderMaskedMultiHeadAttention, GroupQueryAttention, MultiHeadAttention};
pub use cache::{BeamIndirection, FixedCache, GrowingCache, KvCache};
pub use config::{AttentionConfig, DEFAULT_MASK_FILTER_VALUE};
pub use error::{Error, ErrorKind, Result};
pub use memory::{CpuScratchAllocator, ScratchAllocator, ScratchStats};
pub use parallel::ThreadPool;
pub use params::{
    AttentionInputs, AttentionKind, AttentionParameters, GqaInputs, MaskType, QkvFormat, check_gqa_inputs,
    check_inputs,
};
pub use tensor::{DType, Element, Tensor, TensorView, TensorViewMut};
