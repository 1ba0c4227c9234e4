//! Input validation and the normalized parameter record
//!
//! The validators inspect the raw input tensors once, decide which physical
//! layout they use and produce an [`AttentionParameters`] that the engines
//! consume without looking at raw shapes again.

mod gqa;
mod mha;

pub use gqa::{GqaInputs, check_gqa_inputs};
pub use mha::{check_decoder_masked, check_inputs};

use serde::Serialize;

use crate::tensor::TensorView;

/// Which operator is being validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttentionKind {
    MultiHead,
    DecoderMasked,
    GroupQuery,
}

/// Physical layout of Q, K and V.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QkvFormat {
    /// Q `(B, S, D)`, K `(B, L, D)`, V `(B, L, Dv)`
    SeparateBsnh,
    /// Q `(B, S, D)`, K and V `(B, N, L, H)`
    CrossBnsh,
    /// Q `(B, S, D)`, KV `(B, L, N, 2, H)`
    PackedKv,
    /// QKV `(B, S, N, 3, H)`
    PackedQkv,
    /// QKV `(B, S, 3 * D)`
    PackedQkvBs3nh,
}

impl QkvFormat {
    /// Whether K and V arrive inside the query tensor.
    pub fn is_packed_qkv(self) -> bool {
        matches!(self, QkvFormat::PackedQkv | QkvFormat::PackedQkvBs3nh)
    }
}

/// Shape class of the key padding mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MaskType {
    None,
    /// `(B)`: valid key length per batch
    KeySeqLen,
    /// `(3 * B + 2)`: key end positions then key start positions
    KeySeqLenStart,
    /// `(B, L)` or `(B, T)`, 0 = masked
    KeyPadding2d,
    /// `(B, S, T)`, 0 = masked
    Attention3d,
}

/// Normalized view of one attention invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttentionParameters {
    pub kind: AttentionKind,
    pub batch_size: usize,
    /// S: new query tokens
    pub sequence_length: usize,
    /// L: new key/value tokens
    pub kv_sequence_length: usize,
    /// P
    pub past_sequence_length: usize,
    /// T = P + L
    pub total_sequence_length: usize,
    /// M: capacity of a shared cache buffer, else T
    pub max_sequence_length: usize,
    pub hidden_size: usize,
    pub v_hidden_size: usize,
    pub head_size: usize,
    pub v_head_size: usize,
    pub num_heads: usize,
    pub kv_num_heads: usize,
    pub is_unidirectional: bool,
    pub past_present_share_buffer: bool,
    pub mask_filter_value: f32,
    pub mask_type: MaskType,
    /// As configured; 0 means `1 / sqrt(head_size)`.
    pub scale: f32,
    pub broadcast_attn_bias: bool,
    pub qkv_format: QkvFormat,

    // grouped-query only
    pub rotary_dim: usize,
    pub is_packed_qkv: bool,
    pub is_interactive: bool,
    pub is_prompt: bool,
    pub present_sequence_length: usize,
}

impl AttentionParameters {
    /// Query heads per key/value head.
    pub fn group_size(&self) -> usize {
        self.num_heads / self.kv_num_heads.max(1)
    }

    pub fn resolved_scale(&self) -> f32 {
        crate::config::resolve_scale(self.scale, self.head_size)
    }

    /// Key positions each query row scores against.
    pub fn probs_len(&self) -> usize {
        match self.kind {
            AttentionKind::GroupQuery => self.present_sequence_length,
            _ => self.total_sequence_length,
        }
    }
}

/// Read-only inputs of the multi-head attention operators.
///
/// Past key/value state is not listed here: it lives in the caches passed
/// with the outputs.
#[derive(Debug, Clone, Copy)]
pub struct AttentionInputs<'a, T> {
    pub query: TensorView<'a, T>,
    pub key: Option<TensorView<'a, T>>,
    pub value: Option<TensorView<'a, T>>,
    /// `(D + D + Dv)`
    pub bias: Option<TensorView<'a, T>>,
    pub key_padding_mask: Option<TensorView<'a, i32>>,
    /// `(B or 1, N, S, T)`
    pub attention_bias: Option<TensorView<'a, T>>,
    /// One element; required with a shared cache buffer.
    pub past_sequence_length: Option<TensorView<'a, i32>>,
    /// One element; decoder-masked beam search only.
    pub beam_width: Option<TensorView<'a, i32>>,
    /// `(B / beam_width, beam_width, M)`
    pub cache_indirection: Option<TensorView<'a, i32>>,
}

impl<'a, T: Copy> AttentionInputs<'a, T> {
    pub fn new(query: TensorView<'a, T>) -> Self {
        Self {
            query,
            key: None,
            value: None,
            bias: None,
            key_padding_mask: None,
            attention_bias: None,
            past_sequence_length: None,
            beam_width: None,
            cache_indirection: None,
        }
    }

    pub fn with_key_value(mut self, key: TensorView<'a, T>, value: Option<TensorView<'a, T>>) -> Self {
        self.key = Some(key);
        self.value = value;
        self
    }

    pub fn with_bias(mut self, bias: TensorView<'a, T>) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn with_mask(mut self, mask: TensorView<'a, i32>) -> Self {
        self.key_padding_mask = Some(mask);
        self
    }

    pub fn with_attention_bias(mut self, bias: TensorView<'a, T>) -> Self {
        self.attention_bias = Some(bias);
        self
    }

    pub fn with_past_sequence_length(mut self, len: TensorView<'a, i32>) -> Self {
        self.past_sequence_length = Some(len);
        self
    }

    pub fn with_beams(mut self, beam_width: TensorView<'a, i32>, cache_indirection: TensorView<'a, i32>) -> Self {
        self.beam_width = Some(beam_width);
        self.cache_indirection = Some(cache_indirection);
        self
    }
}

/// Reads a one-element `i32` tensor as a non-negative length.
pub(crate) fn single_len(arg: &'static str, t: &TensorView<'_, i32>) -> crate::Result<usize> {
    if !t.is_single_element() {
        return Err(crate::Error::invalid(
            arg,
            format!("tensor must be of one element, got shape {:?}", t.shape()),
        ));
    }
    let v = t.as_slice()[0];
    usize::try_from(v).map_err(|_| crate::Error::invalid(arg, format!("must be >= 0, got {v}")))
}
