//! Validation for GroupQueryAttention.

use crate::config::AttentionConfig;
use crate::error::{Error, Result};
use crate::tensor::TensorView;

use super::{AttentionKind, AttentionParameters, MaskType, QkvFormat, single_len};

/// Read-only inputs of the grouped-query attention operator.
#[derive(Debug, Clone, Copy)]
pub struct GqaInputs<'a, T> {
    /// `(B, S, N * H)`, or `(B, S, (N + 2 * N_kv) * H)` when packed
    pub query: TensorView<'a, T>,
    /// `(B, S, N_kv * H)`
    pub key: Option<TensorView<'a, T>>,
    pub value: Option<TensorView<'a, T>>,
    /// `(B)`: valid past length of each batch entry
    pub seqlens_k: TensorView<'a, i32>,
    /// One element
    pub total_sequence_length: TensorView<'a, i32>,
    /// `(max_seq, rotary_dim / 2)`
    pub cos_cache: Option<TensorView<'a, T>>,
    pub sin_cache: Option<TensorView<'a, T>>,
}

impl<'a, T: Copy> GqaInputs<'a, T> {
    pub fn new(
        query: TensorView<'a, T>,
        seqlens_k: TensorView<'a, i32>,
        total_sequence_length: TensorView<'a, i32>,
    ) -> Self {
        Self {
            query,
            key: None,
            value: None,
            seqlens_k,
            total_sequence_length,
            cos_cache: None,
            sin_cache: None,
        }
    }

    pub fn with_key_value(mut self, key: TensorView<'a, T>, value: TensorView<'a, T>) -> Self {
        self.key = Some(key);
        self.value = Some(value);
        self
    }

    pub fn with_rotary(mut self, cos_cache: TensorView<'a, T>, sin_cache: TensorView<'a, T>) -> Self {
        self.cos_cache = Some(cos_cache);
        self.sin_cache = Some(sin_cache);
        self
    }
}

/// Shape inference for grouped-query attention. Past shapes are
/// `(B, N_kv, P, H)`.
pub fn check_gqa_inputs<T: Copy>(
    inputs: &GqaInputs<'_, T>,
    past_key: Option<&[usize]>,
    past_value: Option<&[usize]>,
    config: &AttentionConfig,
) -> Result<AttentionParameters> {
    let num_heads = config.num_heads;
    let kv_num_heads = config.kv_heads();
    if num_heads == 0 || kv_num_heads == 0 || num_heads % kv_num_heads != 0 {
        return Err(Error::invalid(
            "kv_num_heads",
            format!("num_heads ({num_heads}) must be a multiple of kv_num_heads ({kv_num_heads})"),
        ));
    }

    let query_dims = inputs.query.shape();
    if query_dims.len() != 3 {
        return Err(Error::invalid(
            "query",
            format!("expected 3 dimensions, got {}", query_dims.len()),
        ));
    }
    let batch_size = query_dims[0];
    let sequence_length = query_dims[1];
    let is_packed_qkv = inputs.key.is_none();

    let head_size = if is_packed_qkv {
        if inputs.value.is_some() {
            return Err(Error::invalid(
                "value",
                "key and value shall be both present, or both absent in the case of packed qkv",
            ));
        }
        query_dims[2] / (num_heads + 2 * kv_num_heads)
    } else {
        query_dims[2] / num_heads
    };
    if head_size == 0 || head_size % 8 != 0 {
        return Err(Error::invalid(
            "query",
            format!("head_size must be a positive multiple of 8, got {head_size}"),
        ));
    }
    let (hidden_size, kv_hidden_size) = (head_size * num_heads, head_size * kv_num_heads);
    let expected_q = if is_packed_qkv {
        hidden_size + 2 * kv_hidden_size
    } else {
        hidden_size
    };
    if query_dims[2] != expected_q {
        return Err(Error::invalid(
            "query",
            format!("dim 2 should be {expected_q}, got {}", query_dims[2]),
        ));
    }

    if let Some(key) = &inputs.key {
        let value = inputs.value.as_ref().ok_or_else(|| {
            Error::invalid(
                "value",
                "key and value shall be both present, or both absent in the case of packed qkv",
            )
        })?;
        for (arg, dims) in [("key", key.shape()), ("value", value.shape())] {
            if dims.len() != 3 {
                return Err(Error::invalid(arg, format!("expected 3 dimensions, got {}", dims.len())));
            }
            if dims[0] != batch_size {
                return Err(Error::invalid(arg, "shall have same dim 0 (batch size) as query"));
            }
            if dims[1] != sequence_length {
                return Err(Error::invalid(arg, "shall have same dim 1 (sequence length) as query"));
            }
            if dims[2] != kv_hidden_size {
                return Err(Error::invalid(
                    arg,
                    format!("dim 2 should be kv_num_heads * head_size = {kv_hidden_size}, got {}", dims[2]),
                ));
            }
        }
    }

    let past_sequence_length = match (past_key, past_value) {
        (Some(pk), Some(pv)) => {
            for (arg, dims) in [("past_key", pk), ("past_value", pv)] {
                if dims.len() != 4 {
                    return Err(Error::invalid(arg, format!("expected 4 dimensions, got {}", dims.len())));
                }
                if dims[0] != batch_size {
                    return Err(Error::invalid(arg, format!("dimension 0 should be batch_size, got {}", dims[0])));
                }
                if dims[1] != kv_num_heads {
                    return Err(Error::invalid(arg, format!("shall have kv_num_heads, got {}", dims[1])));
                }
                if dims[3] != head_size {
                    return Err(Error::invalid(
                        arg,
                        format!("dimension 3 should be same as head_size, got {}", dims[3]),
                    ));
                }
            }
            if pk[2] != pv[2] {
                return Err(Error::invalid(
                    "past_value",
                    format!("past_key and past_value should have same dimension 2, {} vs {}", pk[2], pv[2]),
                ));
            }
            pk[2]
        }
        (None, None) => 0,
        _ => {
            return Err(Error::invalid(
                "past_key",
                "past_key and past_value shall be both present or both absent",
            ));
        }
    };

    if inputs.seqlens_k.shape() != [batch_size] {
        return Err(Error::invalid(
            "seqlens_k",
            format!("must be shape (batch_size), got {:?}", inputs.seqlens_k.shape()),
        ));
    }
    if let Some((b, &len)) = inputs.seqlens_k.as_slice().iter().enumerate().find(|&(_, &l)| l < 0) {
        return Err(Error::invalid("seqlens_k", format!("entry {b} is negative ({len})")));
    }
    let total_sequence_length = single_len("total_sequence_length", &inputs.total_sequence_length)?;
    if total_sequence_length < sequence_length {
        return Err(Error::invalid(
            "total_sequence_length",
            format!("{total_sequence_length} is shorter than sequence_length {sequence_length}"),
        ));
    }
    let present_sequence_length = total_sequence_length.max(past_sequence_length);

    let rotary_dim = match (&inputs.cos_cache, &inputs.sin_cache) {
        (Some(cos), Some(sin)) => {
            if head_size % 16 != 0 {
                return Err(Error::invalid(
                    "cos_cache",
                    format!("head_size shall be a multiple of 16, got {head_size}"),
                ));
            }
            for (arg, dims) in [("cos_cache", cos.shape()), ("sin_cache", sin.shape())] {
                if dims.len() != 2 {
                    return Err(Error::invalid(arg, format!("expected 2 dimensions, got {}", dims.len())));
                }
                if dims[0] < total_sequence_length {
                    return Err(Error::invalid(
                        arg,
                        "dimension 0 shall not be less than total_sequence_length",
                    ));
                }
                if dims[1] > (head_size / 16) * 8 || dims[1] % 8 != 0 {
                    return Err(Error::invalid(
                        arg,
                        "dimension 1 must be <= head_size / 2 and a multiple of 8",
                    ));
                }
            }
            if cos.dim(1) != sin.dim(1) {
                return Err(Error::invalid(
                    "sin_cache",
                    "cos_cache and sin_cache dimension 1 must be the same",
                ));
            }
            cos.dim(1) * 2
        }
        (None, None) => 0,
        _ => {
            return Err(Error::invalid(
                "cos_cache",
                "cos_cache and sin_cache shall be both present or both absent",
            ));
        }
    };

    let is_interactive = sequence_length > 1 && sequence_length != total_sequence_length;
    if is_interactive && batch_size != 1 {
        return Err(Error::invalid(
            "query",
            "batch_size must be 1 when sequence_length > 1 and past context is given",
        ));
    }
    let is_prompt = !is_interactive && sequence_length == total_sequence_length;
    if !is_interactive && !is_prompt && sequence_length != 1 {
        return Err(Error::invalid(
            "query",
            "sequence_length shall be 1 when it is not prompt",
        ));
    }

    Ok(AttentionParameters {
        kind: AttentionKind::GroupQuery,
        batch_size,
        sequence_length,
        kv_sequence_length: sequence_length,
        past_sequence_length,
        total_sequence_length,
        max_sequence_length: present_sequence_length,
        hidden_size,
        v_hidden_size: hidden_size,
        head_size,
        v_head_size: head_size,
        num_heads,
        kv_num_heads,
        is_unidirectional: true,
        past_present_share_buffer: config.past_present_share_buffer,
        mask_filter_value: config.mask_filter_value,
        mask_type: MaskType::None,
        scale: config.scale,
        broadcast_attn_bias: false,
        qkv_format: QkvFormat::SeparateBsnh,
        rotary_dim,
        is_packed_qkv,
        is_interactive,
        is_prompt,
        present_sequence_length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn lens(v: Vec<i32>) -> Tensor<i32> {
        let n = v.len();
        Tensor::from_vec(v, &[n]).unwrap()
    }

    #[test]
    fn test_decode_step_with_past() {
        let q = Tensor::<f32>::zeros(&[1, 1, 16]).unwrap();
        let k = Tensor::<f32>::zeros(&[1, 1, 8]).unwrap();
        let seqlens = lens(vec![3]);
        let total = lens(vec![4]);
        let config = AttentionConfig::new(2).with_kv_num_heads(1);
        let inputs = GqaInputs::new(q.view(), seqlens.view(), total.view())
            .with_key_value(k.view(), k.view());
        let past = [1, 1, 3, 8];
        let p = check_gqa_inputs(&inputs, Some(&past), Some(&past), &config).unwrap();
        assert_eq!(p.head_size, 8);
        assert_eq!(p.group_size(), 2);
        assert_eq!(p.total_sequence_length, p.past_sequence_length + p.sequence_length);
        assert_eq!(p.present_sequence_length, 4);
        assert!(!p.is_prompt && !p.is_interactive);
    }

    #[test]
    fn test_packed_qkv_head_size() {
        // (N + 2 * N_kv) * H = (4 + 4) * 8
        let q = Tensor::<f32>::zeros(&[2, 5, 64]).unwrap();
        let seqlens = lens(vec![0, 0]);
        let total = lens(vec![5]);
        let config = AttentionConfig::new(4).with_kv_num_heads(2);
        let p = check_gqa_inputs(&GqaInputs::new(q.view(), seqlens.view(), total.view()), None, None, &config)
            .unwrap();
        assert!(p.is_packed_qkv && p.is_prompt);
        assert_eq!((p.head_size, p.hidden_size), (8, 32));
    }

    #[test]
    fn test_head_size_must_be_multiple_of_8() {
        let q = Tensor::<f32>::zeros(&[1, 1, 8]).unwrap();
        let k = Tensor::<f32>::zeros(&[1, 1, 4]).unwrap();
        let seqlens = lens(vec![0]);
        let total = lens(vec![1]);
        let config = AttentionConfig::new(2).with_kv_num_heads(1);
        let inputs = GqaInputs::new(q.view(), seqlens.view(), total.view())
            .with_key_value(k.view(), k.view());
        let err = check_gqa_inputs(&inputs, None, None, &config).unwrap_err();
        assert!(err.to_string().contains("multiple of 8"));
    }

    #[test]
    fn test_multi_token_decode_requires_single_batch() {
        let q = Tensor::<f32>::zeros(&[2, 2, 8]).unwrap();
        let seqlens = lens(vec![1, 1]);
        let total = lens(vec![3]);
        let config = AttentionConfig::new(1).with_kv_num_heads(1);
        let k = Tensor::<f32>::zeros(&[2, 2, 8]).unwrap();
        let inputs = GqaInputs::new(q.view(), seqlens.view(), total.view())
            .with_key_value(k.view(), k.view());
        assert!(check_gqa_inputs(&inputs, None, None, &config).is_err());
    }

    #[test]
    fn test_rotary_cache_checks() {
        let q = Tensor::<f32>::zeros(&[1, 1, 16]).unwrap();
        let seqlens = lens(vec![0]);
        let total = lens(vec![1]);
        let cos = Tensor::<f32>::zeros(&[4, 8]).unwrap();
        let wide = Tensor::<f32>::zeros(&[4, 16]).unwrap();
        let config = AttentionConfig::new(1).with_kv_num_heads(1);
        let k = Tensor::<f32>::zeros(&[1, 1, 16]).unwrap();
        let inputs = GqaInputs::new(q.view(), seqlens.view(), total.view())
            .with_key_value(k.view(), k.view());

        let p = check_gqa_inputs(&inputs.with_rotary(cos.view(), cos.view()), None, None, &config).unwrap();
        assert_eq!(p.rotary_dim, 16);
        assert!(check_gqa_inputs(&inputs.with_rotary(wide.view(), wide.view()), None, None, &config).is_err());
        assert!(check_gqa_inputs(&inputs.with_rotary(cos.view(), wide.view()), None, None, &config).is_err());
    }
}
