//! Validation for MultiHeadAttention and DecoderMaskedMultiHeadAttention.

use crate::config::AttentionConfig;
use crate::error::{Error, Result};

use super::{AttentionInputs, AttentionKind, AttentionParameters, MaskType, QkvFormat, single_len};

fn dim_err(arg: &'static str, reason: impl Into<String>) -> Error {
    Error::invalid(arg, reason)
}

/// Validates past state shapes, returning `(past_sequence_length, max_sequence_length)`.
fn check_past<T: Copy>(
    inputs: &AttentionInputs<'_, T>,
    past_key: Option<&[usize]>,
    past_value: Option<&[usize]>,
    batch_size: usize,
    num_heads: usize,
    head_size: usize,
    share_buffer: bool,
) -> Result<(usize, usize)> {
    let (pk, pv) = match (past_key, past_value) {
        (Some(pk), Some(pv)) => (pk, pv),
        (None, None) => return Ok((0, 0)),
        _ => {
            return Err(dim_err(
                "past_key",
                "past_key and past_value shall be both present or both absent",
            ));
        }
    };
    for (arg, dims) in [("past_key", pk), ("past_value", pv)] {
        if dims.len() != 4 {
            return Err(dim_err(arg, format!("expected 4 dimensions, got {}", dims.len())));
        }
        if dims[0] != batch_size {
            return Err(dim_err(arg, format!("dimension 0 should be batch_size, got {}", dims[0])));
        }
        if dims[1] != num_heads {
            return Err(dim_err(
                arg,
                format!("dimension 1 should be same as number of heads, got {}", dims[1]),
            ));
        }
        if dims[3] != head_size {
            return Err(dim_err(
                arg,
                format!("dimension 3 should be same as head_size, got {}", dims[3]),
            ));
        }
    }
    if pk[2] != pv[2] {
        return Err(dim_err(
            "past_value",
            format!("past_key and past_value shall have same dim 2, {} vs {}", pk[2], pv[2]),
        ));
    }

    if !share_buffer {
        return Ok((pk[2], 0));
    }
    let max_sequence_length = pk[2];
    let past = inputs.past_sequence_length.as_ref().ok_or_else(|| {
        dim_err(
            "past_sequence_length",
            "tensor must be of one element when past_present_share_buffer is set",
        )
    })?;
    let past_sequence_length = single_len("past_sequence_length", past)?;
    if past_sequence_length > max_sequence_length {
        return Err(dim_err(
            "past_sequence_length",
            format!("{past_sequence_length} exceeds buffer length {max_sequence_length}"),
        ));
    }
    Ok((past_sequence_length, max_sequence_length))
}

fn classify_mask(
    shape: &[usize],
    batch_size: usize,
    sequence_length: usize,
    kv_sequence_length: usize,
    total_sequence_length: usize,
) -> Result<MaskType> {
    let mask_type = match *shape {
        [b] if b == batch_size => MaskType::KeySeqLen,
        [n] if n == 3 * batch_size + 2 => MaskType::KeySeqLenStart,
        [b, t] if b == batch_size && (t == kv_sequence_length || t == total_sequence_length) => {
            MaskType::KeyPadding2d
        }
        [b, s, t] if b == batch_size && s == sequence_length && t == total_sequence_length => {
            MaskType::Attention3d
        }
        _ => {
            return Err(dim_err(
                "key_padding_mask",
                format!("shape shall be 1D, 2D, or 3D, got {shape:?}"),
            ));
        }
    };
    Ok(mask_type)
}

/// Shape inference for the multi-head attention operators.
///
/// `past_key`/`past_value` are the shapes of the prior state: the past
/// tensors of a growing cache, or the shared buffer itself.
pub fn check_inputs<T: Copy>(
    inputs: &AttentionInputs<'_, T>,
    past_key: Option<&[usize]>,
    past_value: Option<&[usize]>,
    config: &AttentionConfig,
    kind: AttentionKind,
) -> Result<AttentionParameters> {
    let num_heads = config.num_heads;
    if num_heads == 0 {
        return Err(dim_err("num_heads", "must be > 0"));
    }
    let query_dims = inputs.query.shape();
    if query_dims.len() != 3 && query_dims.len() != 5 {
        return Err(dim_err(
            "query",
            format!("expected 3 or 5 dimensions, got {}", query_dims.len()),
        ));
    }
    let batch_size = query_dims[0];
    let sequence_length = query_dims[1];

    let dmmha_packing =
        kind == AttentionKind::DecoderMasked && inputs.key.is_none() && inputs.value.is_none();
    let hidden_size = match query_dims.len() {
        3 if dmmha_packing => {
            if query_dims[2] % 3 != 0 {
                return Err(dim_err(
                    "query",
                    format!("packed dim 2 ({}) must be a multiple of 3", query_dims[2]),
                ));
            }
            query_dims[2] / 3
        }
        3 => query_dims[2],
        _ => num_heads * query_dims[4],
    };
    if hidden_size == 0 || hidden_size % num_heads != 0 {
        return Err(dim_err(
            "query",
            format!("hidden size {hidden_size} is not a positive multiple of num_heads {num_heads}"),
        ));
    }
    let head_size = hidden_size / num_heads;

    let (past_sequence_length, max_sequence_length) = check_past(
        inputs,
        past_key,
        past_value,
        batch_size,
        num_heads,
        head_size,
        config.past_present_share_buffer,
    )?;
    let has_past = past_key.is_some();

    let key_dims = inputs.key.as_ref().map(|k| k.shape());
    let value_dims = inputs.value.as_ref().map(|v| v.shape());
    if key_dims.is_some_and(|d| d.first() != Some(&batch_size)) {
        return Err(dim_err("key", "query and key shall have same dim 0 (batch size)"));
    }
    if value_dims.is_some_and(|d| d.first() != Some(&batch_size)) {
        return Err(dim_err("value", "query and value shall have same dim 0 (batch size)"));
    }

    let mut kv_sequence_length = sequence_length;
    let mut v_hidden_size = hidden_size;
    let qkv_format = if query_dims.len() == 3 {
        match (key_dims, value_dims) {
            (None, Some(_)) => {
                return Err(dim_err("value", "value shall be absent when key is absent"));
            }
            (None, None) => {
                if kind != AttentionKind::DecoderMasked {
                    return Err(dim_err(
                        "query",
                        "packed qkv of 3D format is not supported in MultiHeadAttention",
                    ));
                }
                QkvFormat::PackedQkvBs3nh
            }
            (Some(kd), vd) => match kd.len() {
                3 => {
                    if kd[2] != query_dims[2] {
                        return Err(dim_err("key", "query and key shall have same dim 2 (hidden_size)"));
                    }
                    let vd = vd
                        .filter(|d| d.len() == 3)
                        .ok_or_else(|| dim_err("value", "expected value of 3 dimensions"))?;
                    if vd[1] != kd[1] {
                        return Err(dim_err(
                            "value",
                            format!("dim 1 ({}) differs from key dim 1 ({})", vd[1], kd[1]),
                        ));
                    }
                    if vd[2] % num_heads != 0 {
                        return Err(dim_err(
                            "value",
                            format!("hidden size {} is not a multiple of num_heads {num_heads}", vd[2]),
                        ));
                    }
                    kv_sequence_length = kd[1];
                    v_hidden_size = vd[2];
                    QkvFormat::SeparateBsnh
                }
                5 => {
                    if kd[2] != num_heads || kd[3] != 2 || kd[4] != head_size {
                        return Err(dim_err(
                            "key",
                            format!(
                                "expected shape (batch_size, kv_sequence_length, {num_heads}, 2, {head_size}) for packed kv, got {kd:?}"
                            ),
                        ));
                    }
                    if vd.is_some() {
                        return Err(dim_err("value", "expected none when key has packed kv format"));
                    }
                    if kind == AttentionKind::MultiHead && inputs.bias.is_some() {
                        return Err(dim_err("bias", "shall be empty when packed kv is used"));
                    }
                    kv_sequence_length = kd[1];
                    QkvFormat::PackedKv
                }
                4 => {
                    if kd[1] != num_heads || kd[3] != head_size {
                        return Err(dim_err(
                            "key",
                            format!(
                                "expected shape (batch_size, {num_heads}, kv_sequence_length, {head_size}), got {kd:?}"
                            ),
                        ));
                    }
                    if vd != Some(kd) {
                        return Err(dim_err(
                            "value",
                            "key and value shall have same shape (batch_size, num_heads, kv_sequence_length, head_size)",
                        ));
                    }
                    if has_past {
                        return Err(dim_err(
                            "past_key",
                            "past_key and past_value shall be empty when value is 4D",
                        ));
                    }
                    kv_sequence_length = kd[2];
                    v_hidden_size = kd[1] * kd[3];
                    QkvFormat::CrossBnsh
                }
                rank => {
                    return Err(dim_err(
                        "key",
                        format!("expected 3, 4, or 5 dimensions, got {rank}"),
                    ));
                }
            },
        }
    } else {
        if query_dims[2] != num_heads || query_dims[3] != 3 {
            return Err(dim_err(
                "query",
                format!(
                    "expected shape (batch_size, sequence_length, {num_heads}, 3, head_size) for packed qkv, got {query_dims:?}"
                ),
            ));
        }
        if key_dims.is_some() || value_dims.is_some() {
            return Err(dim_err(
                "key",
                "expected key and value be none when query has packed qkv format",
            ));
        }
        if inputs.bias.is_some() {
            return Err(dim_err("bias", "shall be empty when packed qkv is used"));
        }
        QkvFormat::PackedQkv
    };

    if let Some(bias) = &inputs.bias {
        if bias.rank() != 1 {
            return Err(dim_err(
                "bias",
                format!("expected 1 dimension, got {}", bias.rank()),
            ));
        }
        let expected = 2 * hidden_size + v_hidden_size;
        if bias.dim(0) != expected {
            return Err(dim_err(
                "bias",
                format!("expected {expected} elements (D + D + Dv), got {}", bias.dim(0)),
            ));
        }
    }

    let total_sequence_length = past_sequence_length + kv_sequence_length;
    if total_sequence_length < sequence_length {
        return Err(dim_err(
            "key",
            format!(
                "total sequence length {total_sequence_length} is shorter than query length {sequence_length}"
            ),
        ));
    }
    let max_sequence_length = if config.past_present_share_buffer && has_past {
        if total_sequence_length > max_sequence_length {
            return Err(dim_err(
                "past_key",
                format!(
                    "buffer holds {max_sequence_length} positions, {total_sequence_length} needed"
                ),
            ));
        }
        max_sequence_length
    } else {
        total_sequence_length
    };

    let mask_type = match &inputs.key_padding_mask {
        Some(mask) => classify_mask(
            mask.shape(),
            batch_size,
            sequence_length,
            kv_sequence_length,
            total_sequence_length,
        )?,
        None => MaskType::None,
    };

    let mut broadcast_attn_bias = false;
    if let Some(bias) = &inputs.attention_bias {
        let d = bias.shape();
        if d.len() != 4 {
            return Err(dim_err(
                "attention_bias",
                format!("expected 4 dimensions, got {}", d.len()),
            ));
        }
        if d[0] != batch_size && d[0] != 1 {
            return Err(dim_err(
                "attention_bias",
                format!("dimension 0 should be batch_size or 1, got {}", d[0]),
            ));
        }
        broadcast_attn_bias = d[0] == 1;
        if d[1] != num_heads {
            return Err(dim_err(
                "attention_bias",
                format!("dimension 1 should be same as number of heads, got {}", d[1]),
            ));
        }
        if d[2] != sequence_length {
            return Err(dim_err(
                "attention_bias",
                format!("dimension 2 should be same as sequence_length, got {}", d[2]),
            ));
        }
        if d[3] != total_sequence_length {
            return Err(dim_err(
                "attention_bias",
                format!("dimension 3 should be same as total_sequence_length, got {}", d[3]),
            ));
        }
    }

    Ok(AttentionParameters {
        kind,
        batch_size,
        sequence_length,
        kv_sequence_length,
        past_sequence_length,
        total_sequence_length,
        max_sequence_length,
        hidden_size,
        v_hidden_size,
        head_size,
        v_head_size: v_hidden_size / num_heads,
        num_heads,
        kv_num_heads: num_heads,
        is_unidirectional: config.unidirectional,
        past_present_share_buffer: config.past_present_share_buffer,
        mask_filter_value: config.mask_filter_value,
        mask_type,
        scale: config.scale,
        broadcast_attn_bias,
        qkv_format,
        rotary_dim: 0,
        is_packed_qkv: qkv_format.is_packed_qkv(),
        is_interactive: false,
        is_prompt: past_sequence_length == 0,
        present_sequence_length: max_sequence_length,
    })
}

/// Checks specific to the decode-step operator. Returns the beam width when
/// a cache indirection table is supplied.
pub fn check_decoder_masked<T: Copy>(
    inputs: &AttentionInputs<'_, T>,
    params: &AttentionParameters,
) -> Result<Option<usize>> {
    if params.sequence_length != 1 {
        return Err(dim_err(
            "query",
            format!("sequence_length must be 1, got {}", params.sequence_length),
        ));
    }
    let Some(table) = &inputs.cache_indirection else {
        return Ok(None);
    };
    if !params.past_present_share_buffer {
        return Err(dim_err(
            "cache_indirection",
            "requires past_present_share_buffer",
        ));
    }
    let beam_width = inputs
        .beam_width
        .as_ref()
        .ok_or_else(|| dim_err("beam_width", "required with cache_indirection"))
        .and_then(|t| single_len("beam_width", t))?;
    if beam_width == 0 || params.batch_size % beam_width != 0 {
        return Err(dim_err(
            "beam_width",
            format!("{beam_width} must be >= 1 and divide batch size {}", params.batch_size),
        ));
    }
    let expected = [
        params.batch_size / beam_width,
        beam_width,
        params.max_sequence_length,
    ];
    if table.shape() != expected {
        return Err(dim_err(
            "cache_indirection",
            format!("expected shape {expected:?}, got {:?}", table.shape()),
        ));
    }
    Ok(Some(beam_width))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn cfg(num_heads: usize) -> AttentionConfig {
        AttentionConfig::new(num_heads)
    }

    #[test]
    fn test_separate_bsnh() {
        let q = Tensor::<f32>::zeros(&[2, 3, 8]).unwrap();
        let k = Tensor::<f32>::zeros(&[2, 5, 8]).unwrap();
        let v = Tensor::<f32>::zeros(&[2, 5, 12]).unwrap();
        let inputs = AttentionInputs::new(q.view()).with_key_value(k.view(), Some(v.view()));
        let p = check_inputs(&inputs, None, None, &cfg(4), AttentionKind::MultiHead).unwrap();
        assert_eq!(p.qkv_format, QkvFormat::SeparateBsnh);
        assert_eq!((p.head_size, p.v_head_size), (2, 3));
        assert_eq!((p.kv_sequence_length, p.total_sequence_length), (5, 5));
        assert_eq!(p.max_sequence_length, 5);
        assert_eq!(p.mask_type, MaskType::None);
    }

    #[test]
    fn test_packed_kv_rejects_bias_for_multi_head() {
        let q = Tensor::<f32>::zeros(&[1, 1, 4]).unwrap();
        let kv = Tensor::<f32>::zeros(&[1, 3, 2, 2, 2]).unwrap();
        let bias = Tensor::<f32>::zeros(&[12]).unwrap();
        let inputs = AttentionInputs::new(q.view()).with_key_value(kv.view(), None);
        let p = check_inputs(&inputs, None, None, &cfg(2), AttentionKind::MultiHead).unwrap();
        assert_eq!(p.qkv_format, QkvFormat::PackedKv);

        let with_bias = inputs.with_bias(bias.view());
        assert!(check_inputs(&with_bias, None, None, &cfg(2), AttentionKind::MultiHead).is_err());
        assert!(check_inputs(&with_bias, None, None, &cfg(2), AttentionKind::DecoderMasked).is_ok());
    }

    #[test]
    fn test_query_only_depends_on_kind() {
        let q = Tensor::<f32>::zeros(&[2, 1, 12]).unwrap();
        let inputs = AttentionInputs::new(q.view());
        let p = check_inputs(&inputs, None, None, &cfg(2), AttentionKind::DecoderMasked).unwrap();
        assert_eq!(p.qkv_format, QkvFormat::PackedQkvBs3nh);
        assert_eq!(p.hidden_size, 4);
        let err = check_inputs(&inputs, None, None, &cfg(2), AttentionKind::MultiHead).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_cross_bnsh_forbids_past() {
        let q = Tensor::<f32>::zeros(&[1, 2, 8]).unwrap();
        let k = Tensor::<f32>::zeros(&[1, 2, 6, 4]).unwrap();
        let inputs = AttentionInputs::new(q.view()).with_key_value(k.view(), Some(k.view()));
        let p = check_inputs(&inputs, None, None, &cfg(2), AttentionKind::MultiHead).unwrap();
        assert_eq!(p.qkv_format, QkvFormat::CrossBnsh);
        assert_eq!(p.kv_sequence_length, 6);
        let past = [1, 2, 3, 4];
        assert!(
            check_inputs(&inputs, Some(&past), Some(&past), &cfg(2), AttentionKind::MultiHead)
                .is_err()
        );
    }

    #[test]
    fn test_shared_buffer_reads_past_length() {
        let q = Tensor::<f32>::zeros(&[1, 1, 8]).unwrap();
        let k = Tensor::<f32>::zeros(&[1, 1, 8]).unwrap();
        let past_len = Tensor::from_vec(vec![3], &[1]).unwrap();
        let buffer = [1, 2, 8, 4];
        let config = cfg(2).share_buffer(true);

        let inputs = AttentionInputs::new(q.view()).with_key_value(k.view(), Some(k.view()));
        assert!(
            check_inputs(&inputs, Some(&buffer), Some(&buffer), &config, AttentionKind::MultiHead)
                .is_err()
        );

        let inputs = inputs.with_past_sequence_length(past_len.view());
        let p = check_inputs(&inputs, Some(&buffer), Some(&buffer), &config, AttentionKind::MultiHead)
            .unwrap();
        assert_eq!(p.past_sequence_length, 3);
        assert_eq!(p.total_sequence_length, 4);
        assert_eq!(p.max_sequence_length, 8);
    }

    #[test]
    fn test_mask_classification() {
        let shape = |s: &[usize]| classify_mask(s, 2, 3, 4, 6);
        assert_eq!(shape(&[2]).unwrap(), MaskType::KeySeqLen);
        assert_eq!(shape(&[8]).unwrap(), MaskType::KeySeqLenStart);
        assert_eq!(shape(&[2, 4]).unwrap(), MaskType::KeyPadding2d);
        assert_eq!(shape(&[2, 6]).unwrap(), MaskType::KeyPadding2d);
        assert_eq!(shape(&[2, 3, 6]).unwrap(), MaskType::Attention3d);
        assert!(shape(&[2, 5]).is_err());
        assert!(shape(&[2, 3, 4]).is_err());
        assert!(shape(&[1, 2, 3, 6]).is_err());
    }

    #[test]
    fn test_attention_bias_broadcast() {
        let q = Tensor::<f32>::zeros(&[2, 3, 8]).unwrap();
        let k = Tensor::<f32>::zeros(&[2, 3, 8]).unwrap();
        let bias = Tensor::<f32>::zeros(&[1, 2, 3, 3]).unwrap();
        let bad = Tensor::<f32>::zeros(&[2, 2, 3, 4]).unwrap();
        let inputs = AttentionInputs::new(q.view()).with_key_value(k.view(), Some(k.view()));
        let p = check_inputs(
            &inputs.with_attention_bias(bias.view()),
            None,
            None,
            &cfg(2),
            AttentionKind::MultiHead,
        )
        .unwrap();
        assert!(p.broadcast_attn_bias);
        assert!(
            check_inputs(
                &inputs.with_attention_bias(bad.view()),
                None,
                None,
                &cfg(2),
                AttentionKind::MultiHead
            )
            .is_err()
        );
    }

    #[test]
    fn test_decoder_masked_beam_checks() {
        let q = Tensor::<f32>::zeros(&[4, 1, 24]).unwrap();
        let past_len = Tensor::from_vec(vec![2], &[1]).unwrap();
        let width = Tensor::from_vec(vec![2], &[1]).unwrap();
        let table = Tensor::<i32>::zeros(&[2, 2, 5]).unwrap();
        let bad_table = Tensor::<i32>::zeros(&[4, 1, 5]).unwrap();
        let buffer = [4, 2, 5, 4];
        let config = cfg(2).share_buffer(true);

        let inputs = AttentionInputs::new(q.view())
            .with_past_sequence_length(past_len.view())
            .with_beams(width.view(), table.view());
        let p = check_inputs(&inputs, Some(&buffer), Some(&buffer), &config, AttentionKind::DecoderMasked)
            .unwrap();
        assert_eq!(check_decoder_masked(&inputs, &p).unwrap(), Some(2));

        let inputs = inputs.with_beams(width.view(), bad_table.view());
        assert!(check_decoder_masked(&inputs, &p).is_err());
    }
}
