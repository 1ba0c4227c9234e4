//! Attention orchestration
//!
//! Sequencing for one call:
//!
//! 1. write the new K and V rows into their caches (one task per `(b, kv_head)`)
//! 2. build the key mask, if any
//! 3. score pass, optional copy of the logits, softmax
//! 4. value pass and transpose into `[B, S, N * Hv]`
//!
//! Each stage joins before the next starts. All scratch comes from the
//! caller's allocator and is released when this function returns.

use tracing::{debug, instrument};

use super::qkv::PreparedQkv;
use super::scores::{ScoreDims, ScoreInputs, compute_scores, normalize};
use super::values::{ValueDims, transpose_heads, weighted_values};
use crate::cache::{BeamIndirection, KvCache, KvReader};
use crate::error::{Error, Result};
use crate::memory::{Scratch, ScratchAllocator};
use crate::ops::mask::{AttentionMask, KeyState};
use crate::parallel::ThreadPool;
use crate::params::AttentionParameters;
use crate::tensor::{Element, TensorView};

/// Everything besides buffers that one call needs.
pub(crate) struct AttentionPlan<'p, T> {
    pub(crate) params: &'p AttentionParameters,
    /// Per-batch cache row where the new tokens are written.
    pub(crate) offsets: &'p [usize],
    pub(crate) mask: AttentionMask<'p>,
    pub(crate) attention_bias: Option<TensorView<'p, T>>,
    pub(crate) indirection: Option<&'p BeamIndirection<'p>>,
}

#[instrument(skip_all, fields(kind = ?plan.params.kind, batch = plan.params.batch_size, seq = plan.params.sequence_length))]
#[allow(clippy::too_many_arguments)]
pub(crate) fn apply_attention<T: Element>(
    plan: &AttentionPlan<'_, T>,
    qkv: &PreparedQkv<'_>,
    key_cache: &mut KvCache<'_, T>,
    value_cache: &mut KvCache<'_, T>,
    output: &mut [T],
    output_qk: Option<&mut [f32]>,
    allocator: &dyn ScratchAllocator,
    pool: &ThreadPool,
) -> Result<()> {
    let p = plan.params;
    let (batch, heads, seq) = (p.batch_size, p.num_heads, p.sequence_length);
    let total = p.probs_len();
    let kv_new = p.kv_sequence_length;

    if output.len() != batch * seq * heads * p.v_head_size {
        return Err(Error::invalid(
            "output",
            format!(
                "holds {} elements, expected {}",
                output.len(),
                batch * seq * heads * p.v_head_size
            ),
        ));
    }

    key_cache.append(&qkv.k, kv_new, plan.offsets, pool)?;
    value_cache.append(&qkv.v, kv_new, plan.offsets, pool)?;
    let kv_len: Vec<usize> = plan.offsets.iter().map(|&o| o + kv_new).collect();

    let mask = if plan.mask.is_active() {
        let mut states = Scratch::<KeyState>::zeroed(allocator, batch * seq * total, "mask")?;
        let mut dead = Scratch::<bool>::zeroed(allocator, batch * seq, "mask rows")?;
        plan.mask.fill(&mut states, &mut dead);
        let masked_rows = dead.iter().filter(|&&d| d).count();
        if masked_rows > 0 {
            debug!(masked_rows, "fully masked query rows produce zero output");
        }
        Some((states, dead))
    } else {
        None
    };

    let mut probs = Scratch::<f32>::zeroed(allocator, batch * heads * seq * total, "attention_probs")?;
    let key_view = key_cache.view();
    let scores = ScoreInputs {
        q: &qkv.q,
        keys: KvReader::new(key_view, p.group_size(), plan.indirection),
        mask: mask.as_ref().map(|(states, _)| &states[..]),
        attention_bias: plan.attention_bias,
        kv_len: &kv_len,
    };
    let score_dims = ScoreDims {
        num_heads: heads,
        seq_len: seq,
        total_len: total,
        head_size: p.head_size,
        alpha: p.resolved_scale(),
        filter_value: p.mask_filter_value,
    };
    compute_scores(&mut probs, &scores, score_dims, pool);

    if let Some(qk) = output_qk {
        if qk.len() != probs.len() {
            return Err(Error::invalid(
                "output_qk",
                format!("holds {} elements, expected {}", qk.len(), probs.len()),
            ));
        }
        qk.copy_from_slice(&probs);
    }
    normalize(
        &mut probs,
        mask.as_ref().map(|(_, dead)| &dead[..]),
        heads,
        seq,
        total,
        pool,
    );
    drop(mask);

    let value_dims = ValueDims {
        num_heads: heads,
        seq_len: seq,
        total_len: total,
        v_head_size: p.v_head_size,
    };
    let mut tmp = Scratch::<f32>::zeroed(allocator, batch * heads * seq * p.v_head_size, "attention_out")?;
    let value_view = value_cache.view();
    let values = KvReader::new(value_view, p.group_size(), plan.indirection);
    weighted_values(&mut tmp, &probs, &values, &kv_len, value_dims, pool);
    transpose_heads(output, &tmp, value_dims, pool);

    Ok(())
}
