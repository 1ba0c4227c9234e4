//! KV cache strategies
//!
//! Both strategies store keys (or values) as `[batch, kv_heads, capacity, head_size]`
//! and are written by the attention call, never allocated by it.
//!
//! ```text
//!   GrowingCache                      FixedCache (shared buffer)
//!   past    [B, N, P, H]  (read-only) buffer [B, N, M, H]  (in place)
//!   present [B, N, T, H]
//!     rows [0, P)  <- past            rows [0, P)  untouched
//!     rows [P, T)  <- new tokens      rows [P, P+L) <- new tokens
//! ```
//!
//! Writes beyond capacity are rejected; the fixed buffer never wraps.

mod indirection;

pub use indirection::BeamIndirection;

use crate::error::{Error, Result};
use crate::parallel::{TensorOpCost, ThreadPool};
use crate::tensor::{Element, TensorView, TensorViewMut};

fn check_rank4(arg: &'static str, shape: &[usize]) -> Result<()> {
    if shape.len() != 4 {
        return Err(Error::invalid(
            arg,
            format!(
                "expected 4D [batch, heads, seq, head_size], got {}D",
                shape.len()
            ),
        ));
    }
    Ok(())
}

/// Present buffer filled from a read-only past tensor plus the new rows.
#[derive(Debug)]
pub struct GrowingCache<'a, T> {
    past: Option<TensorView<'a, T>>,
    present: TensorViewMut<'a, T>,
}

impl<'a, T: Element> GrowingCache<'a, T> {
    pub fn new(past: Option<TensorView<'a, T>>, present: TensorViewMut<'a, T>) -> Result<Self> {
        check_rank4("present", present.shape())?;
        if let Some(past) = &past {
            check_rank4("past", past.shape())?;
            let (p, q) = (past.shape(), present.shape());
            if p[0] != q[0] || p[1] != q[1] || p[3] != q[3] {
                return Err(Error::invalid(
                    "past",
                    format!("shape {p:?} is incompatible with present shape {q:?}"),
                ));
            }
        }
        Ok(Self { past, present })
    }

    /// Rows available in the past tensor.
    pub fn past_len(&self) -> usize {
        self.past.as_ref().map_or(0, |p| p.dim(2))
    }
}

/// One buffer used as both past and present, updated in place.
#[derive(Debug)]
pub struct FixedCache<'a, T> {
    buffer: TensorViewMut<'a, T>,
}

impl<'a, T: Element> FixedCache<'a, T> {
    pub fn new(buffer: TensorViewMut<'a, T>) -> Result<Self> {
        check_rank4("buffer", buffer.shape())?;
        Ok(Self { buffer })
    }
}

/// A key or value cache in one of the two storage strategies.
#[derive(Debug)]
pub enum KvCache<'a, T> {
    Growing(GrowingCache<'a, T>),
    Fixed(FixedCache<'a, T>),
}

impl<'a, T: Element> KvCache<'a, T> {
    pub fn growing(past: Option<TensorView<'a, T>>, present: TensorViewMut<'a, T>) -> Result<Self> {
        GrowingCache::new(past, present).map(KvCache::Growing)
    }

    pub fn fixed(buffer: TensorViewMut<'a, T>) -> Result<Self> {
        FixedCache::new(buffer).map(KvCache::Fixed)
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, KvCache::Fixed(_))
    }

    fn storage(&self) -> &TensorViewMut<'a, T> {
        match self {
            KvCache::Growing(c) => &c.present,
            KvCache::Fixed(c) => &c.buffer,
        }
    }

    /// Shape of the state holding prior steps, if any.
    pub fn past_shape(&self) -> Option<&[usize]> {
        match self {
            KvCache::Growing(c) => c.past.as_ref().map(|p| p.shape()),
            KvCache::Fixed(c) => Some(c.buffer.shape()),
        }
    }

    /// `[batch, kv_heads, capacity, head_size]` of the written storage.
    pub fn shape(&self) -> &[usize] {
        self.storage().shape()
    }

    pub fn capacity(&self) -> usize {
        self.storage().dim(2)
    }

    pub fn view(&self) -> TensorView<'_, T> {
        self.storage().view()
    }

    /// Writes `new_rows` (`[batch, kv_heads, new_len, head_size]`, f32) at the
    /// per-batch `offsets`. A growing cache first receives past rows `[0, offset)`.
    pub(crate) fn append(
        &mut self,
        new_rows: &[f32],
        new_len: usize,
        offsets: &[usize],
        pool: &ThreadPool,
    ) -> Result<()> {
        let [batch, heads, capacity, head_size] = match *self.shape() {
            [b, n, c, h] => [b, n, c, h],
            _ => return Err(Error::invalid("cache", "expected 4D storage")),
        };
        let expected = batch * heads * new_len * head_size;
        if new_rows.len() != expected || offsets.len() != batch {
            return Err(Error::invalid(
                "cache",
                format!(
                    "new rows hold {} elements for {} batches, cache {:?} expects {expected} for {batch}",
                    new_rows.len(),
                    offsets.len(),
                    self.shape()
                ),
            ));
        }
        let past_len = match self {
            KvCache::Growing(c) => c.past_len(),
            KvCache::Fixed(_) => capacity,
        };
        for (b, &offset) in offsets.iter().enumerate() {
            if offset + new_len > capacity {
                return Err(Error::invalid(
                    "cache",
                    format!(
                        "batch {b} writes rows [{offset}, {}) beyond capacity {capacity}",
                        offset + new_len
                    ),
                ));
            }
            if offset > past_len {
                return Err(Error::invalid(
                    "past",
                    format!("batch {b} needs {offset} past rows, past holds {past_len}"),
                ));
            }
        }

        let chunk_len = capacity * head_size;
        let elem = std::mem::size_of::<T>() as f64;
        let cost = TensorOpCost {
            bytes_loaded: (chunk_len as f64) * elem,
            bytes_stored: (chunk_len as f64) * elem,
            compute_cycles: (new_len * head_size) as f64,
        };
        let new_chunk = new_len * head_size;

        match self {
            KvCache::Growing(GrowingCache { past, present }) => {
                let past = past.as_ref();
                pool.parallel_for_chunks_mut(present.as_mut_slice(), chunk_len, &cost, |i, dst| {
                    let offset = offsets[i / heads] * head_size;
                    if let Some(src) = past.and_then(|p| p.sub(&[i / heads, i % heads])) {
                        dst[..offset].copy_from_slice(&src[..offset]);
                    }
                    let new = &new_rows[i * new_chunk..(i + 1) * new_chunk];
                    T::narrow_into(&mut dst[offset..offset + new_chunk], new);
                });
            }
            KvCache::Fixed(FixedCache { buffer }) => {
                pool.parallel_for_chunks_mut(buffer.as_mut_slice(), chunk_len, &cost, |i, dst| {
                    let offset = offsets[i / heads] * head_size;
                    let new = &new_rows[i * new_chunk..(i + 1) * new_chunk];
                    T::narrow_into(&mut dst[offset..offset + new_chunk], new);
                });
            }
        }
        Ok(())
    }
}

/// Row access into a cache view with grouped-query head mapping and
/// optional beam indirection.
#[derive(Clone, Copy)]
pub(crate) struct KvReader<'c, T> {
    cache: TensorView<'c, T>,
    group: usize,
    head_size: usize,
    indirection: Option<&'c BeamIndirection<'c>>,
}

impl<'c, T: Element> KvReader<'c, T> {
    /// `group` is the number of query heads sharing one cache head.
    pub(crate) fn new(
        cache: TensorView<'c, T>,
        group: usize,
        indirection: Option<&'c BeamIndirection<'c>>,
    ) -> Self {
        Self {
            cache,
            group: group.max(1),
            head_size: cache.dim(3),
            indirection,
        }
    }

    #[inline]
    pub(crate) fn kv_head(&self, head: usize) -> usize {
        head / self.group
    }

    /// Row holding logical position `pos` as seen by `(batch, head)`.
    #[inline]
    pub(crate) fn row(&self, batch: usize, head: usize, pos: usize) -> &'c [T] {
        let slot = match self.indirection {
            Some(ind) => ind.resolve_flat(batch, pos),
            None => batch,
        };
        let strides = self.cache.layout().strides();
        let start = slot * strides[0] + self.kv_head(head) * strides[1] + pos * strides[2];
        &self.cache.as_slice()[start..start + self.head_size]
    }
}
