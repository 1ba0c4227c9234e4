//! Scoped scratch memory for attention calls
//!
//! Every buffer the orchestrator needs (probabilities, mask bias, per-head
//! output) is taken from a [`ScratchAllocator`] and returned to it when the
//! [`Scratch`] guard drops, so no scratch outlives the call that created it,
//! including on early error returns.

use std::mem::size_of;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Statistics for a scratch allocator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScratchStats {
    pub bytes_in_use: usize,
    pub peak_bytes: usize,
    pub total_allocations: usize,
    pub limit_bytes: Option<usize>,
}

/// Accounting interface for temporary buffers.
pub trait ScratchAllocator: Send + Sync {
    /// Claim `bytes` for the buffer named `what`.
    fn reserve(&self, bytes: usize, what: &'static str) -> Result<()>;
    fn release(&self, bytes: usize);
    fn stats(&self) -> ScratchStats;
}

#[derive(Debug, Default)]
struct ScratchState {
    bytes_in_use: usize,
    peak_bytes: usize,
    total_allocations: usize,
}

/// Heap-backed scratch allocator with an optional byte limit
#[derive(Debug, Clone, Default)]
pub struct CpuScratchAllocator {
    state: Arc<Mutex<ScratchState>>,
    limit_bytes: Option<usize>,
}

impl CpuScratchAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails any reservation that would push usage above `limit_bytes`.
    pub fn with_limit(limit_bytes: usize) -> Self {
        Self {
            state: Arc::default(),
            limit_bytes: Some(limit_bytes),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScratchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ScratchAllocator for CpuScratchAllocator {
    fn reserve(&self, bytes: usize, what: &'static str) -> Result<()> {
        let mut state = self.lock();
        let requested = state.bytes_in_use.saturating_add(bytes);
        if let Some(limit) = self.limit_bytes {
            if requested > limit {
                return Err(Error::AllocationFailure {
                    bytes,
                    reason: format!(
                        "{what}: {} bytes in use, limit is {limit}",
                        state.bytes_in_use
                    ),
                });
            }
        }
        state.bytes_in_use = requested;
        state.peak_bytes = state.peak_bytes.max(requested);
        state.total_allocations += 1;
        Ok(())
    }

    fn release(&self, bytes: usize) {
        let mut state = self.lock();
        state.bytes_in_use = state.bytes_in_use.saturating_sub(bytes);
    }

    fn stats(&self) -> ScratchStats {
        let state = self.lock();
        ScratchStats {
            bytes_in_use: state.bytes_in_use,
            peak_bytes: state.peak_bytes,
            total_allocations: state.total_allocations,
            limit_bytes: self.limit_bytes,
        }
    }
}

/// A zero-initialized buffer whose reservation is released on drop.
pub struct Scratch<'a, T> {
    buf: Vec<T>,
    bytes: usize,
    allocator: &'a dyn ScratchAllocator,
}

impl<'a, T: Copy + Default> Scratch<'a, T> {
    pub fn zeroed(allocator: &'a dyn ScratchAllocator, len: usize, what: &'static str) -> Result<Self> {
        let bytes = len
            .checked_mul(size_of::<T>())
            .ok_or_else(|| Error::AllocationFailure {
                bytes: usize::MAX,
                reason: format!("{what}: size of {len} elements overflows"),
            })?;
        allocator.reserve(bytes, what)?;

        let mut buf = Vec::new();
        if let Err(e) = buf.try_reserve_exact(len) {
            allocator.release(bytes);
            return Err(Error::AllocationFailure {
                bytes,
                reason: format!("{what}: {e}"),
            });
        }
        buf.resize(len, T::default());
        tracing::trace!(what, bytes, "scratch buffer acquired");

        Ok(Self {
            buf,
            bytes,
            allocator,
        })
    }
}

impl<T> Deref for Scratch<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.buf
    }
}

impl<T> DerefMut for Scratch<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.buf
    }
}

impl<T> Drop for Scratch<'_, T> {
    fn drop(&mut self) {
        self.allocator.release(self.bytes);
    }
}
