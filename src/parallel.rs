//! Worker pool with a cost-model driven parallel-for
//!
//! Attention work is split per `(batch, head)` pair. Each unit carries a
//! [`TensorOpCost`] estimate; units are grouped into blocks large enough to
//! amortize scheduling, and jobs whose total cost is tiny run inline on the
//! calling thread. Every call blocks until all blocks have finished.

use std::ops::Range;
use std::sync::Arc;

use rayon::prelude::*;

use crate::error::{Error, Result};

/// Below this many estimated cycles a job is not worth dispatching.
const MIN_PARALLEL_CYCLES: f64 = 50_000.0;
/// Target amount of work per scheduled block.
const TARGET_BLOCK_CYCLES: f64 = 40_000.0;
/// Blocks per worker, for load balancing uneven units.
const BLOCKS_PER_THREAD: usize = 4;

const LOAD_CYCLES_PER_BYTE: f64 = 0.25;
const STORE_CYCLES_PER_BYTE: f64 = 0.25;

/// Per-unit cost estimate used to size parallel blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TensorOpCost {
    pub bytes_loaded: f64,
    pub bytes_stored: f64,
    pub compute_cycles: f64,
}

impl TensorOpCost {
    pub fn total_cycles(&self) -> f64 {
        self.compute_cycles
            + self.bytes_loaded * LOAD_CYCLES_PER_BYTE
            + self.bytes_stored * STORE_CYCLES_PER_BYTE
    }
}

#[derive(Clone)]
enum Workers {
    Inline,
    Global,
    Dedicated(Arc<rayon::ThreadPool>),
}

/// Shared worker pool handle. Cloning is cheap.
#[derive(Clone)]
pub struct ThreadPool {
    workers: Workers,
}

impl Default for ThreadPool {
    /// Uses rayon's global pool.
    fn default() -> Self {
        Self {
            workers: Workers::Global,
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("num_threads", &self.num_threads())
            .finish()
    }
}

impl ThreadPool {
    /// Dedicated pool with `num_threads` workers (0 picks rayon's default).
    pub fn new(num_threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("kvattn-worker-{i}"))
            .build()
            .map_err(|e| Error::ThreadPool {
                reason: e.to_string(),
            })?;
        Ok(Self {
            workers: Workers::Dedicated(Arc::new(pool)),
        })
    }

    /// Runs everything on the calling thread.
    pub fn sequential() -> Self {
        Self {
            workers: Workers::Inline,
        }
    }

    pub fn num_threads(&self) -> usize {
        match &self.workers {
            Workers::Inline => 1,
            Workers::Global => rayon::current_num_threads(),
            Workers::Dedicated(pool) => pool.current_num_threads(),
        }
    }

    /// Units per block for `total` units of the given cost, or `None` when the
    /// job should run inline.
    fn block_size(&self, total: usize, cost: &TensorOpCost) -> Option<usize> {
        let threads = self.num_threads();
        if threads <= 1 || total <= 1 {
            return None;
        }
        let unit_cycles = cost.total_cycles().max(1.0);
        if unit_cycles * total as f64 <= MIN_PARALLEL_CYCLES {
            return None;
        }
        let min_units = (TARGET_BLOCK_CYCLES / unit_cycles).ceil().max(1.0) as usize;
        let balanced = total.div_ceil(threads * BLOCKS_PER_THREAD);
        let block = min_units.max(balanced);
        (block < total).then_some(block)
    }

    fn install<R: Send>(&self, job: impl FnOnce() -> R + Send) -> R {
        match &self.workers {
            Workers::Dedicated(pool) => pool.install(job),
            _ => job(),
        }
    }

    /// Calls `f` on disjoint sub-ranges covering `0..total`.
    pub fn parallel_for<F>(&self, total: usize, cost: &TensorOpCost, f: F)
    where
        F: Fn(Range<usize>) + Send + Sync,
    {
        if total == 0 {
            return;
        }
        let Some(block) = self.block_size(total, cost) else {
            f(0..total);
            return;
        };
        let blocks = total.div_ceil(block);
        self.install(|| {
            (0..blocks).into_par_iter().for_each(|b| {
                let start = b * block;
                f(start..(start + block).min(total));
            })
        });
    }

    /// Calls `f(index, chunk)` for every `chunk_len`-sized chunk of `data`.
    /// Chunks are disjoint, so `f` may write its chunk without synchronization.
    pub fn parallel_for_chunks_mut<T, F>(
        &self,
        data: &mut [T],
        chunk_len: usize,
        cost: &TensorOpCost,
        f: F,
    ) where
        T: Send,
        F: Fn(usize, &mut [T]) + Send + Sync,
    {
        if chunk_len == 0 || data.is_empty() {
            return;
        }
        let total = data.len().div_ceil(chunk_len);
        let Some(block) = self.block_size(total, cost) else {
            data.chunks_mut(chunk_len)
                .enumerate()
                .for_each(|(i, chunk)| f(i, chunk));
            return;
        };
        self.install(|| {
            data.par_chunks_mut(chunk_len)
                .enumerate()
                .with_min_len(block)
                .for_each(|(i, chunk)| f(i, chunk))
        });
    }
}
