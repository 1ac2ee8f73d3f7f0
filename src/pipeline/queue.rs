//! Scheduling policy for capability calls.
//!
//! Every per-row and per-image call goes through a [`CallQueue`]. The
//! pipeline uses a single worker: at most one call is in flight, and results
//! come back in submission order. Widening the queue only changes how many
//! calls overlap, never the order of results.

use futures::stream::{self, StreamExt};
use std::future::Future;

/// Ordered, bounded-concurrency call queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallQueue {
    workers: usize,
}

impl Default for CallQueue {
    fn default() -> Self {
        Self::single_worker()
    }
}

impl CallQueue {
    /// One call at a time.
    pub fn single_worker() -> Self {
        Self { workers: 1 }
    }

    /// Up to `workers` calls at a time (at least one).
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `call` over `items`, returning outputs in item order.
    pub async fn run<I, T, F, Fut>(&self, items: I, call: F) -> Vec<Fut::Output>
    where
        I: IntoIterator<Item = T>,
        F: FnMut(T) -> Fut,
        Fut: Future,
    {
        stream::iter(items.into_iter().map(call))
            .buffered(self.workers)
            .collect()
            .await
    }
}
