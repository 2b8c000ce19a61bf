//! Adaptive Storage Pool
//!
//! Opcode lists and tracking frames churn constantly while a UI renders:
//! every formula evaluation needs a frame, every registration may need a
//! list. The pool keeps released storage around for reuse instead of
//! handing it back to the allocator.
//!
//! # Growth
//!
//! The pool retains at most `limit` items. It starts at the configured
//! `initial` size and doubles whenever a run of misses (acquire on an empty
//! pool) exceeds the current limit, so workloads with high churn earn a
//! larger pool. The limit never exceeds the configured `max`, which caps
//! worst-case retained memory.

use crate::config::PoolConfig;

/// Storage that can be reset to an empty state for reuse.
pub trait Recycle: Default {
    /// Clear contents while keeping allocated capacity.
    fn recycle(&mut self);
}

impl<T> Recycle for Vec<T> {
    fn recycle(&mut self) {
        self.clear();
    }
}

/// A bounded free-list of reusable storage.
#[derive(Debug)]
pub struct Pool<T: Recycle> {
    free: Vec<T>,
    limit: usize,
    max: usize,
    misses: usize,
}

impl<T: Recycle> Pool<T> {
    /// Create a pool with the given retention bounds.
    pub fn new(config: PoolConfig) -> Self {
        let max = config.max;
        Self {
            free: Vec::new(),
            limit: config.initial.min(max),
            max,
            misses: 0,
        }
    }

    /// Take an empty item, reusing released storage when available.
    pub fn acquire(&mut self) -> T {
        match self.free.pop() {
            Some(item) => {
                self.misses = 0;
                item
            }
            None => {
                self.misses += 1;
                if self.misses > self.limit && self.limit < self.max {
                    self.limit = (self.limit.max(1) * 2).min(self.max);
                    self.misses = 0;
                    tracing::trace!(limit = self.limit, "storage pool grew");
                }
                T::default()
            }
        }
    }

    /// Return an item to the pool. Returns `false` if it was dropped instead.
    pub fn release(&mut self, mut item: T) -> bool {
        if self.free.len() >= self.limit {
            return false;
        }
        item.recycle();
        self.free.push(item);
        true
    }

    /// Number of items currently available for reuse.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Current retention limit.
    pub fn limit(&self) -> usize {
        self.limit
    }
}
