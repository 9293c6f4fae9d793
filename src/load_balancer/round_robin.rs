// src/load_balancer/round_robin.rs
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

use crate::proxy::{Backend, BackendPool};

use super::algorithm::{SelectionError, SelectionPolicy};

/// Round-robin selection. Cursor starts at -1 so the first `next` call
/// returns index 0. The cursor advance is a CAS loop: two concurrent
/// `next` calls never return the same index twice in a row, and the
/// cursor never skips a position.
pub struct RoundRobin {
    cursor: AtomicIsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            cursor: AtomicIsize::new(-1),
        }
    }

    /// Index returned by the most recent successful `next` call.
    pub fn current_index(&self) -> isize {
        self.cursor.load(Ordering::Acquire)
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionPolicy for RoundRobin {
    fn next(&self, pool: &BackendPool) -> Result<Arc<Backend>, SelectionError> {
        let snapshot = pool.snapshot();
        let n = snapshot.len();
        if n == 0 {
            return Err(SelectionError::EmptyPool);
        }

        loop {
            let cur = self.cursor.load(Ordering::Acquire);
            let start = (cur + 1).rem_euclid(n as isize) as usize;

            let found = (0..n)
                .map(|offset| (start + offset) % n)
                .find(|&idx| snapshot[idx].is_alive());

            let idx = match found {
                Some(idx) => idx,
                None => return Err(SelectionError::AllDown),
            };

            if self
                .cursor
                .compare_exchange(cur, idx as isize, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(snapshot[idx].clone());
            }
            // Lost the race to a concurrent `Next`; retry with a fresh cursor.
        }
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}
