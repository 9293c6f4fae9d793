// src/load_balancer/least_connections.rs
use std::sync::Arc;

use crate::proxy::{Backend, BackendPool};

use super::algorithm::{SelectionError, SelectionPolicy};

/// Least-connections selection. Picks the alive backend with the
/// smallest open-connection counter, breaking ties by lowest index. The
/// counter lives on `Backend` itself, so this policy holds no state of
/// its own and reads an eventually-consistent snapshot of counters — the
/// decision is advisory, not a hard guarantee under concurrent selection.
#[derive(Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl SelectionPolicy for LeastConnections {
    fn next(&self, pool: &BackendPool) -> Result<Arc<Backend>, SelectionError> {
        let snapshot = pool.snapshot();
        if snapshot.is_empty() {
            return Err(SelectionError::EmptyPool);
        }

        let mut best: Option<(usize, usize)> = None;
        for (idx, backend) in snapshot.iter().enumerate() {
            if !backend.is_alive() {
                continue;
            }
            let conns = backend.open_connections();
            match best {
                None => best = Some((idx, conns)),
                Some((_, best_conns)) if conns < best_conns => best = Some((idx, conns)),
                _ => {}
            }
        }

        match best {
            Some((idx, _)) => Ok(snapshot[idx].clone()),
            None => Err(SelectionError::AllDown),
        }
    }

    fn name(&self) -> &'static str {
        "least-connections"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(n: usize) -> BackendPool {
        let backends = (0..n)
            .map(|i| Arc::new(Backend::new(&format!("http://127.0.0.1:{}", 8081 + i)).unwrap()))
            .collect();
        BackendPool::new(backends)
    }

    #[test]
    fn empty_pool_errors() {
        let policy = LeastConnections::new();
        let pool = BackendPool::empty();
        assert_eq!(policy.next(&pool), Err(SelectionError::EmptyPool));
    }

    #[test]
    fn picks_backend_with_fewest_connections() {
        let policy = LeastConnections::new();
        let pool = pool_of(3);
        let snapshot = pool.snapshot();
        snapshot[0].increment_connections();
        snapshot[0].increment_connections();
        snapshot[1].increment_connections();
        // snapshot[2] has zero connections.

        let picked = policy.next(&pool).unwrap();
        assert_eq!(picked.id, snapshot[2].id);
    }

    #[test]
    fn ties_break_by_lowest_index() {
        let policy = LeastConnections::new();
        let pool = pool_of(3);
        let snapshot = pool.snapshot();

        let picked = policy.next(&pool).unwrap();
        assert_eq!(picked.id, snapshot[0].id);
    }

    #[test]
    fn skips_dead_backends_even_with_fewer_connections() {
        let policy = LeastConnections::new();
        let pool = pool_of(2);
        let snapshot = pool.snapshot();
        crate::proxy::backend::apply_health_outcome(&snapshot[0], false);
        crate::proxy::backend::apply_health_outcome(&snapshot[0], false);
        snapshot[1].increment_connections();

        let picked = policy.next(&pool).unwrap();
        assert_eq!(picked.id, snapshot[1].id);
    }

    #[test]
    fn all_down_errors() {
        let policy = LeastConnections::new();
        let pool = pool_of(2);
        let snapshot = pool.snapshot();
        for backend in snapshot.iter() {
            crate::proxy::backend::apply_health_outcome(backend, false);
            crate::proxy::backend::apply_health_outcome(backend, false);
        }

        assert_eq!(policy.next(&pool), Err(SelectionError::AllDown));
    }

    #[test]
    fn counter_returns_to_zero_after_completion() {
        let pool = pool_of(1);
        let snapshot = pool.snapshot();
        snapshot[0].increment_connections();
        assert_eq!(snapshot[0].open_connections(), 1);
        snapshot[0].decrement_connections();
        assert_eq!(snapshot[0].open_connections(), 0);
    }
}
