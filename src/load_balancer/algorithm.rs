// src/load_balancer/algorithm.rs
use std::sync::Arc;

use crate::proxy::{Backend, BackendPool};

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum SelectionError {
    #[error("no backends configured")]
    EmptyPool,
    #[error("no backend is currently alive")]
    AllDown,
}

/// Picks the next backend to route a request to. Selection never blocks
/// on I/O — both concrete policies only ever touch atomics and a pool
/// snapshot — so this trait carries no `async` in its signature.
pub trait SelectionPolicy: Send + Sync {
    fn next(&self, pool: &BackendPool) -> Result<Arc<Backend>, SelectionError>;

    fn name(&self) -> &'static str;
}
