// src/load_balancer/mod.rs
mod algorithm;
mod least_connections;
mod round_robin;

pub use algorithm::{SelectionError, SelectionPolicy};
pub use least_connections::LeastConnections;
pub use round_robin::RoundRobin;

use crate::config::Algorithm;

/// Builds the configured `SelectionPolicy`.
pub fn build_policy(algorithm: Algorithm) -> Box<dyn SelectionPolicy> {
    match algorithm {
        Algorithm::RoundRobin => Box::new(RoundRobin::new()),
        Algorithm::LeastConnections => Box::new(LeastConnections::new()),
    }
}
