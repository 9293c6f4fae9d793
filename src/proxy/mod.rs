//
// src/proxy/mod.rs
//
pub mod affinity;
pub mod backend;
pub mod pool;
mod proxy;

pub use affinity::SessionAffinity;
pub use backend::Backend;
pub use pool::BackendPool;
pub use proxy::{Dispatcher, ProxyError};
