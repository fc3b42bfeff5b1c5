//! Resource-governance layer: a single logical RPC surface multiplexed over
//! N upstream endpoints (spec.md §4.1).

pub mod client;
pub mod pool;
pub mod rate_limiter;

pub use client::{Header, RpcClient};
pub use pool::RpcPool;
