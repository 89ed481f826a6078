//! Reusable resources shared by the forwarders.

pub mod buffer;
pub mod conn;

pub use buffer::{AdaptiveBufferPool, BufferTier, PooledBuffer};
pub use conn::{ConnPool, PoolMetrics, PooledConn};
