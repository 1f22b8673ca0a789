//! Connection reuse.
//!
//! - [`Connection`]: one established transport and its stream bookkeeping
//! - [`ConnectionPool`]: connections grouped by endpoint identity, idle sweeper
//! - [`Lease`]: a claimed stream, released on drop

pub mod connection;
pub mod connection_pool;

pub use connection::{Connection, DEFAULT_MAX_STREAMS};
pub use connection_pool::{ConnectionPool, Lease, PoolConfig, PoolStats};
