//! I/O utilities for the data plane
//!
//! The bridge between a user connection and its tunnel stream (and, on the
//! client, between a tunnel stream and the locally dialed socket) runs
//! through [`splice`]: tokio's bidirectional copy with fixed buffer sizing
//! and named byte counters.

mod splice;

pub use splice::{splice, splice_with_buffer, SpliceOutcome};

/// Default per-direction buffer size for splices
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;
