//! Bidirectional splice for the data plane
//!
//! The pumping itself is delegated to tokio's bidirectional copy, which has
//! exactly the semantics a tunnel bridge needs: both directions move inside
//! one future, an EOF on one side is propagated as a shutdown of the other
//! side's write half while the opposite direction keeps draining, and an
//! I/O error ends the whole transfer so the caller drops both ends. This
//! wrapper pins the buffer sizing and names the byte counters for logging.

use std::io;

use tokio::io::{copy_bidirectional_with_sizes, AsyncRead, AsyncWrite};

use super::DEFAULT_BUFFER_SIZE;

/// Byte counters of a finished splice
#[derive(Debug, Clone, Copy)]
pub struct SpliceOutcome {
    /// Bytes read from side A and delivered to side B
    pub from_a: u64,
    /// Bytes read from side B and delivered to side A
    pub from_b: u64,
}

impl SpliceOutcome {
    /// Total bytes moved in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.from_a + self.from_b
    }
}

/// Splice two streams until both directions reach EOF
///
/// # Errors
///
/// Returns the first I/O error hit by either direction; the transfer stops
/// as a whole and the caller is expected to drop both streams.
pub async fn splice<A, B>(a: &mut A, b: &mut B) -> io::Result<SpliceOutcome>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    splice_with_buffer(a, b, DEFAULT_BUFFER_SIZE).await
}

/// Same as [`splice`] with a custom per-direction buffer size
///
/// # Errors
///
/// Returns the first I/O error hit by either direction.
pub async fn splice_with_buffer<A, B>(
    a: &mut A,
    b: &mut B,
    buf_size: usize,
) -> io::Result<SpliceOutcome>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (from_a, from_b) = copy_bidirectional_with_sizes(a, b, buf_size, buf_size).await?;
    Ok(SpliceOutcome { from_a, from_b })
}
