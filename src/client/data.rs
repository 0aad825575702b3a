//! Client side of the data plane
//!
//! The server opens one stream per user connection and starts it with a
//! single line naming the dial target. The line is read byte by byte, up to
//! and including the first `\n`: with no buffered reader in front of the
//! stream there is no residue to lose, and the first payload byte after the
//! newline is still in the stream when the splice starts.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio_yamux::stream::StreamHandle;
use tracing::{debug, warn};

use crate::io::splice;

/// Longest accepted dial target line, newline excluded
///
/// A `host:port` fits comfortably; anything longer is a corrupt stream.
pub(crate) const MAX_DIAL_TARGET_LEN: usize = 256;

/// Read the dial preamble: one line, terminated by `\n`
///
/// Whitespace around the target is trimmed. Reads exactly up to the
/// newline, never past it.
pub(crate) async fn read_dial_target<S>(stream: &mut S) -> std::io::Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(32);
    let mut byte = [0u8; 1];

    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed before dial target line",
            ));
        }
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= MAX_DIAL_TARGET_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "dial target line too long",
            ));
        }
        line.push(byte[0]);
    }

    let target = String::from_utf8(line).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "dial target is not valid UTF-8",
        )
    })?;
    Ok(target.trim().to_string())
}

/// Bridge one data stream to a locally dialed socket
///
/// A bad preamble or a failed local dial closes the stream (by dropping
/// it), which the server observes as the user connection going away. No
/// retry: the user simply reconnects.
pub(crate) async fn handle_data_stream(mut stream: StreamHandle) {
    let target = match read_dial_target(&mut stream).await {
        Ok(target) => target,
        Err(err) => {
            debug!(error = %err, "bad data stream preamble");
            return;
        }
    };
    debug!(target = %target, "data stream request");

    let mut local = match TcpStream::connect(&target).await {
        Ok(conn) => conn,
        Err(err) => {
            warn!(target = %target, error = %err, "failed to dial local target");
            return;
        }
    };
    let _ = local.set_nodelay(true);

    match splice(&mut stream, &mut local).await {
        Ok(done) => debug!(
            target = %target,
            from_server = done.from_a,
            to_server = done.from_b,
            "data stream finished"
        ),
        Err(err) => debug!(target = %target, error = %err, "data stream aborted"),
    }
}
