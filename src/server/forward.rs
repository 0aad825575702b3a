//! Server side of the data plane
//!
//! Each user connection accepted on a public port becomes one fresh stream
//! on the owning session: the stream starts with a single preamble line
//! naming the dial target, then carries raw bytes in both directions until
//! either side closes.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::registry::CoreState;
use crate::io::splice;

/// Bridge one user connection to the client that owns the public port
///
/// Failures here affect only this connection: a missing session or a failed
/// stream open drops the user socket and nothing else.
pub(crate) async fn handle_user_connection(
    state: Arc<CoreState>,
    mut user_conn: TcpStream,
    peer: SocketAddr,
    public_port: u16,
    client_id: String,
    target_addr: String,
) {
    let Some(session) = state.get_client(&client_id) else {
        debug!(port = public_port, client = %client_id, "user connection for missing session dropped");
        return;
    };

    let mut stream = match session.mux.open_stream().await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(port = public_port, client = %client_id, error = %err, "failed to open data stream");
            return;
        }
    };

    // Dial preamble: one ASCII line, `IP:port\n`, no carriage return.
    let preamble = format!("{target_addr}\n");
    if let Err(err) = stream.write_all(preamble.as_bytes()).await {
        warn!(port = public_port, client = %client_id, error = %err, "failed to send dial target");
        return;
    }

    debug!(port = public_port, user = %peer, target = %target_addr, "bridging user connection");

    match splice(&mut user_conn, &mut stream).await {
        Ok(done) => debug!(
            port = public_port,
            user = %peer,
            up = done.from_a,
            down = done.from_b,
            "user connection finished"
        ),
        Err(err) => debug!(port = public_port, user = %peer, error = %err, "user connection aborted"),
    }
}
