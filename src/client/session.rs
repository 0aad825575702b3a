//! Session dialer and lifecycle
//!
//! `connect_server` performs the client half of the session setup contract:
//! open the forward control stream first, hand it to an RPC client, call
//! `Handshake`, and only then start accepting inbound streams — the first
//! of which is the reverse control stream the server opened, every later
//! one a data stream.
//!
//! A fixed-interval ticker redials while disconnected; there is no backoff,
//! the five-second cadence is the contract. Each successful connect re-syncs
//! the full local service list so the server can rebuild its listeners.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use super::data;
use super::state::{ClientEvent, ClientState, ServerLink};
use crate::error::{RpcError, SessionError};
use crate::mux::MuxConnection;
use crate::proto::{self, BaseArgs, BaseReply, PushConfigArgs};
use crate::rpc::{self, decode_params, encode_result, RpcClient, RpcHandler};

/// Redial cadence while disconnected
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Cadence of liveness probes on a live session
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A heartbeat slower than this tears the session down
pub const HEARTBEAT_DEADLINE: Duration = Duration::from_secs(10);

/// Dial the server and establish a session
///
/// No-op when already connected. On success the stream acceptor and the
/// heartbeat task are running and [`ClientEvent::Connected`] has fired.
///
/// # Errors
///
/// - [`SessionError::TransportDown`] when the TCP dial fails
/// - [`SessionError::VersionMismatch`] when the server rejects the protocol
///   version
/// - [`SessionError::HandshakeRejected`] when the server refuses the
///   registration
pub async fn connect_server(state: Arc<ClientState>) -> Result<(), SessionError> {
    let _guard = state.connect_guard().lock().await;
    if state.is_connected() {
        return Ok(());
    }

    let addr = state.server_addr();
    debug!(server = %addr, "dialing server");
    let conn = TcpStream::connect(&addr)
        .await
        .map_err(SessionError::TransportDown)?;
    let _ = conn.set_nodelay(true);

    let mux = MuxConnection::client(conn);
    let handle = mux.handle();

    // Forward control stream: ours to open, before any RPC.
    let forward = handle.open_stream().await?;
    let rpc = Arc::new(RpcClient::new(forward));

    let args = state.handshake_args();
    let reply: BaseReply = match rpc.call(proto::methods::HANDSHAKE, &args).await {
        Ok(reply) => reply,
        Err(RpcError::Remote(message)) => {
            handle.close().await;
            return Err(if message.contains("version mismatch") {
                SessionError::VersionMismatch(message)
            } else {
                SessionError::HandshakeRejected(message)
            });
        }
        Err(err) => {
            handle.close().await;
            return Err(SessionError::Rpc(err));
        }
    };
    if !reply.success {
        handle.close().await;
        return Err(SessionError::HandshakeRejected(reply.message));
    }
    info!(server = %addr, message = %reply.message, "handshake complete");

    state.set_link(ServerLink {
        mux: handle.clone(),
        rpc: rpc.clone(),
    });

    // The server opens the reverse control stream right after the
    // handshake; the acceptor below picks it up from the queue.
    tokio::spawn(run_stream_acceptor(state.clone(), mux));
    tokio::spawn(run_heartbeat(state.clone(), rpc, handle.id()));

    state.emit(&ClientEvent::Connected);
    Ok(())
}

/// Send the full local service list to the server
///
/// # Errors
///
/// Returns [`SessionError::SessionGone`] when not connected, or the RPC
/// failure.
pub async fn sync_services(state: &Arc<ClientState>) -> Result<(), SessionError> {
    let Some((rpc, args)) = state.sync_snapshot() else {
        return Err(SessionError::SessionGone);
    };

    debug!(services = args.services.len(), "syncing services");
    let reply: BaseReply = rpc.call(proto::methods::SYNC_CONFIG, &args).await?;
    if !reply.success {
        warn!(message = %reply.message, "server rejected service sync");
    }
    Ok(())
}

/// Redial every [`RECONNECT_INTERVAL`] while disconnected
///
/// Failures are classified by the recovery policy: a dead transport is
/// retried at the next tick, while a handshake rejection or version
/// mismatch cannot be fixed by redialing, so the loop surfaces it and
/// ends.
pub async fn run_reconnect_loop(state: Arc<ClientState>) {
    let mut ticker = tokio::time::interval(RECONNECT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if state.is_connected() {
            continue;
        }

        match connect_server(state.clone()).await {
            Ok(()) => {
                if let Err(err) = sync_services(&state).await {
                    warn!(error = %err, "service sync after reconnect failed");
                }
            }
            Err(err) if err.is_recoverable() => {
                debug!(error = %err, "reconnect attempt failed");
            }
            Err(err) => {
                error!(error = %err, "server refused the session, stopping reconnect attempts");
                return;
            }
        }
    }
}

/// Dispatch inbound streams for the session's lifetime
///
/// The multiplexer does not tag streams; position disambiguates. The first
/// inbound stream after connect is the reverse control stream, every
/// subsequent one is a data stream.
async fn run_stream_acceptor(state: Arc<ClientState>, mut mux: MuxConnection) {
    let session_id = mux.handle().id();
    let mut first = true;

    while let Some(stream) = mux.accept_stream().await {
        if first {
            first = false;
            let handler = Arc::new(ClientRpcHandler {
                state: state.clone(),
            });
            tokio::spawn(async move {
                if let Err(err) = rpc::serve(stream, handler).await {
                    debug!(error = %err, "reverse control stream failed");
                }
            });
        } else {
            tokio::spawn(data::handle_data_stream(stream));
        }
    }

    debug!("server session ended");
    state.drop_link(session_id);
}

/// Probe the session; a missed deadline tears it down
///
/// Detects half-open sessions much earlier than TCP keepalive would. The
/// task ends by itself once the link it was started for is gone.
async fn run_heartbeat(state: Arc<ClientState>, rpc: Arc<RpcClient>, session_id: u64) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; the handshake just proved the
    // session alive, so skip it.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let still_current = state
            .link()
            .is_some_and(|link| link.mux.id() == session_id);
        if !still_current {
            return;
        }

        let args = BaseArgs {
            client_id: state.client_id(),
        };
        let probe = tokio::time::timeout(
            HEARTBEAT_DEADLINE,
            rpc.call::<_, BaseReply>(proto::methods::HEARTBEAT, &args),
        )
        .await;

        match probe {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                warn!(error = %err, "heartbeat failed, dropping session");
                state.drop_link(session_id);
                return;
            }
            Err(_) => {
                warn!("heartbeat deadline exceeded, dropping session");
                state.drop_link(session_id);
                return;
            }
        }
    }
}

/// RPC surface the server invokes on the reverse control stream
struct ClientRpcHandler {
    state: Arc<ClientState>,
}

#[async_trait]
impl RpcHandler for ClientRpcHandler {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            proto::methods::PUSH_CONFIG => {
                let args: PushConfigArgs = decode_params(params)?;
                info!(services = args.services.len(), "config pushed by server");
                self.state.replace_services(args.services);
                encode_result(&BaseReply::ok(""))
            }
            other => Err(RpcError::UnknownMethod(other.to_string())),
        }
    }
}
