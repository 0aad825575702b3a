//! Session broker
//!
//! One accept loop on the configured TCP port; every inbound connection
//! becomes a multiplexed session. Stream setup order is a protocol contract:
//! the client opens the forward control stream first, so the broker accepts
//! first and only then opens the reverse control stream (for which the
//! client already has an accept pending). Opening in the other order would
//! deadlock a conforming client.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use super::registry::{ClientIdentity, CoreState};
use crate::error::{RevportError, RpcError};
use crate::mux::{MuxConnection, MuxHandle};
use crate::proto::{
    self, BaseArgs, BaseReply, HandshakeArgs, SyncConfigArgs,
};
use crate::rpc::{self, decode_params, encode_result, RpcClient, RpcHandler};

/// Accepts tunnel clients and runs one session per connection
pub struct Broker {
    listener: TcpListener,
    state: Arc<CoreState>,
}

impl Broker {
    /// Bind the broker port
    ///
    /// # Errors
    ///
    /// Returns the bind error; failing to bind this port is the one fatal
    /// startup error the server has.
    pub async fn bind(addr: SocketAddr, state: Arc<CoreState>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, state })
    }

    /// Address the broker is listening on
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be determined.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails for good
    ///
    /// Accept errors are classified by the recovery policy: a transient one
    /// (aborted connection, interrupt) is logged and the loop continues; an
    /// unrecoverable one stops the broker and is returned to the caller.
    ///
    /// # Errors
    ///
    /// Returns the classified accept error that stopped the loop.
    pub async fn run(self) -> Result<(), RevportError> {
        loop {
            match self.listener.accept().await {
                Ok((conn, peer)) => {
                    debug!(peer = %peer, "tunnel client connected");
                    let _ = conn.set_nodelay(true);
                    tokio::spawn(handle_client(self.state.clone(), conn, peer));
                }
                Err(err) => {
                    let err = RevportError::from(err);
                    if err.is_recoverable() {
                        warn!(error = %err, "broker accept failed, retrying");
                        continue;
                    }
                    error!(error = %err, "broker accept failed, stopping");
                    return Err(err);
                }
            }
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("local_addr", &self.listener.local_addr().ok())
            .finish()
    }
}

/// Run one client session to completion
///
/// Setup order: accept forward control stream, open reverse control stream,
/// then serve RPCs on the forward stream until it closes. If any stream
/// fails during setup the session is closed without registering anything.
async fn handle_client(state: Arc<CoreState>, conn: TcpStream, peer: SocketAddr) {
    let mut mux = MuxConnection::server(conn);
    let handle = mux.handle();

    let Some(forward) = mux.accept_stream().await else {
        debug!(peer = %peer, "connection closed before control stream");
        return;
    };

    let reverse = match handle.open_stream().await {
        Ok(stream) => stream,
        Err(err) => {
            debug!(peer = %peer, error = %err, "failed to open reverse control stream");
            handle.close().await;
            return;
        }
    };
    let rpc = Arc::new(RpcClient::new(reverse));

    let context = Arc::new(ServerRpcContext {
        state: state.clone(),
        mux: handle.clone(),
        rpc,
        peer,
        client_id: Mutex::new(None),
    });

    // A conforming client opens no further streams; drain anything else so
    // the session driver never stalls on a full queue.
    tokio::spawn(async move { while mux.accept_stream().await.is_some() {} });

    if let Err(err) = rpc::serve(forward, context).await {
        debug!(peer = %peer, error = %err, "control stream failed");
    }

    debug!(peer = %peer, "client disconnected");
    state.remove_by_session(handle.id());
}

/// Per-session RPC surface invoked by the client on the forward stream
///
/// Holds everything the handlers need: the registry, the session handle,
/// the reverse-RPC client, and the rewritten client id once the handshake
/// stored it.
struct ServerRpcContext {
    state: Arc<CoreState>,
    mux: MuxHandle,
    rpc: Arc<RpcClient>,
    peer: SocketAddr,
    client_id: Mutex<Option<String>>,
}

impl ServerRpcContext {
    async fn handshake(&self, args: HandshakeArgs) -> Result<BaseReply, RpcError> {
        info!(
            client = %args.client_id,
            version = %args.version,
            name = %args.name,
            project = %args.project_name,
            "handshake"
        );

        if args.version != proto::VERSION {
            return Err(RpcError::Handler("version mismatch".into()));
        }

        // Append the remote host so clients sharing a configuration can
        // coexist; the rewritten id is the registry key from here on.
        let final_id = format!("{}@{}", args.client_id, self.peer.ip());
        info!(client = %final_id, "registering client");
        *self.client_id.lock() = Some(final_id.clone());

        self.state.add_client(
            final_id,
            self.mux.clone(),
            self.rpc.clone(),
            ClientIdentity {
                name: args.name,
                phone: args.phone,
                project_name: args.project_name,
                remark: args.remark,
            },
        );

        Ok(BaseReply::ok("Welcome"))
    }

    async fn sync_config(&self, args: SyncConfigArgs) -> Result<BaseReply, RpcError> {
        // Trust the id stored at handshake, not the one in the args: the
        // registry key was rewritten and the client does not know it.
        let target = self
            .client_id
            .lock()
            .clone()
            .unwrap_or(args.client_id);

        debug!(client = %target, services = args.services.len(), "sync config");
        self.state.clone().update_services(&target, args.services);
        Ok(BaseReply::ok(""))
    }

    #[allow(clippy::unused_async)]
    async fn heartbeat(&self, _args: BaseArgs) -> Result<BaseReply, RpcError> {
        Ok(BaseReply::ok(""))
    }
}

#[async_trait]
impl RpcHandler for ServerRpcContext {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            proto::methods::HANDSHAKE => {
                let reply = self.handshake(decode_params(params)?).await?;
                encode_result(&reply)
            }
            proto::methods::SYNC_CONFIG => {
                let reply = self.sync_config(decode_params(params)?).await?;
                encode_result(&reply)
            }
            proto::methods::HEARTBEAT => {
                let reply = self.heartbeat(decode_params(params)?).await?;
                encode_result(&reply)
            }
            other => Err(RpcError::UnknownMethod(other.to_string())),
        }
    }
}
