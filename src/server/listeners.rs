//! Public port allocation and listener lifecycle
//!
//! Every advertised service of a live session owns exactly one public
//! listener on its assigned port; the table below is the single source of
//! truth for which ports are in use. Reconciliation (`update_services`)
//! turns an old service list into a new one while preserving listeners for
//! unchanged services: ports are reused by service id, removed ids have
//! their ports closed before any new listener starts.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::forward;
use super::registry::CoreState;
use crate::error::ListenerError;
use crate::proto::TargetService;

/// Highest port the allocator will consider (exclusive)
const PORT_SCAN_END: u16 = 65535;

/// One entry in the public listener table
///
/// Each entry corresponds to exactly one `(client_id, service_id)` pair.
/// Dropping or firing `shutdown` ends the accept loop, which closes the
/// socket.
pub(crate) struct ListenerEntry {
    pub(crate) client_id: String,
    pub(crate) service_id: String,
    shutdown: oneshot::Sender<()>,
}

impl CoreState {
    /// Find the first free public port at or above `port_start`
    ///
    /// A port is free when it has no table entry and an actual bind probe
    /// succeeds (the probe socket is closed immediately).
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::NoPortsAvailable`] after exhausting the
    /// range.
    pub fn allocate_port(&self) -> Result<u16, ListenerError> {
        let listeners = self.listeners.lock();

        for port in self.port_start..PORT_SCAN_END {
            if listeners.contains_key(&port) {
                continue;
            }
            if let Ok(probe) = std::net::TcpListener::bind(("0.0.0.0", port)) {
                drop(probe);
                return Ok(port);
            }
        }

        Err(ListenerError::NoPortsAvailable {
            start: self.port_start,
        })
    }

    /// Open a public listener and start its accept loop
    ///
    /// Idempotent: a port that already has a table entry is left alone. A
    /// bind failure is logged and swallowed; the service stays advertised
    /// and a later sync retries.
    pub fn start_public_listener(
        self: Arc<Self>,
        port: u16,
        client_id: String,
        service_id: String,
        target_ip: String,
        target_port: u16,
    ) {
        let mut listeners = self.listeners.lock();
        if listeners.contains_key(&port) {
            return;
        }

        let listener = match bind_public(port) {
            Ok(listener) => listener,
            Err(err) => {
                warn!(port, client = %client_id, error = %err, "failed to bind public port");
                return;
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        listeners.insert(
            port,
            ListenerEntry {
                client_id: client_id.clone(),
                service_id,
                shutdown: shutdown_tx,
            },
        );
        drop(listeners);

        let target_addr = format!("{target_ip}:{target_port}");
        info!(port, client = %client_id, target = %target_addr, "public listener started");

        tokio::spawn(run_accept_loop(
            self,
            listener,
            port,
            client_id,
            target_addr,
            shutdown_rx,
        ));
    }

    /// Close the listener on `port`, if any
    ///
    /// Tolerant of missing entries. The accept loop observes the shutdown at
    /// its next iteration and drops the socket.
    pub fn stop_public_listener(&self, port: u16) {
        let entry = self.listeners.lock().remove(&port);
        if let Some(entry) = entry {
            // A dead accept loop has already dropped its receiver.
            let _ = entry.shutdown.send(());
            info!(port, client = %entry.client_id, "public listener stopped");
        }
    }

    /// Whether a listener entry exists for `port`
    #[must_use]
    pub fn has_listener(&self, port: u16) -> bool {
        self.listeners.lock().contains_key(&port)
    }

    /// Ports currently in the listener table, sorted
    #[must_use]
    pub fn listener_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.listeners.lock().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// The `(client_id, service_id)` pair owning a listener, if any
    #[must_use]
    pub fn listener_owner(&self, port: u16) -> Option<(String, String)> {
        self.listeners
            .lock()
            .get(&port)
            .map(|entry| (entry.client_id.clone(), entry.service_id.clone()))
    }

    /// Replace a session's service list and reconcile its listeners
    ///
    /// For each incoming service with `remote_port == 0` the previous
    /// allocation for the same id is reused, otherwise a fresh port is
    /// allocated. Services whose id disappeared have their listeners closed
    /// before any new listener starts. An allocation failure leaves the
    /// service advertised with `remote_port == 0` and no listener.
    ///
    /// An unknown `client_id` is ignored: the session may have ended
    /// between the caller's lookup and this call.
    pub fn update_services(self: Arc<Self>, client_id: &str, new_services: Vec<TargetService>) {
        let reconciled = {
            let clients = self.clients.read();
            let Some(session) = clients.get(client_id) else {
                debug!(client = %client_id, "service sync for unknown client ignored");
                return;
            };

            let mut services = session.services.lock();
            let old_ports: HashMap<String, u16> = services
                .iter()
                .map(|s| (s.id.clone(), s.remote_port))
                .collect();

            let mut reconciled = Vec::with_capacity(new_services.len());
            for mut service in new_services {
                if service.remote_port == 0 {
                    match old_ports.get(&service.id) {
                        Some(&old_port) if old_port != 0 => service.remote_port = old_port,
                        _ => match self.allocate_port() {
                            Ok(port) => service.remote_port = port,
                            Err(err) => {
                                warn!(
                                    client = %client_id,
                                    service = %service.id,
                                    error = %err,
                                    "port allocation failed, service left unassigned"
                                );
                            }
                        },
                    }
                }
                reconciled.push(service);
            }

            let kept_ids: HashSet<&str> = reconciled.iter().map(|s| s.id.as_str()).collect();
            let removed_ports: Vec<u16> = services
                .iter()
                .filter(|s| !kept_ids.contains(s.id.as_str()) && s.remote_port != 0)
                .map(|s| s.remote_port)
                .collect();
            for port in removed_ports {
                self.stop_public_listener(port);
            }

            services.clone_from(&reconciled);
            reconciled
        };

        info!(client = %client_id, services = reconciled.len(), "service list synced");
        self.notify_update();

        for service in &reconciled {
            if service.remote_port != 0 {
                self.clone().start_public_listener(
                    service.remote_port,
                    client_id.to_string(),
                    service.id.clone(),
                    service.local_ip.clone(),
                    service.local_port,
                );
            }
        }
    }
}

/// Bind a public port without blocking the caller
///
/// The listener must exist before the table entry is published, so the bind
/// happens synchronously via std and is handed to tokio afterwards.
fn bind_public(port: u16) -> Result<TcpListener, ListenerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let std_listener = std::net::TcpListener::bind(addr).map_err(|e| ListenerError::Bind {
        port,
        reason: e.to_string(),
    })?;
    std_listener
        .set_nonblocking(true)
        .map_err(|e| ListenerError::Bind {
            port,
            reason: e.to_string(),
        })?;
    TcpListener::from_std(std_listener).map_err(|e| ListenerError::Bind {
        port,
        reason: e.to_string(),
    })
}

/// Accept user connections until shutdown or accept failure
async fn run_accept_loop(
    state: Arc<CoreState>,
    listener: TcpListener,
    port: u16,
    client_id: String,
    target_addr: String,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!(port, "public listener shut down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    let _ = conn.set_nodelay(true);
                    spawn_user_connection(
                        state.clone(),
                        conn,
                        peer,
                        port,
                        client_id.clone(),
                        target_addr.clone(),
                    );
                }
                Err(err) => {
                    // An accept error means the listener is unusable;
                    // treat it like a close.
                    debug!(port, error = %err, "accept failed, closing public listener");
                    break;
                }
            }
        }
    }
}

fn spawn_user_connection(
    state: Arc<CoreState>,
    conn: TcpStream,
    peer: SocketAddr,
    port: u16,
    client_id: String,
    target_addr: String,
) {
    tokio::spawn(forward::handle_user_connection(
        state,
        conn,
        peer,
        port,
        client_id,
        target_addr,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{MuxConnection, MuxHandle};
    use crate::rpc::RpcClient;
    use crate::server::registry::ClientIdentity;

    fn test_session_parts() -> (MuxHandle, Arc<RpcClient>) {
        let (a, b) = tokio::io::duplex(8192);
        let client = MuxConnection::client(a);
        let _server = MuxConnection::server(b);
        let (rpc_io, _peer) = tokio::io::duplex(8192);
        (client.handle(), Arc::new(RpcClient::new(rpc_io)))
    }

    fn service(id: &str, local_port: u16, remote_port: u16) -> TargetService {
        TargetService {
            id: id.into(),
            local_ip: "127.0.0.1".into(),
            local_port,
            remote_port,
            remark: String::new(),
        }
    }

    fn register(state: &Arc<CoreState>, id: &str) {
        let (mux, rpc) = test_session_parts();
        state.add_client(id.into(), mux, rpc, ClientIdentity::default());
    }

    #[tokio::test]
    async fn test_allocate_port_starts_at_port_start() {
        let state = CoreState::new(61110);
        let port = state.allocate_port().unwrap();
        assert!(port >= 61110);
    }

    #[tokio::test]
    async fn test_allocate_port_skips_table_entries() {
        let state = CoreState::new(61120);
        let first = state.allocate_port().unwrap();

        // Occupy the port with a table entry; the next allocation must differ.
        let (tx, _rx) = oneshot::channel();
        state.listeners.lock().insert(
            first,
            ListenerEntry {
                client_id: "c".into(),
                service_id: "s".into(),
                shutdown: tx,
            },
        );

        let second = state.allocate_port().unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_sync_allocates_ports_and_starts_listeners() {
        let state = CoreState::new(61130);
        register(&state, "c1@h");

        state.clone().update_services(
            "c1@h",
            vec![service("s1", 2201, 0), service("s2", 2202, 0)],
        );

        let services = state.get_client("c1@h").unwrap().services();
        assert_eq!(services.len(), 2);
        let p1 = services[0].remote_port;
        let p2 = services[1].remote_port;
        assert!(p1 >= 61130);
        assert!(p2 >= 61130);
        // No duplicate ports, and every assigned port has its listener.
        assert_ne!(p1, p2);
        assert!(state.has_listener(p1));
        assert!(state.has_listener(p2));
        assert_eq!(
            state.listener_owner(p1).unwrap(),
            ("c1@h".to_string(), "s1".to_string())
        );
    }

    #[tokio::test]
    async fn test_sync_reuses_port_for_same_id() {
        let state = CoreState::new(61140);
        register(&state, "c1@h");

        state.clone().update_services("c1@h", vec![service("s1", 2201, 0)]);
        let assigned = state.get_client("c1@h").unwrap().services()[0].remote_port;
        assert_ne!(assigned, 0);

        // The client forgot its port; same id keeps the allocation.
        state.clone().update_services("c1@h", vec![service("s1", 2201, 0)]);
        let services = state.get_client("c1@h").unwrap().services();
        assert_eq!(services[0].remote_port, assigned);
        assert!(state.has_listener(assigned));
    }

    #[tokio::test]
    async fn test_sync_removes_listener_of_dropped_service() {
        let state = CoreState::new(61150);
        register(&state, "c1@h");

        state.clone().update_services(
            "c1@h",
            vec![service("s1", 2201, 0), service("s2", 2202, 0)],
        );
        let services = state.get_client("c1@h").unwrap().services();
        let p1 = services[0].remote_port;
        let p2 = services[1].remote_port;

        state.clone().update_services("c1@h", vec![service("s1", 2201, 0)]);

        assert!(state.has_listener(p1));
        assert!(!state.has_listener(p2));
        let services = state.get_client("c1@h").unwrap().services();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].remote_port, p1);
    }

    #[tokio::test]
    async fn test_sync_for_unknown_client_is_ignored() {
        let state = CoreState::new(61160);
        state.clone().update_services("ghost@h", vec![service("s1", 2201, 0)]);
        assert!(state.listener_ports().is_empty());
    }

    #[tokio::test]
    async fn test_session_removal_stops_its_listeners() {
        let state = CoreState::new(61170);
        let (mux, rpc) = test_session_parts();
        let session_id = mux.id();
        state.add_client("c1@h".into(), mux, rpc, ClientIdentity::default());

        state.clone().update_services("c1@h", vec![service("s1", 2201, 0)]);
        let port = state.get_client("c1@h").unwrap().services()[0].remote_port;
        assert!(state.has_listener(port));

        state.remove_by_session(session_id);

        assert!(state.get_client("c1@h").is_none());
        assert!(!state.has_listener(port));
    }

    #[tokio::test]
    async fn test_stop_is_tolerant_of_missing_entry() {
        let state = CoreState::new(61180);
        state.stop_public_listener(61999);
    }

    #[tokio::test]
    async fn test_explicit_remote_port_is_kept() {
        let state = CoreState::new(61190);
        register(&state, "c1@h");

        state.clone().update_services("c1@h", vec![service("s1", 2201, 61195)]);
        let services = state.get_client("c1@h").unwrap().services();
        assert_eq!(services[0].remote_port, 61195);
        assert!(state.has_listener(61195));
    }
}
