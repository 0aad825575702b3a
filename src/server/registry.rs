//! Client session registry
//!
//! `CoreState` owns every piece of cross-session state on the server: the
//! client registry, the public listener table, and the single observer slot
//! the admin surface subscribes to. It is created once at server start and
//! passed explicitly to the broker and to admin callers.
//!
//! # Lock Ordering
//!
//! When acquiring multiple locks, always follow this order to prevent
//! deadlocks:
//! 1. `clients` (`RwLock`)
//! 2. per-session `services` (`Mutex`, only while holding `clients`)
//! 3. `listeners` (`Mutex`)
//!
//! No RPC call is ever issued while holding a lock; callers snapshot the
//! handles they need, release, then call.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::listeners::ListenerEntry;
use crate::error::SessionError;
use crate::mux::MuxHandle;
use crate::proto::{self, BaseReply, PushConfigArgs, TargetService};
use crate::rpc::RpcClient;

/// Identity fields a client supplies at handshake, held verbatim
#[derive(Debug, Clone, Default)]
pub struct ClientIdentity {
    pub name: String,
    pub phone: String,
    pub project_name: String,
    pub remark: String,
}

/// One connected client
///
/// A session exclusively owns its multiplexed handle, its reverse-RPC
/// handle, and (through the listener table) the listeners derived from its
/// services. It is present in the registry iff its multiplexed session is
/// alive.
pub struct ClientSession {
    /// Rewritten identifier (`announced_id@remote_host`)
    pub id: String,
    /// Handle for opening data streams toward the client
    pub mux: MuxHandle,
    /// Reverse control stream, for server→client calls
    pub rpc: Arc<RpcClient>,
    /// Identity supplied at handshake
    pub identity: ClientIdentity,
    /// Advertised services; mutated only under the registry lock
    pub(crate) services: Mutex<Vec<TargetService>>,
}

impl ClientSession {
    /// Snapshot of the current service list
    #[must_use]
    pub fn services(&self) -> Vec<TargetService> {
        self.services.lock().clone()
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("session", &self.mux.id())
            .finish()
    }
}

/// Read-only view of one registry entry, for the admin surface
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub project_name: String,
    pub remark: String,
    pub services: Vec<TargetService>,
}

type UpdateCallback = Box<dyn Fn() + Send + Sync>;

/// Process-wide server state
pub struct CoreState {
    pub(crate) clients: RwLock<HashMap<String, Arc<ClientSession>>>,
    pub(crate) listeners: Mutex<HashMap<u16, ListenerEntry>>,
    pub(crate) port_start: u16,
    on_update: RwLock<Option<UpdateCallback>>,
}

impl CoreState {
    /// Create the server state
    ///
    /// `port_start` is the lowest public port the allocator considers.
    #[must_use]
    pub fn new(port_start: u16) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            port_start,
            on_update: RwLock::new(None),
        })
    }

    /// Subscribe the single registry observer
    ///
    /// The callback fires after any registry or service-list change. It must
    /// not call back into `CoreState` synchronously with blocking work; the
    /// admin surface typically just schedules a broadcast.
    pub fn set_on_update(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.on_update.write() = Some(Box::new(callback));
    }

    pub(crate) fn notify_update(&self) {
        if let Some(callback) = &*self.on_update.read() {
            callback();
        }
    }

    /// Register a client after a successful handshake
    ///
    /// An existing entry under the same id belongs to a stale session of the
    /// same client: its listeners are stopped, its session closed, and the
    /// new session takes the id.
    pub fn add_client(
        &self,
        id: String,
        mux: MuxHandle,
        rpc: Arc<RpcClient>,
        identity: ClientIdentity,
    ) -> Arc<ClientSession> {
        let session = {
            let mut clients = self.clients.write();

            if let Some(old) = clients.remove(&id) {
                info!(client = %id, "client re-connected, replacing previous session");
                let old_services = old.services.lock().clone();
                for service in &old_services {
                    if service.remote_port != 0 {
                        self.stop_public_listener(service.remote_port);
                    }
                }
                let old_mux = old.mux.clone();
                tokio::spawn(async move { old_mux.close().await });
            }

            let session = Arc::new(ClientSession {
                id: id.clone(),
                mux,
                rpc,
                identity,
                services: Mutex::new(Vec::new()),
            });
            clients.insert(id.clone(), session.clone());
            session
        };

        info!(client = %id, "client registered");
        self.notify_update();
        session
    }

    /// Remove whichever client owns the given multiplexer session
    ///
    /// Teardown order matters: stop the public listeners first so no user
    /// connection can be accepted into a dead session, then drop the
    /// registry entry, then close the multiplexer.
    pub fn remove_by_session(&self, session_id: u64) {
        let removed = {
            let mut clients = self.clients.write();
            let target = clients
                .iter()
                .find(|(_, session)| session.mux.id() == session_id)
                .map(|(id, session)| (id.clone(), session.clone()));

            if let Some((id, session)) = target {
                let services = session.services.lock().clone();
                for service in &services {
                    if service.remote_port != 0 {
                        self.stop_public_listener(service.remote_port);
                    }
                }
                clients.remove(&id);
                Some(session)
            } else {
                None
            }
        };

        if let Some(session) = removed {
            info!(client = %session.id, "removing client after session disconnect");
            let mux = session.mux.clone();
            tokio::spawn(async move { mux.close().await });
            self.notify_update();
        } else {
            debug!(session = session_id, "disconnect for unregistered session");
        }
    }

    /// Look up a live client by its rewritten id
    ///
    /// A miss is benign: the session may have ended between check and use.
    #[must_use]
    pub fn get_client(&self, id: &str) -> Option<Arc<ClientSession>> {
        self.clients.read().get(id).cloned()
    }

    /// Snapshot of every registered client, for the admin surface
    #[must_use]
    pub fn clients_snapshot(&self) -> Vec<ClientInfo> {
        let clients = self.clients.read();
        let mut snapshot: Vec<ClientInfo> = clients
            .values()
            .map(|session| ClientInfo {
                id: session.id.clone(),
                name: session.identity.name.clone(),
                phone: session.identity.phone.clone(),
                project_name: session.identity.project_name.clone(),
                remark: session.identity.remark.clone(),
                services: session.services.lock().clone(),
            })
            .collect();
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot
    }

    /// Push the client's server-held service list back to the client
    ///
    /// Used by the admin surface after it edits a client's services. The RPC
    /// handle and list are snapshotted under the lock; the call happens
    /// outside it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::SessionGone`] if the client is not registered,
    /// or the RPC failure if the reverse stream is dead.
    pub async fn push_config(&self, client_id: &str) -> Result<BaseReply, SessionError> {
        let (rpc, services) = {
            let clients = self.clients.read();
            let Some(session) = clients.get(client_id) else {
                return Err(SessionError::SessionGone);
            };
            let rpc = session.rpc.clone();
            let services = session.services.lock().clone();
            (rpc, services)
        };

        let reply: BaseReply = rpc
            .call(proto::methods::PUSH_CONFIG, &PushConfigArgs { services })
            .await?;
        Ok(reply)
    }
}

impl std::fmt::Debug for CoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreState")
            .field("clients", &self.clients.read().len())
            .field("listeners", &self.listeners.lock().len())
            .field("port_start", &self.port_start)
            .finish()
    }
}
