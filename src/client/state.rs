//! Client-local state
//!
//! The client is authoritative for its own service list; the server only
//! mirrors it (and may push an edited copy back through the reverse control
//! stream). At most one server session is live at a time; a reconnect
//! replaces the link in full.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{save_client_config, ClientConfig};
use crate::mux::MuxHandle;
use crate::proto::{HandshakeArgs, SyncConfigArgs, TargetService, VERSION};
use crate::rpc::RpcClient;

/// State changes surfaced to the embedding UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// A session to the server is established
    Connected,
    /// The session ended; the reconnect loop will retry
    Disconnected,
    /// The local service list changed (locally or via a server push)
    ServicesUpdated,
}

/// Live connection to the server
#[derive(Clone)]
pub struct ServerLink {
    /// Handle of the multiplexed session
    pub mux: MuxHandle,
    /// Forward control stream, for client→server calls
    pub rpc: Arc<RpcClient>,
}

type EventCallback = Box<dyn Fn(&ClientEvent) + Send + Sync>;

/// Shared state of the client application
pub struct ClientState {
    config: Mutex<ClientConfig>,
    config_path: Option<PathBuf>,
    services: Mutex<Vec<TargetService>>,
    link: Mutex<Option<ServerLink>>,
    connected: AtomicBool,
    connect_guard: tokio::sync::Mutex<()>,
    on_event: RwLock<Option<EventCallback>>,
}

impl ClientState {
    /// Build the client state from a loaded configuration
    ///
    /// Generates a `client_id` and missing service ids, and persists them
    /// when a config path is given — a stable id is what keeps public ports
    /// stable across restarts.
    pub fn new(mut config: ClientConfig, config_path: Option<PathBuf>) -> Arc<Self> {
        let mut dirty = false;
        if config.client_id.is_empty() {
            config.client_id = Uuid::new_v4().to_string();
            debug!(client_id = %config.client_id, "generated client id");
            dirty = true;
        }
        for service in &mut config.services {
            if service.id.is_empty() {
                service.id = format!(
                    "{}-{}-{}",
                    service.local_ip,
                    service.local_port,
                    Uuid::new_v4().simple()
                );
                dirty = true;
            }
        }

        if dirty {
            if let Some(path) = &config_path {
                if let Err(err) = save_client_config(path, &config) {
                    warn!(error = %err, "failed to persist generated ids");
                }
            }
        }

        let services = config.services.clone();
        Arc::new(Self {
            config: Mutex::new(config),
            config_path,
            services: Mutex::new(services),
            link: Mutex::new(None),
            connected: AtomicBool::new(false),
            connect_guard: tokio::sync::Mutex::new(()),
            on_event: RwLock::new(None),
        })
    }

    /// Subscribe the single UI observer
    pub fn set_on_event(&self, callback: impl Fn(&ClientEvent) + Send + Sync + 'static) {
        *self.on_event.write() = Some(Box::new(callback));
    }

    pub(crate) fn emit(&self, event: &ClientEvent) {
        if let Some(callback) = &*self.on_event.read() {
            callback(event);
        }
    }

    /// Whether a server session is currently live
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The persisted client identifier
    #[must_use]
    pub fn client_id(&self) -> String {
        self.config.lock().client_id.clone()
    }

    /// The configured server address
    #[must_use]
    pub fn server_addr(&self) -> String {
        self.config.lock().server_addr.clone()
    }

    /// Snapshot of the local service list
    #[must_use]
    pub fn services(&self) -> Vec<TargetService> {
        self.services.lock().clone()
    }

    /// The live link, if any
    #[must_use]
    pub fn link(&self) -> Option<ServerLink> {
        self.link.lock().clone()
    }

    /// Handshake arguments built from the persisted identity
    #[must_use]
    pub fn handshake_args(&self) -> HandshakeArgs {
        let config = self.config.lock();
        HandshakeArgs {
            client_id: config.client_id.clone(),
            version: VERSION.to_string(),
            name: config.user.name.clone(),
            phone: config.user.phone.clone(),
            project_name: config.user.project_name.clone(),
            remark: config.user.remark.clone(),
        }
    }

    /// Update the persisted identity fields (the UI's login form)
    pub fn set_identity(&self, name: &str, phone: &str, project_name: &str, remark: &str) {
        let config = {
            let mut config = self.config.lock();
            config.user.name = name.to_string();
            config.user.phone = phone.to_string();
            config.user.project_name = project_name.to_string();
            config.user.remark = remark.to_string();
            config.clone()
        };
        self.persist(&config);
    }

    /// Add a service to the local list
    ///
    /// Returns the generated service; the caller re-syncs when connected.
    pub fn add_target(
        &self,
        local_ip: &str,
        local_port: u16,
        remote_port: u16,
        remark: &str,
    ) -> TargetService {
        let service = TargetService {
            id: format!(
                "{}-{}-{}",
                local_ip,
                local_port,
                Uuid::new_v4().simple()
            ),
            local_ip: local_ip.to_string(),
            local_port,
            remote_port,
            remark: remark.to_string(),
        };
        self.services.lock().push(service.clone());
        self.emit(&ClientEvent::ServicesUpdated);
        service
    }

    /// Remove a service from the local list by id
    ///
    /// Returns whether anything was removed; the caller re-syncs when
    /// connected.
    pub fn remove_target(&self, id: &str) -> bool {
        let removed = {
            let mut services = self.services.lock();
            let before = services.len();
            services.retain(|s| s.id != id);
            services.len() != before
        };
        if removed {
            self.emit(&ClientEvent::ServicesUpdated);
        }
        removed
    }

    /// Replace the whole local list (server-initiated push)
    pub fn replace_services(&self, services: Vec<TargetService>) {
        *self.services.lock() = services;
        self.emit(&ClientEvent::ServicesUpdated);
    }

    /// Snapshot the RPC handle and sync arguments, or `None` when offline
    ///
    /// Everything needed for the call is captured under the locks; the call
    /// itself must happen after they are released.
    #[must_use]
    pub(crate) fn sync_snapshot(&self) -> Option<(Arc<RpcClient>, SyncConfigArgs)> {
        let link = self.link.lock().clone()?;
        let args = SyncConfigArgs {
            client_id: self.client_id(),
            services: self.services(),
        };
        Some((link.rpc, args))
    }

    pub(crate) fn connect_guard(&self) -> &tokio::sync::Mutex<()> {
        &self.connect_guard
    }

    /// Install a new live link, replacing (and closing) any previous one
    pub(crate) fn set_link(&self, link: ServerLink) {
        let previous = {
            let mut slot = self.link.lock();
            slot.replace(link)
        };
        if let Some(previous) = previous {
            let mux = previous.mux;
            tokio::spawn(async move { mux.close().await });
        }
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Tear down the link if it still belongs to the given session
    ///
    /// Both the stream acceptor and the heartbeat task call this; the
    /// session-id check makes the teardown idempotent and keeps a stale
    /// task from killing a newer link.
    pub(crate) fn drop_link(&self, session_id: u64) {
        let dropped = {
            let mut slot = self.link.lock();
            let current = slot
                .as_ref()
                .is_some_and(|link| link.mux.id() == session_id);
            if current {
                slot.take()
            } else {
                None
            }
        };
        if let Some(link) = dropped {
            self.connected.store(false, Ordering::SeqCst);
            let mux = link.mux;
            tokio::spawn(async move { mux.close().await });
            self.emit(&ClientEvent::Disconnected);
        }
    }

    fn persist(&self, config: &ClientConfig) {
        if let Some(path) = &self.config_path {
            if let Err(err) = save_client_config(path, config) {
                warn!(error = %err, "failed to persist client config");
            }
        }
    }
}

impl std::fmt::Debug for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientState")
            .field("connected", &self.is_connected())
            .field("services", &self.services.lock().len())
            .finish()
    }
}
