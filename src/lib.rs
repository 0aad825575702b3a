//! revport: reverse TCP tunnel
//!
//! Services running behind NAT on client machines become reachable through
//! public ports on a central server. A client dials the server once, keeps
//! a single multiplexed TCP session open, and advertises a list of target
//! services; the server binds one public port per service and bridges every
//! user connection back through the session to a client-side dial.
//!
//! # Architecture
//!
//! ```text
//! User ──▶ public port P ──▶ Broker session ══╗ (one TCP connection,
//!                                             ║  many yamux streams)
//!                           client session ◀══╝
//!                                 │ dial target line + raw bytes
//!                                 ▼
//!                           local service (host:port on the client's net)
//! ```
//!
//! Two control streams per session carry RPCs, one per direction: the
//! client opens the forward stream (handshake, service sync, heartbeat)
//! and the server opens the reverse stream (config push). Every further
//! stream is a data stream carrying one user connection.
//!
//! # Modules
//!
//! - [`config`]: configuration types and loading
//! - [`error`]: error types
//! - [`io`]: data-plane splice
//! - [`mux`]: stream multiplexing over one TCP connection
//! - [`proto`]: wire types and RPC method names
//! - [`rpc`]: request/response RPC over a stream
//! - [`server`]: broker, registry, port manager, data plane
//! - [`client`]: state, session dialer, local dial plane

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod client;
pub mod config;
pub mod error;
pub mod io;
pub mod mux;
pub mod proto;
pub mod rpc;
pub mod server;

// Re-export commonly used types at the crate root
pub use client::{ClientEvent, ClientState};
pub use config::{ClientConfig, ServerConfig};
pub use error::{
    ConfigError, ListenerError, MuxError, RevportError, RpcError, SessionError,
};
pub use proto::{BaseReply, TargetService};
pub use server::{Broker, ClientInfo, CoreState};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
