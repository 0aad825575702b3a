//! Server side of the tunnel
//!
//! The broker accepts tunnel clients on the configured TCP port and runs
//! one session per connection. [`CoreState`] is the explicit registry shared
//! by every session: live clients, the public listener table, and the
//! observer slot the admin surface subscribes to. Public listeners feed user
//! connections into the data plane, which bridges them over a fresh stream
//! of the owning session.

mod broker;
mod forward;
mod listeners;
mod registry;

pub use broker::Broker;
pub use registry::{ClientIdentity, ClientInfo, ClientSession, CoreState};
