//! Error types for revport
//!
//! Errors are categorized by subsystem. Per-connection errors terminate only
//! that connection; session-level errors terminate the session and cascade to
//! its streams and listeners. Nothing is fatal at process level except
//! failure to bind the main listening port at startup.

use std::io;

use thiserror::Error;

/// Top-level error type for revport
#[derive(Debug, Error)]
pub enum RevportError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Multiplexed session errors
    #[error("Mux error: {0}")]
    Mux(#[from] MuxError),

    /// Control-plane RPC errors
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// Session establishment and lifecycle errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Public listener management errors
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RevportError {
    /// Check if this error is recoverable (the operation can be retried)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Mux(_) => true,
            Self::Rpc(e) => e.is_recoverable(),
            Self::Session(e) => e.is_recoverable(),
            Self::Listener(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    Validation(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    Env { name: String, reason: String },

    /// I/O error while reading or writing config
    #[error("I/O error accessing configuration: {0}")]
    Io(#[from] io::Error),
}

impl ConfigError {
    /// Config errors need user intervention, never retried automatically
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Multiplexed session errors
///
/// A session fails as a whole: once the underlying TCP connection is gone,
/// every open and pending stream operation reports `SessionClosed`.
#[derive(Debug, Error)]
pub enum MuxError {
    /// The underlying connection is gone
    #[error("multiplexed session closed: {0}")]
    SessionClosed(String),
}

/// Control-plane RPC errors
#[derive(Debug, Error)]
pub enum RpcError {
    /// The control stream is closed; no further calls can complete
    #[error("rpc connection closed")]
    ConnectionClosed,

    /// Encoding or decoding of a frame failed
    #[error("rpc codec error: {0}")]
    Codec(String),

    /// Application-level error raised by a local handler.
    ///
    /// The display string travels to the peer verbatim as the error field
    /// of the response.
    #[error("{0}")]
    Handler(String),

    /// Error string returned by the remote handler
    #[error("remote error: {0}")]
    Remote(String),

    /// No handler registered for the requested method
    #[error("unknown rpc method: {0}")]
    UnknownMethod(String),

    /// I/O error on the control stream
    #[error("rpc i/o error: {0}")]
    Io(#[from] io::Error),
}

impl RpcError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Codec(_) | Self::Handler(_) | Self::Remote(_) | Self::UnknownMethod(_) => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
        }
    }
}

/// Session establishment and lifecycle errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// TCP dial failed or the transport dropped; the reconnect loop retries
    #[error("transport down: {0}")]
    TransportDown(#[source] io::Error),

    /// The server replied but refused the registration
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The server runs an incompatible protocol version
    #[error("version mismatch: {0}")]
    VersionMismatch(String),

    /// Lookup by client id found nothing; benign, the caller drops the
    /// user connection or ignores the sync
    #[error("session not found")]
    SessionGone,

    /// Session-level multiplexer failure
    #[error(transparent)]
    Mux(#[from] MuxError),

    /// Control-plane failure during session setup or use
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl SessionError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::TransportDown(_) | Self::SessionGone | Self::Mux(_) => true,
            Self::HandshakeRejected(_) | Self::VersionMismatch(_) => false,
            Self::Rpc(e) => e.is_recoverable(),
        }
    }
}

/// Public listener management errors
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Every port from `start` to 65534 is taken or unbindable
    #[error("no available ports in range {start}-65534")]
    NoPortsAvailable { start: u16 },

    /// Failed to bind a specific public port
    #[error("failed to bind public port {port}: {reason}")]
    Bind { port: u16, reason: String },
}

impl ListenerError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            // Ports free up as sessions end; the admin caller may retry.
            Self::NoPortsAvailable { .. } => true,
            Self::Bind { .. } => false,
        }
    }
}

/// Type alias for Result with `RevportError`
pub type Result<T> = std::result::Result<T, RevportError>;
