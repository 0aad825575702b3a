//! Stream multiplexing over a single TCP connection
//!
//! This module wraps a yamux session so that either side can open or accept
//! ordered byte streams over one transport connection. A dedicated driver
//! task polls the session: it pumps frames for every open stream and queues
//! inbound streams for [`MuxConnection::accept_stream`].
//!
//! Stream ordering is part of the protocol contract: the first stream a side
//! accepts after connecting is a control stream, later inbound streams are
//! data streams. The wrapper preserves arrival order.
//!
//! # Lifecycle
//!
//! When the underlying connection drops, the driver task exits; pending and
//! future `accept_stream` calls return `None` and `open_stream` fails with
//! [`MuxError::SessionClosed`]. Every `StreamHandle` derived from the session
//! starts failing its reads and writes, which unblocks all tasks parked on
//! them.

use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_yamux::config::Config;
use tokio_yamux::Control;
use tokio_yamux::session::Session;
use tokio_yamux::stream::StreamHandle;
use tracing::debug;

use crate::error::MuxError;

/// Inbound streams queued between the driver task and `accept_stream`
const INCOMING_BACKLOG: usize = 32;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle for opening streams on (and closing) a live session
///
/// Cheap to clone; every clone refers to the same session. The `id` is
/// process-unique and identifies the session in the server registry.
#[derive(Clone)]
pub struct MuxHandle {
    id: u64,
    control: Control,
}

impl MuxHandle {
    /// Process-unique identity of the underlying session
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Open a new outbound stream
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::SessionClosed`] when the underlying connection is
    /// gone.
    pub async fn open_stream(&self) -> Result<StreamHandle, MuxError> {
        let mut control = self.control.clone();
        control
            .open_stream()
            .await
            .map_err(|e| MuxError::SessionClosed(format!("{e:?}")))
    }

    /// Close the session, cascading to every derived stream
    pub async fn close(&self) {
        let mut control = self.control.clone();
        control.close().await;
    }
}

impl std::fmt::Debug for MuxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxHandle").field("id", &self.id).finish()
    }
}

/// One side of a multiplexed connection
///
/// Owns the inbound-stream queue; opening streams goes through the
/// [`MuxHandle`] returned by [`MuxConnection::handle`].
pub struct MuxConnection {
    handle: MuxHandle,
    incoming: mpsc::Receiver<StreamHandle>,
}

impl MuxConnection {
    /// Wrap the client side of a connection
    pub fn client<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn(Session::new_client(io, Config::default()))
    }

    /// Wrap the server side of a connection
    pub fn server<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn(Session::new_server(io, Config::default()))
    }

    fn spawn<T>(mut session: Session<T>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let control = session.control();
        let (tx, rx) = mpsc::channel(INCOMING_BACKLOG);

        tokio::spawn(drive_session(id, session, tx));

        Self {
            handle: MuxHandle { id, control },
            incoming: rx,
        }
    }

    /// Handle for opening streams and closing the session
    #[must_use]
    pub fn handle(&self) -> MuxHandle {
        self.handle.clone()
    }

    /// Accept the next inbound stream
    ///
    /// Returns `None` once the session is closed and the queue is drained.
    pub async fn accept_stream(&mut self) -> Option<StreamHandle> {
        self.incoming.recv().await
    }
}

impl std::fmt::Debug for MuxConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxConnection")
            .field("id", &self.handle.id)
            .finish()
    }
}

/// Poll the session until the transport dies or the accept side goes away.
///
/// Polling the session is what moves bytes for every stream, so this task
/// must keep running for the session's whole lifetime even when no inbound
/// stream is expected.
async fn drive_session<T>(id: u64, mut session: Session<T>, tx: mpsc::Sender<StreamHandle>)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        match session.next().await {
            Some(Ok(stream)) => {
                if tx.send(stream).await.is_err() {
                    debug!(session = id, "accept side dropped, stopping session driver");
                    break;
                }
            }
            Some(Err(err)) => {
                debug!(session = id, error = ?err, "mux session terminated");
                break;
            }
            None => {
                debug!(session = id, "mux session closed");
                break;
            }
        }
    }
}
