//! Calling side of a control stream
//!
//! One `RpcClient` owns both halves of its stream: the write half (behind an
//! async mutex, so concurrent callers serialize per frame) and the read half
//! (consumed by a background task that routes each reply to the pending call
//! with the matching sequence number).

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{SplitStream, StreamExt};
use futures::{Sink, SinkExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use super::codec::{framed, Request, Response};
use crate::error::RpcError;

type FrameSink = Pin<Box<dyn Sink<Bytes, Error = std::io::Error> + Send>>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// Issues calls on a control stream and demultiplexes the replies
pub struct RpcClient {
    seq: AtomicU64,
    pending: Pending,
    writer: tokio::sync::Mutex<FrameSink>,
    closed: Arc<AtomicBool>,
}

impl RpcClient {
    /// Take ownership of a stream and start the reply-routing task
    pub fn new<S>(io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, stream) = framed(io).split::<Bytes>();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(route_replies(stream, pending.clone(), closed.clone()));

        Self {
            seq: AtomicU64::new(1),
            pending,
            writer: tokio::sync::Mutex::new(Box::pin(sink)),
            closed,
        }
    }

    /// Whether the underlying stream has already failed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Call a remote method and wait for its reply
    ///
    /// # Errors
    ///
    /// - [`RpcError::Remote`] when the remote handler returned an error
    /// - [`RpcError::ConnectionClosed`] when the stream died before the
    ///   reply arrived
    /// - [`RpcError::Codec`] when arguments or reply failed to encode/decode
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let request = Request {
            seq,
            method: method.to_string(),
            params: serde_json::to_value(args).map_err(|e| RpcError::Codec(e.to_string()))?,
        };
        let payload = serde_json::to_vec(&request).map_err(|e| RpcError::Codec(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(seq, tx);

        let sent = {
            let mut writer = self.writer.lock().await;
            writer.send(Bytes::from(payload)).await
        };
        if let Err(err) = sent {
            self.pending.lock().remove(&seq);
            debug!(method, error = %err, "rpc send failed");
            return Err(RpcError::ConnectionClosed);
        }

        let response = rx.await.map_err(|_| RpcError::ConnectionClosed)?;
        if let Some(message) = response.error {
            return Err(RpcError::Remote(message));
        }
        let value = response.result.unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| RpcError::Codec(e.to_string()))
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Read replies until the stream dies, then fail every pending call.
async fn route_replies<S>(
    mut stream: SplitStream<Framed<S, LengthDelimitedCodec>>,
    pending: Pending,
    closed: Arc<AtomicBool>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(error = %err, "rpc reply stream failed");
                break;
            }
        };
        match serde_json::from_slice::<Response>(&frame) {
            Ok(response) => {
                let waiter = pending.lock().remove(&response.seq);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(seq = response.seq, "reply with no pending call"),
                }
            }
            Err(err) => {
                debug!(error = %err, "undecodable rpc reply");
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with ConnectionClosed.
    pending.lock().clear();
}
