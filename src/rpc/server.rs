//! Serving side of a control stream
//!
//! [`serve`] owns a stream for its whole lifetime: it reads requests one at
//! a time, dispatches them through an [`RpcHandler`], and writes one reply
//! per request. It returns when the peer closes the stream, which is how a
//! session's owner learns the client is gone.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use super::codec::{framed, Request, Response};
use crate::error::RpcError;

/// Dispatch target for incoming calls
///
/// An implementation maps method names to operations; unknown names return
/// [`RpcError::UnknownMethod`]. Handler errors are not transport errors:
/// their display string is sent to the peer and serving continues.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcError>;
}

/// Decode the params value of a request into typed arguments
///
/// # Errors
///
/// Returns [`RpcError::Codec`] when the value does not match the expected
/// shape.
pub fn decode_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError::Codec(e.to_string()))
}

/// Encode a typed reply into the result value of a response
///
/// # Errors
///
/// Returns [`RpcError::Codec`] when the reply cannot be serialized.
pub fn encode_result<T: Serialize>(reply: &T) -> Result<Value, RpcError> {
    serde_json::to_value(reply).map_err(|e| RpcError::Codec(e.to_string()))
}

/// Serve calls on a stream until the peer closes it
///
/// Requests are handled sequentially; the control plane has no operation
/// worth reordering, and sequential handling keeps handshake-before-sync
/// trivially true on the serving side as well.
///
/// # Errors
///
/// Returns an error only for transport-level failures (undecodable frame,
/// write failure). A clean peer close returns `Ok(())`.
pub async fn serve<S, H>(io: S, handler: Arc<H>) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
    H: RpcHandler + ?Sized,
{
    let mut framed = framed(io);

    while let Some(frame) = framed.next().await {
        let frame = frame.map_err(RpcError::Io)?;
        let request: Request =
            serde_json::from_slice(&frame).map_err(|e| RpcError::Codec(e.to_string()))?;
        trace!(method = %request.method, seq = request.seq, "rpc request");

        let (result, error) = match handler.handle(&request.method, request.params).await {
            Ok(value) => (Some(value), None),
            Err(err) => (None, Some(err.to_string())),
        };
        let response = Response {
            seq: request.seq,
            result,
            error,
        };
        let payload =
            serde_json::to_vec(&response).map_err(|e| RpcError::Codec(e.to_string()))?;
        framed.send(Bytes::from(payload)).await.map_err(RpcError::Io)?;
    }

    Ok(())
}
