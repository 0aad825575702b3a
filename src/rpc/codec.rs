//! Wire framing for the control streams
//!
//! Frames are length-delimited; the payload of each frame is one JSON
//! envelope, either a [`Request`] or a [`Response`] depending on the stream
//! direction.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Upper bound on a single control frame
///
/// A sync of a large service list stays far below this; anything bigger is a
/// broken or hostile peer.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// Frame a raw stream with the control-plane codec
pub(crate) fn framed<S>(io: S) -> Framed<S, LengthDelimitedCodec>
where
    S: AsyncRead + AsyncWrite,
{
    Framed::new(
        io,
        LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LEN)
            .new_codec(),
    )
}

/// One call issued by the stream's client side
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Request {
    /// Matches the response to the pending call
    pub seq: u64,
    /// Remote handler name, e.g. `ServerRPCContext.Handshake`
    pub method: String,
    /// JSON-encoded arguments
    #[serde(default)]
    pub params: Value,
}

/// One reply from the stream's serving side
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Response {
    pub seq: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}
