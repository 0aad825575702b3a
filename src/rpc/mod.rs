//! Request/response RPC over a multiplexed stream
//!
//! A symmetric codec usable over any reliable byte stream: length-delimited
//! frames carrying JSON envelopes. Replies are matched to pending calls by
//! sequence number.
//!
//! # One stream, one direction
//!
//! A stream side has exactly one reader. An [`RpcClient`] owns the read half
//! of its stream (to demultiplex replies), and [`serve`] owns the read half
//! of its stream (to receive requests) — so a single stream can never host
//! both roles. Each session therefore carries **two** control streams, one
//! per call direction.

mod client;
mod codec;
mod server;

pub use client::RpcClient;
pub use codec::MAX_FRAME_LEN;
pub use server::{decode_params, encode_result, serve, RpcHandler};
