//! Newline-delimited JSON-RPC transport.
//!
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based framing and
//!   the push-style [`Framer`](codec::Framer).
//! - `frame`: request / notification / response classification and the wire
//!   error object.
//! - `peer`: the duplex [`RpcPeer`](peer::RpcPeer) engine with its dispatch and
//!   pending tables.

pub mod codec;
pub mod frame;
pub mod peer;

pub use frame::{Frame, RequestId, RpcError};
pub use peer::RpcPeer;
