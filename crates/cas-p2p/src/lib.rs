//! Peer-to-peer TCP transport for the content-addressed storage node.
//!
//! A [`TcpTransport`] binds a listener, accepts and dials connections, runs a
//! pluggable [`Handshake`] and optional [`PeerHook`] per connection, and
//! decodes each connection's byte stream into [`Rpc`] messages with a
//! pluggable [`Decoder`]. Every peer's messages fan into one bounded channel
//! handed out by [`TcpTransport::consume`].
//!
//! # Design Rules
//!
//! 1. A failure on one connection never affects another.
//! 2. Messages from one peer are delivered in the order that peer sent them.
//! 3. A peer is in the registry only between a successful negotiation and
//!    the end of its decode loop.
//! 4. Frame lengths are checked before any payload is allocated.

pub mod codec;
pub mod error;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod transport;

pub use codec::{
    encode_frame, read_frame, BincodeDecoder, Decoder, DecoderKind, LengthPrefixedDecoder,
    NopDecoder,
};
pub use error::{TransportError, TransportResult};
pub use handshake::{Handshake, NopHandshake, PeerHook};
pub use message::{Rpc, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};
pub use peer::Peer;
pub use transport::{TcpTransport, TcpTransportOptions, DEFAULT_INBOUND_CAPACITY};
