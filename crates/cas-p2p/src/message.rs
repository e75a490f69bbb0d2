use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use serde::{Deserialize, Serialize};

/// Default upper bound on a single frame's payload.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the big-endian length prefix in front of every framed payload.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// A message received from a peer.
///
/// Decoders produce the payload; the transport stamps `from` with the
/// connection's remote address before delivery. `from` is not part of the
/// wire encoding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rpc {
    #[serde(skip, default = "unspecified_addr")]
    pub from: SocketAddr,
    pub payload: Vec<u8>,
}

impl Rpc {
    /// A message with no sender yet.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            from: unspecified_addr(),
            payload: payload.into(),
        }
    }
}

fn unspecified_addr() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}
