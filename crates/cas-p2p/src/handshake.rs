use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::TransportResult;
use crate::peer::Peer;

/// Negotiation run once per connection before any message is decoded.
///
/// `peer` writes to the remote and `reader` is the connection's read side,
/// so an implementation can exchange and check identity or version data.
/// Bytes it leaves unread are seen by the decoder. An error closes the
/// connection; it never reaches the inbound channel. Return
/// [`TransportError::Handshake`](crate::TransportError::Handshake) for a
/// rejected negotiation.
#[async_trait]
pub trait Handshake: Send + Sync {
    async fn handshake(
        &self,
        peer: &Peer,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> TransportResult<()>;
}

/// Accepts every connection without exchanging anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopHandshake;

#[async_trait]
impl Handshake for NopHandshake {
    async fn handshake(
        &self,
        _peer: &Peer,
        _reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> TransportResult<()> {
        Ok(())
    }
}

/// Application callback invoked once per successfully handshaken peer.
///
/// Returning an error (conventionally
/// [`TransportError::PeerRejected`](crate::TransportError::PeerRejected))
/// aborts the connection the same way a failed handshake does.
#[async_trait]
pub trait PeerHook: Send + Sync {
    async fn on_peer(&self, peer: &Peer) -> TransportResult<()>;
}
