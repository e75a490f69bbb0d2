use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{TransportError, TransportResult};

/// One established TCP connection.
///
/// Cloning is cheap and every clone refers to the same connection. The read
/// side is owned by the transport, which lends it to the handshake and then
/// to the decode loop; a `Peer` only writes.
/// Closing shuts the socket down in both directions, which makes the pending
/// decode on the other half fail and ends that loop.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    outbound: bool,
    writer: Mutex<OwnedWriteHalf>,
    // Duplicate handle used only for shutdown, so closing does not need the
    // read half.
    shutdown_handle: std::net::TcpStream,
    closed: AtomicBool,
}

impl Peer {
    /// Wrap a connected stream, returning the peer and the read half for the
    /// decode loop.
    pub(crate) fn from_stream(
        stream: TcpStream,
        outbound: bool,
    ) -> TransportResult<(Self, OwnedReadHalf)> {
        let remote_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;

        let std_stream = stream.into_std()?;
        let shutdown_handle = std_stream.try_clone()?;
        let (reader, writer) = TcpStream::from_std(std_stream)?.into_split();

        let peer = Self {
            inner: Arc::new(PeerInner {
                remote_addr,
                local_addr,
                outbound,
                writer: Mutex::new(writer),
                shutdown_handle,
                closed: AtomicBool::new(false),
            }),
        };
        Ok((peer, reader))
    }

    /// Address of the other end.
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// Address of this end.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// `true` if this node dialed the connection, `false` if it was accepted.
    pub fn is_outbound(&self) -> bool {
        self.inner.outbound
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// `true` if both handles refer to the same connection.
    pub fn same_connection(&self, other: &Peer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Write raw bytes to the connection. Framing is the caller's job.
    pub async fn send(&self, data: &[u8]) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Shut the connection down in both directions. Idempotent.
    pub fn close(&self) -> TransportResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.inner.shutdown_handle.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // The remote already tore the connection down.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("remote_addr", &self.inner.remote_addr)
            .field("outbound", &self.inner.outbound)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = if self.inner.outbound { "outbound" } else { "inbound" };
        write!(f, "{} ({direction})", self.inner.remote_addr)
    }
}
