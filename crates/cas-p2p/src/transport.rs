use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{Decoder, LengthPrefixedDecoder};
use crate::error::{TransportError, TransportResult};
use crate::handshake::{Handshake, NopHandshake, PeerHook};
use crate::message::Rpc;
use crate::peer::Peer;

/// Default bound of the inbound message channel.
pub const DEFAULT_INBOUND_CAPACITY: usize = 64;

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin the acceptor.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Configuration for a [`TcpTransport`].
#[derive(Clone)]
pub struct TcpTransportOptions {
    /// `host:port` to bind. Port 0 picks a free port.
    pub listen_addr: String,
    pub handshake: Arc<dyn Handshake>,
    pub decoder: Arc<dyn Decoder>,
    /// Called after a successful handshake; an error rejects the peer.
    pub on_peer: Option<Arc<dyn PeerHook>>,
    /// Messages buffered before peer readers block on delivery.
    pub inbound_capacity: usize,
    /// Cap on concurrently handled accepted connections. `None` is unbounded.
    pub max_connections: Option<usize>,
}

impl TcpTransportOptions {
    /// No-op handshake, length-prefixed framing, no peer hook.
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            handshake: Arc::new(NopHandshake),
            decoder: Arc::new(LengthPrefixedDecoder::default()),
            on_peer: None,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            max_connections: None,
        }
    }

    pub fn with_handshake(mut self, handshake: impl Handshake + 'static) -> Self {
        self.handshake = Arc::new(handshake);
        self
    }

    pub fn with_decoder(mut self, decoder: impl Decoder + 'static) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }

    pub fn with_peer_hook(mut self, hook: impl PeerHook + 'static) -> Self {
        self.on_peer = Some(Arc::new(hook));
        self
    }

    pub fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }
}

impl fmt::Debug for TcpTransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransportOptions")
            .field("listen_addr", &self.listen_addr)
            .field("on_peer", &self.on_peer.is_some())
            .field("inbound_capacity", &self.inbound_capacity)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Live peers keyed by remote address.
///
/// Locked only for the duration of a single map operation, never across a
/// handshake, decode, or channel send.
#[derive(Default)]
struct PeerRegistry {
    peers: RwLock<HashMap<SocketAddr, Peer>>,
}

impl PeerRegistry {
    fn insert(&self, peer: Peer) {
        self.peers
            .write()
            .expect("peer registry lock poisoned")
            .insert(peer.remote_addr(), peer);
    }

    /// Remove `peer`, unless its address has since been taken by another
    /// connection.
    fn remove(&self, peer: &Peer) {
        let mut peers = self.peers.write().expect("peer registry lock poisoned");
        if peers
            .get(&peer.remote_addr())
            .is_some_and(|current| current.same_connection(peer))
        {
            peers.remove(&peer.remote_addr());
        }
    }

    fn snapshot(&self) -> Vec<Peer> {
        self.peers
            .read()
            .expect("peer registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.peers.read().expect("peer registry lock poisoned").len()
    }

    fn drain(&self) -> Vec<Peer> {
        self.peers
            .write()
            .expect("peer registry lock poisoned")
            .drain()
            .map(|(_, peer)| peer)
            .collect()
    }
}

/// State shared between the transport handle, the acceptor, and every
/// connection task.
struct Shared {
    options: TcpTransportOptions,
    peers: PeerRegistry,
    // Taken on close so the consumer sees the channel end once every
    // connection task has exited.
    inbound: Mutex<Option<mpsc::Sender<Rpc>>>,
    closed: AtomicBool,
    // Flipped to `true` by close(); negotiating and reading tasks race
    // against it.
    shutdown: watch::Sender<bool>,
    connection_limit: Option<Arc<Semaphore>>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the transport has been closed, immediately if it
    /// already is.
    async fn closed_signal(&self) {
        let mut closed = self.shutdown.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    fn inbound_sender(&self) -> Option<mpsc::Sender<Rpc>> {
        self.inbound.lock().expect("inbound lock poisoned").clone()
    }
}

/// TCP endpoint: accepts and dials connections and fans every peer's
/// decoded messages into one channel.
///
/// Each connection runs in its own task: handshake, optional peer hook, then
/// a decode loop until the first error. A slow consumer blocks only the
/// readers whose sends are pending; messages from one peer arrive in the
/// order that peer sent them, with no ordering across peers.
pub struct TcpTransport {
    shared: Arc<Shared>,
    local_addr: OnceLock<SocketAddr>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    consumer: Mutex<Option<mpsc::Receiver<Rpc>>>,
}

impl TcpTransport {
    pub fn new(options: TcpTransportOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.inbound_capacity.max(1));
        let connection_limit = options
            .max_connections
            .map(|max| Arc::new(Semaphore::new(max.max(1))));
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                options,
                peers: PeerRegistry::default(),
                inbound: Mutex::new(Some(tx)),
                closed: AtomicBool::new(false),
                shutdown,
                connection_limit,
            }),
            local_addr: OnceLock::new(),
            acceptor: Mutex::new(None),
            consumer: Mutex::new(Some(rx)),
        }
    }

    /// Bind the configured address and start accepting in the background.
    ///
    /// Returns as soon as the listener is bound. A failed bind starts
    /// nothing. A transport binds at most once.
    pub async fn listen_and_accept(&self) -> TransportResult<()> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed);
        }
        if let Some(addr) = self.local_addr.get() {
            return Err(TransportError::AlreadyListening(*addr));
        }

        let addr = &self.shared.options.listen_addr;
        let listener = TcpListener::bind(addr.as_str())
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = listener.local_addr()?;
        if self.local_addr.set(local).is_err() {
            let current = self.local_addr.get().copied().unwrap_or(local);
            return Err(TransportError::AlreadyListening(current));
        }

        let handle = tokio::spawn(accept_loop(Arc::clone(&self.shared), listener));
        *self.acceptor.lock().expect("acceptor lock poisoned") = Some(handle);
        // A concurrent close may have missed the handle.
        if self.shared.is_closed() {
            self.abort_acceptor();
            return Err(TransportError::Closed);
        }

        info!(addr = %local, "transport listening");
        Ok(())
    }

    /// Connect to `addr`, negotiate, and start reading from it.
    ///
    /// The returned peer is registered and outbound; its messages arrive on
    /// the same channel as those of accepted peers.
    pub async fn dial(&self, addr: impl ToSocketAddrs) -> TransportResult<Peer> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed);
        }
        let stream = TcpStream::connect(addr).await?;
        let (peer, reader) = negotiate(&self.shared, stream, true).await?;
        tokio::spawn(read_loop(Arc::clone(&self.shared), peer.clone(), reader));
        Ok(peer)
    }

    /// Take the receiving end of the inbound channel.
    ///
    /// The channel has one receiver: the first call gets it, later calls get
    /// `None`. It yields `None` after [`close`](Self::close) once every
    /// connection task has finished.
    pub fn consume(&self) -> Option<mpsc::Receiver<Rpc>> {
        self.consumer.lock().expect("consumer lock poisoned").take()
    }

    /// Stop accepting and disconnect every peer. Idempotent.
    ///
    /// Connections still handshaking or in the peer hook are abandoned and
    /// closed too; every connection task exits promptly.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.abort_acceptor();
        if let Some(limit) = &self.shared.connection_limit {
            limit.close();
        }
        self.shared.inbound.lock().expect("inbound lock poisoned").take();
        self.shared.shutdown.send_replace(true);

        let peers = self.shared.peers.drain();
        let count = peers.len();
        for peer in peers {
            if let Err(e) = peer.close() {
                debug!(peer = %peer.remote_addr(), error = %e, "error closing peer");
            }
        }
        info!(peers = count, "transport closed");
    }

    /// The configured listen address, as given.
    pub fn listen_addr(&self) -> &str {
        &self.shared.options.listen_addr
    }

    /// The bound address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn is_listening(&self) -> bool {
        self.local_addr.get().is_some() && !self.shared.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Snapshot of the connected peers.
    pub fn peers(&self) -> Vec<Peer> {
        self.shared.peers.snapshot()
    }

    pub fn peer_count(&self) -> usize {
        self.shared.peers.len()
    }

    fn abort_acceptor(&self) {
        if let Some(handle) = self.acceptor.lock().expect("acceptor lock poisoned").take() {
            handle.abort();
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("listen_addr", &self.shared.options.listen_addr)
            .field("local_addr", &self.local_addr.get())
            .field("peers", &self.shared.peers.len())
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        let permit = match &shared.connection_limit {
            Some(limit) => match Arc::clone(limit).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return,
            },
            None => None,
        };

        let (stream, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };
        debug!(peer = %addr, "accepted connection");

        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            match negotiate(&shared, stream, false).await {
                Ok((peer, reader)) => read_loop(Arc::clone(&shared), peer, reader).await,
                Err(e) => warn!(peer = %addr, error = %e, "dropping connection"),
            }
            drop(permit);
        });
    }
}

/// Handshake, run the peer hook, and register. The connection is closed on
/// any failure, and negotiation is abandoned as soon as the transport closes.
async fn negotiate(
    shared: &Shared,
    stream: TcpStream,
    outbound: bool,
) -> TransportResult<(Peer, OwnedReadHalf)> {
    let (peer, mut reader) = Peer::from_stream(stream, outbound)?;

    let admitted = tokio::select! {
        result = admit(shared, &peer, &mut reader) => result,
        _ = shared.closed_signal() => Err(TransportError::Closed),
    };
    if let Err(e) = admitted {
        let _ = peer.close();
        return Err(e);
    }

    shared.peers.insert(peer.clone());
    // close() drains the registry after setting the flag; re-check so a peer
    // registered concurrently is not left behind.
    if shared.is_closed() {
        shared.peers.remove(&peer);
        let _ = peer.close();
        return Err(TransportError::Closed);
    }

    debug!(peer = %peer, "peer connected");
    Ok((peer, reader))
}

async fn admit(shared: &Shared, peer: &Peer, reader: &mut OwnedReadHalf) -> TransportResult<()> {
    shared
        .options
        .handshake
        .handshake(peer, &mut *reader)
        .await
        .map_err(|e| match e {
            TransportError::Handshake(_) => e,
            other => TransportError::Handshake(other.to_string()),
        })?;

    if let Some(hook) = &shared.options.on_peer {
        hook.on_peer(peer).await.map_err(|e| match e {
            TransportError::PeerRejected(_) => e,
            other => TransportError::PeerRejected(other.to_string()),
        })?;
    }
    Ok(())
}

/// Run the decode loop until it ends or the transport closes, then
/// deregister and close the peer.
async fn read_loop(shared: Arc<Shared>, peer: Peer, mut reader: OwnedReadHalf) {
    let addr = peer.remote_addr();
    tokio::select! {
        _ = pump(&shared, &peer, &mut reader) => {}
        _ = shared.closed_signal() => debug!(peer = %addr, "transport closed; reader stopped"),
    }

    shared.peers.remove(&peer);
    if let Err(e) = peer.close() {
        debug!(peer = %addr, error = %e, "error closing peer");
    }
}

/// Decode until the first error, delivering each message stamped with the
/// sender's address.
async fn pump(shared: &Shared, peer: &Peer, reader: &mut OwnedReadHalf) {
    let addr = peer.remote_addr();
    let Some(inbound) = shared.inbound_sender() else {
        return;
    };
    loop {
        match shared.options.decoder.decode(&mut *reader).await {
            Ok(mut rpc) => {
                rpc.from = addr;
                if inbound.send(rpc).await.is_err() {
                    debug!(peer = %addr, "inbound channel closed");
                    return;
                }
            }
            Err(TransportError::ConnectionClosed) => {
                debug!(peer = %addr, "peer disconnected");
                return;
            }
            Err(e) if peer.is_closed() => {
                debug!(peer = %addr, error = %e, "read ended after close");
                return;
            }
            Err(e) => {
                warn!(peer = %addr, error = %e, "decode failed; closing connection");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_frame, BincodeDecoder};
    use crate::message::MAX_FRAME_SIZE;
    use async_trait::async_trait;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn options() -> TcpTransportOptions {
        TcpTransportOptions::new("127.0.0.1:0")
    }

    async fn start(options: TcpTransportOptions) -> (TcpTransport, mpsc::Receiver<Rpc>, SocketAddr) {
        let transport = TcpTransport::new(options);
        transport.listen_and_accept().await.unwrap();
        let rx = transport.consume().unwrap();
        let addr = transport.local_addr().unwrap();
        (transport, rx, addr)
    }

    async fn recv(rx: &mut mpsc::Receiver<Rpc>) -> Rpc {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("inbound channel ended")
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Reads until the remote closes; `true` if that happened in time.
    async fn closed_by_remote(stream: &mut TcpStream) -> bool {
        let mut buf = [0u8; 64];
        timeout(WAIT, async {
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return true,
                    Ok(_) => continue,
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        encode_frame(payload, MAX_FRAME_SIZE).unwrap()
    }

    struct RejectHandshake;

    #[async_trait]
    impl Handshake for RejectHandshake {
        async fn handshake(
            &self,
            _peer: &Peer,
            _reader: &mut (dyn AsyncRead + Unpin + Send),
        ) -> TransportResult<()> {
            Err(TransportError::Handshake("unknown protocol version".into()))
        }
    }

    /// Sends its version byte, then requires the remote's to match.
    struct VersionHandshake(u8);

    #[async_trait]
    impl Handshake for VersionHandshake {
        async fn handshake(
            &self,
            peer: &Peer,
            reader: &mut (dyn AsyncRead + Unpin + Send),
        ) -> TransportResult<()> {
            peer.send(&[self.0]).await?;
            let mut theirs = [0u8; 1];
            reader.read_exact(&mut theirs).await?;
            if theirs[0] != self.0 {
                return Err(TransportError::Handshake(format!(
                    "remote speaks version {}, expected {}",
                    theirs[0], self.0
                )));
            }
            Ok(())
        }
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Never finishes negotiating on its own; records when it starts and
    /// when it is abandoned.
    #[derive(Default, Clone)]
    struct Stall {
        entered: Arc<AtomicBool>,
        abandoned: Arc<AtomicBool>,
    }

    impl Stall {
        async fn hang(&self) -> TransportResult<()> {
            let _abandoned = SetOnDrop(Arc::clone(&self.abandoned));
            self.entered.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    #[async_trait]
    impl Handshake for Stall {
        async fn handshake(
            &self,
            _peer: &Peer,
            _reader: &mut (dyn AsyncRead + Unpin + Send),
        ) -> TransportResult<()> {
            self.hang().await
        }
    }

    #[async_trait]
    impl PeerHook for Stall {
        async fn on_peer(&self, _peer: &Peer) -> TransportResult<()> {
            self.hang().await
        }
    }

    struct RejectAll;

    #[async_trait]
    impl PeerHook for RejectAll {
        async fn on_peer(&self, _peer: &Peer) -> TransportResult<()> {
            Err(TransportError::PeerRejected("at capacity".into()))
        }
    }

    #[derive(Default, Clone)]
    struct RecordPeers(Arc<Mutex<Vec<(SocketAddr, bool)>>>);

    #[async_trait]
    impl PeerHook for RecordPeers {
        async fn on_peer(&self, peer: &Peer) -> TransportResult<()> {
            self.0
                .lock()
                .unwrap()
                .push((peer.remote_addr(), peer.is_outbound()));
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Listening
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn listen_returns_and_reports_bound_addr() {
        let transport = TcpTransport::new(options());
        assert!(!transport.is_listening());
        transport.listen_and_accept().await.unwrap();
        assert!(transport.is_listening());
        let addr = transport.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(transport.listen_addr(), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn bind_conflict_is_bind_error() {
        let (_first, _rx, addr) = start(options()).await;
        let second = TcpTransport::new(TcpTransportOptions::new(addr.to_string()));

        let err = second.listen_and_accept().await.unwrap_err();
        assert!(matches!(err, TransportError::Bind { .. }));
        assert!(!second.is_listening());
        assert!(second.local_addr().is_none());
        assert!(second.acceptor.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_addr_is_bind_error() {
        let transport = TcpTransport::new(TcpTransportOptions::new("not an address"));
        let err = transport.listen_and_accept().await.unwrap_err();
        assert!(matches!(err, TransportError::Bind { ref addr, .. } if addr == "not an address"));
    }

    #[tokio::test]
    async fn listening_twice_fails() {
        let (transport, _rx, addr) = start(options()).await;
        let err = transport.listen_and_accept().await.unwrap_err();
        assert!(matches!(err, TransportError::AlreadyListening(a) if a == addr));
    }

    #[tokio::test]
    async fn listen_after_close_fails() {
        let transport = TcpTransport::new(options());
        transport.close();
        let err = transport.listen_and_accept().await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn consume_hands_out_single_receiver() {
        let transport = TcpTransport::new(options());
        assert!(transport.consume().is_some());
        assert!(transport.consume().is_none());
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn messages_are_stamped_with_sender() {
        let (_transport, mut rx, addr) = start(options()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&frame(b"hello")).await.unwrap();

        let rpc = recv(&mut rx).await;
        assert_eq!(rpc.payload, b"hello");
        assert_eq!(rpc.from, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn bincode_decoder_end_to_end() {
        let decoder = BincodeDecoder::default();
        let (_transport, mut rx, addr) = start(options().with_decoder(decoder)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&decoder.encode(&Rpc::new(b"typed".to_vec())).unwrap())
            .await
            .unwrap();

        let rpc = recv(&mut rx).await;
        assert_eq!(rpc.payload, b"typed");
        assert_eq!(rpc.from, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn concurrent_peers_keep_their_own_order() {
        const PER_PEER: u32 = 100;
        let (_transport, mut rx, addr) = start(options()).await;

        let senders: Vec<_> = (0u8..2)
            .map(|id| {
                tokio::spawn(async move {
                    let mut client = TcpStream::connect(addr).await.unwrap();
                    for seq in 0..PER_PEER {
                        let mut payload = vec![id];
                        payload.extend_from_slice(&seq.to_be_bytes());
                        client.write_all(&frame(&payload)).await.unwrap();
                    }
                    // Keep the connection open until everything is read.
                    client
                })
            })
            .collect();

        let mut last: HashMap<SocketAddr, (u8, u32)> = HashMap::new();
        for _ in 0..(2 * PER_PEER) {
            let rpc = recv(&mut rx).await;
            let id = rpc.payload[0];
            let seq = u32::from_be_bytes(rpc.payload[1..5].try_into().unwrap());
            if let Some((prev_id, prev_seq)) = last.insert(rpc.from, (id, seq)) {
                assert_eq!(prev_id, id, "sender address must map to one client");
                assert_eq!(seq, prev_seq + 1, "per-peer order must be preserved");
            } else {
                assert_eq!(seq, 0);
            }
        }
        assert_eq!(last.len(), 2);
        assert!(last.values().all(|(_, seq)| *seq == PER_PEER - 1));

        for sender in senders {
            sender.await.unwrap();
        }
    }

    // -----------------------------------------------------------------------
    // Rejection and failure isolation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn failed_handshake_closes_connection_without_delivery() {
        let (transport, mut rx, addr) = start(options().with_handshake(RejectHandshake)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let _ = client.write_all(&frame(b"ignored")).await;

        assert!(closed_by_remote(&mut client).await);
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.peer_count(), 0);
    }

    #[tokio::test]
    async fn peer_hook_rejection_closes_connection() {
        let (transport, mut rx, addr) = start(options().with_peer_hook(RejectAll)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let _ = client.write_all(&frame(b"ignored")).await;

        assert!(closed_by_remote(&mut client).await);
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.peer_count(), 0);
    }

    #[tokio::test]
    async fn peer_hook_sees_inbound_peers() {
        let hook = RecordPeers::default();
        let (transport, _rx, addr) = start(options().with_peer_hook(hook.clone())).await;
        let client = TcpStream::connect(addr).await.unwrap();

        wait_until(|| transport.peer_count() == 1).await;
        let seen = hook.0.lock().unwrap().clone();
        assert_eq!(seen, vec![(client.local_addr().unwrap(), false)]);
    }

    #[tokio::test]
    async fn oversized_frame_ends_only_that_connection() {
        let decoder = LengthPrefixedDecoder::new(64);
        let (_transport, mut rx, addr) = start(options().with_decoder(decoder)).await;

        let mut bad = TcpStream::connect(addr).await.unwrap();
        let mut good = TcpStream::connect(addr).await.unwrap();

        bad.write_all(&1000u32.to_be_bytes()).await.unwrap();
        for payload in [&b"one"[..], b"two", b"three"] {
            good.write_all(&frame(payload)).await.unwrap();
        }

        assert!(closed_by_remote(&mut bad).await);
        let good_addr = good.local_addr().unwrap();
        for expected in [&b"one"[..], b"two", b"three"] {
            let rpc = recv(&mut rx).await;
            assert_eq!(rpc.from, good_addr);
            assert_eq!(rpc.payload, expected);
        }

        // The surviving connection keeps working after the other one died.
        good.write_all(&frame(b"four")).await.unwrap();
        assert_eq!(recv(&mut rx).await.payload, b"four");
    }

    // -----------------------------------------------------------------------
    // Registry and shutdown
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn disconnected_peer_leaves_registry() {
        let (transport, _rx, addr) = start(options()).await;
        let client = TcpStream::connect(addr).await.unwrap();
        wait_until(|| transport.peer_count() == 1).await;

        let peer = &transport.peers()[0];
        assert_eq!(peer.remote_addr(), client.local_addr().unwrap());
        assert!(!peer.is_outbound());

        drop(client);
        wait_until(|| transport.peer_count() == 0).await;
    }

    #[tokio::test]
    async fn close_disconnects_peers_and_ends_channel() {
        let (transport, mut rx, addr) = start(options()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        wait_until(|| transport.peer_count() == 1).await;

        transport.close();
        transport.close();
        assert!(transport.is_closed());
        assert!(!transport.is_listening());
        assert_eq!(transport.peer_count(), 0);

        assert!(closed_by_remote(&mut client).await);
        let end = timeout(WAIT, rx.recv()).await.expect("channel should end");
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn max_connections_defers_extra_peers() {
        let (transport, mut rx, addr) = start(options().with_max_connections(1)).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        wait_until(|| transport.peer_count() == 1).await;
        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(&frame(b"second")).await.unwrap();
        first.write_all(&frame(b"first")).await.unwrap();

        assert_eq!(recv(&mut rx).await.payload, b"first");
        assert!(rx.try_recv().is_err());

        drop(first);
        let rpc = recv(&mut rx).await;
        assert_eq!(rpc.payload, b"second");
        assert_eq!(rpc.from, second.local_addr().unwrap());
    }

    // -----------------------------------------------------------------------
    // Dialing
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn dial_registers_outbound_peer() {
        let (server, mut server_rx, addr) = start(options()).await;
        let client = TcpTransport::new(options());

        let peer = client.dial(addr).await.unwrap();
        assert!(peer.is_outbound());
        assert_eq!(peer.remote_addr(), addr);
        assert_eq!(client.peer_count(), 1);

        peer.send(&frame(b"over the wire")).await.unwrap();
        let rpc = recv(&mut server_rx).await;
        assert_eq!(rpc.payload, b"over the wire");
        assert_eq!(rpc.from, peer.local_addr());

        wait_until(|| server.peer_count() == 1).await;
        assert!(!server.peers()[0].is_outbound());
    }

    #[tokio::test]
    async fn dialed_peer_delivers_replies() {
        let (server, _server_rx, addr) = start(options()).await;
        let client = TcpTransport::new(options());
        let mut client_rx = client.consume().unwrap();

        let peer = client.dial(addr).await.unwrap();
        wait_until(|| server.peer_count() == 1).await;
        server.peers()[0].send(&frame(b"reply")).await.unwrap();

        let rpc = recv(&mut client_rx).await;
        assert_eq!(rpc.payload, b"reply");
        assert_eq!(rpc.from, peer.remote_addr());
    }

    #[tokio::test]
    async fn dial_after_close_fails() {
        let (_server, _rx, addr) = start(options()).await;
        let client = TcpTransport::new(options());
        client.close();
        assert!(matches!(client.dial(addr).await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn dial_with_rejecting_handshake_fails() {
        let (_server, _rx, addr) = start(options()).await;
        let client = TcpTransport::new(options().with_handshake(RejectHandshake));
        let err = client.dial(addr).await.unwrap_err();
        assert!(matches!(err, TransportError::Handshake(_)));
        assert_eq!(client.peer_count(), 0);
    }

    #[tokio::test]
    async fn close_abandons_connection_in_handshake() {
        let stall = Stall::default();
        let (transport, _rx, addr) = start(options().with_handshake(stall.clone())).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        wait_until(|| stall.entered.load(Ordering::SeqCst)).await;

        transport.close();
        assert!(closed_by_remote(&mut client).await);
        wait_until(|| stall.abandoned.load(Ordering::SeqCst)).await;
        assert_eq!(transport.peer_count(), 0);
    }

    #[tokio::test]
    async fn dropping_transport_abandons_connection_in_peer_hook() {
        let stall = Stall::default();
        let (transport, _rx, addr) = start(options().with_peer_hook(stall.clone())).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        wait_until(|| stall.entered.load(Ordering::SeqCst)).await;

        drop(transport);
        assert!(closed_by_remote(&mut client).await);
        wait_until(|| stall.abandoned.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn handshake_reads_remote_version() {
        let (server, mut server_rx, addr) =
            start(options().with_handshake(VersionHandshake(1))).await;
        let client = TcpTransport::new(options().with_handshake(VersionHandshake(1)));

        let peer = client.dial(addr).await.unwrap();
        peer.send(&frame(b"after handshake")).await.unwrap();

        let rpc = recv(&mut server_rx).await;
        assert_eq!(rpc.payload, b"after handshake");
        assert_eq!(rpc.from, peer.local_addr());
        wait_until(|| server.peer_count() == 1).await;
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let (server, mut server_rx, addr) =
            start(options().with_handshake(VersionHandshake(1))).await;
        let client = TcpTransport::new(options().with_handshake(VersionHandshake(2)));

        let err = client.dial(addr).await.unwrap_err();
        assert!(matches!(err, TransportError::Handshake(_)));
        assert_eq!(client.peer_count(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(server_rx.try_recv().is_err());
        assert_eq!(server.peer_count(), 0);
    }
}
