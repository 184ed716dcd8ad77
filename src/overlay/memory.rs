//! An overlay network that lives entirely in process memory.
//!
//! [`MemoryNet`] simulates a set of agents reachable through relays and/or
//! direct paths. Streams are [`tokio::io::duplex`] pairs. Agents accept
//! streams per port through a [`MemoryListener`].

use std::{
    future::Future,
    io,
    net::{Ipv6Addr, SocketAddr, SocketAddrV6},
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use dashmap::DashMap;
use iroh::{EndpointAddr, RelayUrl, SecretKey, TransportAddr};
use n0_error::{AnyError, anyerr, e};
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf},
    sync::{mpsc, watch},
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, trace};

use super::{
    BindOverlay, DynOverlay, DynOverlaySession, Overlay, OverlayConfig, OverlaySession,
    OverlayStream,
};
use crate::{AgentId, PeerNode, PeerUpdate, TAILNET_SERVICE_PREFIX, error::OverlayError};

const STREAM_BUFFER_SIZE: usize = 64 * 1024;
const ACCEPT_BACKLOG: usize = 64;

/// How an agent can be reached.
#[derive(Debug, Clone, Default)]
pub struct AgentPaths {
    /// Home relay of the agent.
    pub relay: Option<RelayUrl>,
    /// Whether the agent advertises a direct address.
    pub direct: bool,
}

impl AgentPaths {
    pub fn relay_only(url: RelayUrl) -> Self {
        Self {
            relay: Some(url),
            direct: false,
        }
    }

    pub fn direct_only() -> Self {
        Self {
            relay: None,
            direct: true,
        }
    }
}

/// Counters of what happened on a [`MemoryNet`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetStats {
    pub binds: usize,
    pub dials: usize,
    pub relayed_dials: usize,
    pub direct_dials: usize,
    pub streams: usize,
}

/// An in-process overlay network.
#[derive(Debug, Clone, Default)]
pub struct MemoryNet {
    inner: Arc<NetInner>,
}

#[derive(Debug)]
struct NetInner {
    agents: DashMap<Ipv6Addr, Arc<AgentSlot>>,
    version: watch::Sender<u64>,
    dial_delay_ms: AtomicU64,
    fail_binds: AtomicBool,
    binds: AtomicUsize,
    dials: AtomicUsize,
    relayed_dials: AtomicUsize,
    direct_dials: AtomicUsize,
    streams: AtomicUsize,
}

impl Default for NetInner {
    fn default() -> Self {
        Self {
            agents: DashMap::new(),
            version: watch::Sender::new(0),
            dial_delay_ms: AtomicU64::new(0),
            fail_binds: AtomicBool::new(false),
            binds: AtomicUsize::new(0),
            dials: AtomicUsize::new(0),
            relayed_dials: AtomicUsize::new(0),
            direct_dials: AtomicUsize::new(0),
            streams: AtomicUsize::new(0),
        }
    }
}

#[derive(Debug)]
struct AgentSlot {
    node: PeerNode,
    listeners: DashMap<u16, mpsc::Sender<OverlayStream>>,
    gone: CancellationToken,
}

impl MemoryNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects an agent to the network.
    ///
    /// The returned handle keeps the agent connected until it is dropped.
    /// The agent still has to be announced to a coordinator with [`MemoryAgent::node`].
    pub fn add_agent(&self, agent_id: AgentId, paths: AgentPaths) -> MemoryAgent {
        let node = fake_node(agent_id, &paths);
        let addr = TAILNET_SERVICE_PREFIX.addr_from_agent_id(agent_id);
        let slot = Arc::new(AgentSlot {
            node,
            listeners: DashMap::new(),
            gone: CancellationToken::new(),
        });
        if let Some(previous) = self.inner.agents.insert(addr, slot.clone()) {
            previous.gone.cancel();
        }
        debug!(agent_id=%agent_id.fmt_short(), ?paths, "agent joined memory net");
        self.bump();
        MemoryAgent {
            net: self.clone(),
            addr,
            slot,
        }
    }

    /// Returns a factory that binds server identities on this network.
    pub fn binder(&self) -> MemoryBinder {
        MemoryBinder { net: self.clone() }
    }

    /// Delays every dial by `delay`.
    pub fn set_dial_delay(&self, delay: Duration) {
        self.inner
            .dial_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Makes subsequent binds fail.
    pub fn set_fail_binds(&self, fail: bool) {
        self.inner.fail_binds.store(fail, Ordering::Relaxed);
    }

    pub fn stats(&self) -> NetStats {
        let inner = &self.inner;
        NetStats {
            binds: inner.binds.load(Ordering::Relaxed),
            dials: inner.dials.load(Ordering::Relaxed),
            relayed_dials: inner.relayed_dials.load(Ordering::Relaxed),
            direct_dials: inner.direct_dials.load(Ordering::Relaxed),
            streams: inner.streams.load(Ordering::Relaxed),
        }
    }

    fn remove_agent(&self, addr: Ipv6Addr, slot: &Arc<AgentSlot>) {
        let removed = self
            .inner
            .agents
            .remove_if(&addr, |_, current| Arc::ptr_eq(current, slot));
        slot.gone.cancel();
        if removed.is_some() {
            debug!(agent_id=%slot.node.agent_id.fmt_short(), "agent left memory net");
            self.bump();
        }
    }

    fn bump(&self) {
        self.inner.version.send_modify(|version| *version += 1);
    }
}

/// Builds the coordinator metadata of a simulated agent.
///
/// The endpoint id is derived from the agent id so that it is stable.
fn fake_node(agent_id: AgentId, paths: &AgentPaths) -> PeerNode {
    let mut seed = [0u8; 32];
    seed[..16].copy_from_slice(agent_id.as_bytes());
    seed[16..].copy_from_slice(agent_id.as_bytes());
    let endpoint_id = SecretKey::from_bytes(&seed).public();
    let mut addr = EndpointAddr::new(endpoint_id);
    if let Some(url) = &paths.relay {
        addr.addrs.insert(TransportAddr::Relay(url.clone()));
    }
    if paths.direct {
        let octets = agent_id.as_bytes();
        let ip = SocketAddr::from(([192, 0, 2, octets[15]], 41641));
        addr.addrs.insert(TransportAddr::Ip(ip));
    }
    PeerNode { agent_id, addr }
}

/// Handle to an agent connected to a [`MemoryNet`].
///
/// Dropping the handle disconnects the agent: its sessions report closed and
/// new dials fail.
#[derive(Debug)]
pub struct MemoryAgent {
    net: MemoryNet,
    addr: Ipv6Addr,
    slot: Arc<AgentSlot>,
}

impl MemoryAgent {
    pub fn agent_id(&self) -> AgentId {
        self.slot.node.agent_id
    }

    /// Coordinator metadata announcing this agent.
    pub fn node(&self) -> PeerNode {
        self.slot.node.clone()
    }

    pub fn addr(&self) -> Ipv6Addr {
        self.addr
    }

    /// Starts accepting streams on `port`. Replaces an existing listener on the same port.
    pub fn listen(&self, port: u16) -> MemoryListener {
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        self.slot.listeners.insert(port, tx.clone());
        MemoryListener {
            port,
            slot: self.slot.clone(),
            tx,
            rx,
            accepted: Default::default(),
        }
    }
}

impl Drop for MemoryAgent {
    fn drop(&mut self) {
        self.net.remove_agent(self.addr, &self.slot);
    }
}

/// Accepts streams dialed to one port of a [`MemoryAgent`].
#[derive(Debug)]
pub struct MemoryListener {
    port: u16,
    slot: Arc<AgentSlot>,
    tx: mpsc::Sender<OverlayStream>,
    rx: mpsc::Receiver<OverlayStream>,
    accepted: Arc<AtomicUsize>,
}

impl MemoryListener {
    /// Waits for the next stream. Returns `None` once the agent is gone.
    pub async fn accept(&mut self) -> Option<OverlayStream> {
        let stream = tokio::select! {
            stream = self.rx.recv() => stream?,
            _ = self.slot.gone.cancelled() => return None,
        };
        self.accepted.fetch_add(1, Ordering::Relaxed);
        Some(stream)
    }

    /// Shared counter of accepted streams.
    pub fn accept_counter(&self) -> Arc<AtomicUsize> {
        self.accepted.clone()
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.slot
            .listeners
            .remove_if(&self.port, |_, tx| tx.same_channel(&self.tx));
    }
}

/// Binds server identities on a [`MemoryNet`].
#[derive(Debug, Clone)]
pub struct MemoryBinder {
    net: MemoryNet,
}

impl BindOverlay for MemoryBinder {
    async fn bind(&self, config: OverlayConfig) -> Result<Arc<DynOverlay<'static>>, AnyError> {
        if self.net.inner.fail_binds.load(Ordering::Relaxed) {
            return Err(anyerr!("memory net refuses to bind"));
        }
        self.net.inner.binds.fetch_add(1, Ordering::Relaxed);
        debug!(
            relays = config.relay_map.regions.len(),
            block_endpoints = config.block_endpoints,
            "bound memory overlay"
        );
        Ok(DynOverlay::new_arc(MemoryOverlay {
            net: self.net.clone(),
            config,
            peers: DashMap::new(),
            shutdown: CancellationToken::new(),
        }))
    }
}

/// A server identity bound on a [`MemoryNet`].
#[derive(Debug)]
struct MemoryOverlay {
    net: MemoryNet,
    config: OverlayConfig,
    peers: DashMap<Ipv6Addr, PeerNode>,
    shutdown: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Path {
    Direct,
    Relayed,
}

impl MemoryOverlay {
    /// Picks the path to a peer, or `None` if no path is permitted.
    fn select_path(&self, node: &PeerNode) -> Option<Path> {
        let has_direct = node
            .addr
            .addrs
            .iter()
            .any(|addr| matches!(addr, TransportAddr::Ip(_)));
        if has_direct && !self.config.block_endpoints {
            return Some(Path::Direct);
        }
        node.addr
            .addrs
            .iter()
            .any(|addr| match addr {
                TransportAddr::Relay(url) => self.config.relay_map.contains(url),
                _ => false,
            })
            .then_some(Path::Relayed)
    }

    /// Resolves `addr` to a live agent slot and path.
    fn route(&self, addr: Ipv6Addr) -> Result<(Arc<AgentSlot>, Path), OverlayError> {
        let node = self
            .peers
            .get(&addr)
            .map(|node| node.clone())
            .ok_or_else(|| e!(OverlayError::UnknownPeer { addr }))?;
        let path = self
            .select_path(&node)
            .ok_or_else(|| e!(OverlayError::Unreachable { addr }))?;
        let slot = self
            .net
            .inner
            .agents
            .get(&addr)
            .map(|slot| slot.clone())
            .filter(|slot| slot.node.addr.id == node.addr.id && !slot.gone.is_cancelled())
            .ok_or_else(|| {
                e!(OverlayError::Dial {
                    addr,
                    source: anyerr!("agent is not connected")
                })
            })?;
        Ok((slot, path))
    }
}

impl Overlay for MemoryOverlay {
    async fn dial(
        &self,
        addr: Ipv6Addr,
        port: u16,
    ) -> Result<Arc<DynOverlaySession<'static>>, OverlayError> {
        if self.shutdown.is_cancelled() {
            return Err(e!(OverlayError::Closed));
        }
        let delay = self.net.inner.dial_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let (slot, path) = self.route(addr)?;
        if !slot.listeners.contains_key(&port) {
            return Err(e!(OverlayError::Dial {
                addr,
                source: anyerr!("connection refused on port {port}")
            }));
        }
        let inner = &self.net.inner;
        inner.dials.fetch_add(1, Ordering::Relaxed);
        match path {
            Path::Direct => inner.direct_dials.fetch_add(1, Ordering::Relaxed),
            Path::Relayed => inner.relayed_dials.fetch_add(1, Ordering::Relaxed),
        };
        debug!(%addr, port, ?path, "dialed memory session");
        Ok(DynOverlaySession::new_arc(MemorySession {
            net: self.net.clone(),
            remote: SocketAddrV6::new(addr, port, 0, 0),
            slot,
            closed: self.shutdown.child_token(),
        }))
    }

    async fn await_reachable(&self, addr: Ipv6Addr) -> bool {
        let mut changes = self.net.inner.version.subscribe();
        loop {
            if self.shutdown.is_cancelled() {
                return false;
            }
            if self.route(addr).is_ok() {
                return true;
            }
            tokio::select! {
                res = changes.changed() => if res.is_err() { return false },
                _ = self.shutdown.cancelled() => return false,
            }
        }
    }

    fn update_peer(&self, update: PeerUpdate) {
        match update {
            PeerUpdate::Upsert(node) => {
                let addr = TAILNET_SERVICE_PREFIX.addr_from_agent_id(node.agent_id);
                trace!(%addr, "peer upserted");
                self.peers.insert(addr, node);
            }
            PeerUpdate::Remove(agent_id) => {
                let addr = TAILNET_SERVICE_PREFIX.addr_from_agent_id(agent_id);
                trace!(%addr, "peer removed");
                self.peers.remove(&addr);
            }
        }
        self.net.bump();
    }

    fn block_endpoints(&self) -> bool {
        self.config.block_endpoints
    }

    async fn close(&self) {
        self.shutdown.cancel();
        self.peers.clear();
    }
}

/// A session to one port of a memory agent.
#[derive(Debug)]
struct MemorySession {
    net: MemoryNet,
    remote: SocketAddrV6,
    slot: Arc<AgentSlot>,
    closed: CancellationToken,
}

impl MemorySession {
    fn session_stream(&self, inner: DuplexStream) -> SessionStream {
        SessionStream {
            inner,
            closed: Box::pin(self.closed.clone().cancelled_owned()),
            gone: Box::pin(self.slot.gone.clone().cancelled_owned()),
        }
    }
}

impl OverlaySession for MemorySession {
    async fn open_stream(&self) -> io::Result<OverlayStream> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "session is closed",
            ));
        }
        let listener = self
            .slot
            .listeners
            .get(&self.remote.port())
            .map(|tx| tx.clone())
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        let (local, remote) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        let peer = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0);
        listener
            .send(OverlayStream::new(peer, self.session_stream(remote)))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        self.net.inner.streams.fetch_add(1, Ordering::Relaxed);
        Ok(OverlayStream::new(self.remote, self.session_stream(local)))
    }

    fn remote(&self) -> SocketAddrV6 {
        self.remote
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.slot.gone.is_cancelled()
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// One end of a stream. Fails once its session is closed or the agent leaves.
struct SessionStream {
    inner: DuplexStream,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
    gone: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl SessionStream {
    fn poll_aborted(&mut self, cx: &mut Context<'_>) -> Option<io::Error> {
        let aborted =
            self.closed.as_mut().poll(cx).is_ready() || self.gone.as_mut().poll(cx).is_ready();
        aborted.then(|| io::Error::new(io::ErrorKind::ConnectionAborted, "session closed"))
    }
}

impl AsyncRead for SessionStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(err) = self.poll_aborted(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SessionStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Some(err) = self.poll_aborted(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(err) = self.poll_aborted(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use n0_error::{Result, StdResultExt};
    use n0_tracing_test::traced_test;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn relay_url() -> RelayUrl {
        "https://relay.memory.test./".parse().unwrap()
    }

    async fn bind(net: &MemoryNet, config: OverlayConfig) -> Arc<DynOverlay<'static>> {
        net.binder().bind(config).await.unwrap()
    }

    #[tokio::test]
    #[traced_test]
    async fn stream_roundtrip() -> Result {
        let net = MemoryNet::new();
        let agent = net.add_agent(AgentId::new_random(), AgentPaths::direct_only());
        let mut listener = agent.listen(80);
        let overlay = bind(&net, OverlayConfig::default()).await;
        overlay.update_peer(PeerUpdate::Upsert(agent.node()));

        let session = overlay.dial(agent.addr(), 80).await?;
        let mut stream = session.open_stream().await?;
        stream.write_all(b"ping").await?;
        let mut accepted = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"ping");
        assert_eq!(listener.accept_counter().load(Ordering::Relaxed), 1);
        assert_eq!(net.stats().direct_dials, 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn block_endpoints_forces_relay() -> Result {
        let net = MemoryNet::new();
        let url = relay_url();
        let both = AgentPaths {
            relay: Some(url.clone()),
            direct: true,
        };
        let agent = net.add_agent(AgentId::new_random(), both);
        let _listener = agent.listen(4);
        let direct_only = net.add_agent(AgentId::new_random(), AgentPaths::direct_only());
        let _listener2 = direct_only.listen(4);

        let config = OverlayConfig {
            relay_map: crate::RelayMap::from_urls([url]),
            block_endpoints: true,
        };
        let overlay = bind(&net, config).await;
        overlay.update_peer(PeerUpdate::Upsert(agent.node()));
        overlay.update_peer(PeerUpdate::Upsert(direct_only.node()));

        overlay.dial(agent.addr(), 4).await?;
        assert_eq!(net.stats().relayed_dials, 1);
        assert_eq!(net.stats().direct_dials, 0);

        let err = overlay.dial(direct_only.addr(), 4).await.err().expect("dial should fail");
        assert!(matches!(err, OverlayError::Unreachable { .. }));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn unknown_peer_and_refused_port() -> Result {
        let net = MemoryNet::new();
        let agent = net.add_agent(AgentId::new_random(), AgentPaths::direct_only());
        let overlay = bind(&net, OverlayConfig::default()).await;

        let err = overlay.dial(agent.addr(), 4).await.err().expect("dial should fail");
        assert!(matches!(err, OverlayError::UnknownPeer { .. }));

        overlay.update_peer(PeerUpdate::Upsert(agent.node()));
        let err = overlay.dial(agent.addr(), 4).await.err().expect("dial should fail");
        assert!(matches!(err, OverlayError::Dial { .. }));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn agent_drop_closes_sessions() -> Result {
        let net = MemoryNet::new();
        let agent = net.add_agent(AgentId::new_random(), AgentPaths::direct_only());
        let _listener = agent.listen(4);
        let overlay = bind(&net, OverlayConfig::default()).await;
        overlay.update_peer(PeerUpdate::Upsert(agent.node()));
        let session = overlay.dial(agent.addr(), 4).await?;
        assert!(!session.is_closed());
        drop(agent);
        assert!(session.is_closed());
        assert!(session.open_stream().await.is_err());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn session_close_aborts_streams() -> Result {
        let net = MemoryNet::new();
        let agent = net.add_agent(AgentId::new_random(), AgentPaths::direct_only());
        let mut listener = agent.listen(4);
        let overlay = bind(&net, OverlayConfig::default()).await;
        overlay.update_peer(PeerUpdate::Upsert(agent.node()));
        let session = overlay.dial(agent.addr(), 4).await?;
        let mut stream = session.open_stream().await?;
        let mut accepted = listener.accept().await.unwrap();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            accepted.read(&mut buf).await
        });
        session.close();
        let err = reader.await.anyerr()?.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        let err = stream.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn await_reachable_wakes_on_join() -> Result {
        let net = MemoryNet::new();
        let overlay = bind(&net, OverlayConfig::default()).await;
        let agent_id = AgentId::new_random();
        let addr = TAILNET_SERVICE_PREFIX.addr_from_agent_id(agent_id);

        let waiter = {
            let overlay = overlay.clone();
            tokio::spawn(async move { overlay.await_reachable(addr).await })
        };
        tokio::task::yield_now().await;
        let agent = net.add_agent(agent_id, AgentPaths::direct_only());
        overlay.update_peer(PeerUpdate::Upsert(agent.node()));
        assert!(waiter.await.anyerr()?);
        Ok(())
    }
}
