//! Overlay implementation on top of iroh.
//!
//! The server binds an [`Endpoint`] whose address book is fed from coordinator
//! notifications through a [`StaticProvider`]. A dial opens (or reuses) a QUIC
//! connection to the agent's endpoint through an iroh-blobs [`ConnectionPool`].
//! Each overlay stream is a bidirectional QUIC stream that starts with a short
//! header naming the destination port; on the agent, [`AgentListener`] reads
//! that header and forwards the stream to the local TCP port.
//!
//! With `block_endpoints` set, direct addresses are stripped from the address
//! book, so connections start on the relay. iroh may still upgrade such a
//! connection to a direct path through in-band holepunching.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddrV6},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use iroh::{
    Endpoint, EndpointId, TransportAddr,
    discovery::static_provider::StaticProvider,
    endpoint::{Connection, ConnectionError, RecvStream, SendStream},
    protocol::{AcceptError, ProtocolHandler},
};
use iroh_blobs::util::connection_pool::{self, ConnectionPool, ConnectionRef};
use n0_error::{AnyError, Result, StdResultExt, anyerr, e};
use tokio::{net::TcpStream, sync::watch};
use tokio_util::{future::FutureExt, sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error_span, warn};

use super::{
    BindOverlay, DynOverlay, DynOverlaySession, Overlay, OverlayConfig, OverlaySession,
    OverlayStream,
};
use crate::{PeerUpdate, TAILNET_SERVICE_PREFIX, error::OverlayError};

/// The ALPN spoken between the server and agents.
pub const ALPN: &[u8] = b"server-tailnet/0";

/// Prefix of the header that opens every overlay stream, followed by the port in big endian.
const STREAM_MAGIC: [u8; 4] = *b"stn0";
const STREAM_HEADER_LEN: usize = STREAM_MAGIC.len() + 2;

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);
const REACHABILITY_RETRY: Duration = Duration::from_millis(500);

/// Options for the QUIC connection pool below the overlay.
#[derive(Debug, Clone)]
pub struct IrohPoolOpts {
    /// Maximum time to wait when establishing a new connection.
    pub connect_timeout: Duration,
    /// How long to keep unused connections open before closing them.
    pub idle_timeout: Duration,
}

impl Default for IrohPoolOpts {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(5),
        }
    }
}

impl From<IrohPoolOpts> for connection_pool::Options {
    fn from(opts: IrohPoolOpts) -> Self {
        connection_pool::Options {
            connect_timeout: opts.connect_timeout,
            idle_timeout: opts.idle_timeout,
            ..Default::default()
        }
    }
}

/// Binds server identities as iroh endpoints.
#[derive(Debug, Clone, Default)]
pub struct IrohBinder {
    pool: IrohPoolOpts,
}

impl IrohBinder {
    pub fn new(pool: IrohPoolOpts) -> Self {
        Self { pool }
    }
}

impl BindOverlay for IrohBinder {
    async fn bind(&self, config: OverlayConfig) -> Result<Arc<DynOverlay<'static>>, AnyError> {
        let discovery = StaticProvider::new();
        let endpoint = Endpoint::empty_builder(config.relay_map.to_relay_mode())
            .discovery(discovery.clone())
            .bind()
            .await
            .std_context("failed to bind iroh endpoint")?;
        debug!(endpoint_id=%endpoint.id().fmt_short(), "bound iroh overlay");
        let overlay = IrohOverlay::new(endpoint, discovery, config, self.pool.clone());
        Ok(DynOverlay::new_arc(overlay))
    }
}

#[derive(Debug, Clone, Copy)]
struct PeerEntry {
    endpoint_id: EndpointId,
    /// Whether any path remains after filtering.
    routable: bool,
}

/// A server identity backed by an iroh [`Endpoint`].
#[derive(Debug)]
pub struct IrohOverlay {
    endpoint: Endpoint,
    discovery: StaticProvider,
    pool: ConnectionPool,
    peers: DashMap<Ipv6Addr, PeerEntry>,
    changes: watch::Sender<u64>,
    block_endpoints: bool,
    closed: AtomicBool,
}

impl IrohOverlay {
    /// Wraps an endpoint that was bound with `discovery` as its address lookup.
    pub fn new(
        endpoint: Endpoint,
        discovery: StaticProvider,
        config: OverlayConfig,
        pool: IrohPoolOpts,
    ) -> Self {
        let pool = ConnectionPool::new(endpoint.clone(), ALPN, pool.into());
        Self {
            endpoint,
            discovery,
            pool,
            peers: DashMap::new(),
            changes: watch::Sender::new(0),
            block_endpoints: config.block_endpoints,
            closed: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn peer(&self, addr: Ipv6Addr) -> Result<EndpointId, OverlayError> {
        let entry = self
            .peers
            .get(&addr)
            .map(|entry| *entry)
            .ok_or_else(|| e!(OverlayError::UnknownPeer { addr }))?;
        if !entry.routable {
            return Err(e!(OverlayError::Unreachable { addr }));
        }
        Ok(entry.endpoint_id)
    }

    async fn connect(&self, addr: Ipv6Addr) -> Result<ConnectionRef, OverlayError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(e!(OverlayError::Closed));
        }
        let endpoint_id = self.peer(addr)?;
        self.pool.get_or_connect(endpoint_id).await.map_err(|err| {
            e!(OverlayError::Dial {
                addr,
                source: anyerr!(err)
            })
        })
    }
}

impl Overlay for IrohOverlay {
    async fn dial(
        &self,
        addr: Ipv6Addr,
        port: u16,
    ) -> Result<Arc<DynOverlaySession<'static>>, OverlayError> {
        let conn = self.connect(addr).await?;
        debug!(%addr, port, remote=%conn.remote_id().fmt_short(), "dialed iroh session");
        Ok(DynOverlaySession::new_arc(IrohSession {
            conn,
            remote: SocketAddrV6::new(addr, port, 0, 0),
            closed: AtomicBool::new(false),
        }))
    }

    async fn await_reachable(&self, addr: Ipv6Addr) -> bool {
        let mut changes = self.changes.subscribe();
        loop {
            if self.closed.load(Ordering::Relaxed) {
                return false;
            }
            if self.peer(addr).is_ok() && self.connect(addr).await.is_ok() {
                return true;
            }
            tokio::select! {
                res = changes.changed() => if res.is_err() { return false },
                _ = tokio::time::sleep(REACHABILITY_RETRY) => {}
            }
        }
    }

    fn update_peer(&self, update: PeerUpdate) {
        match update {
            PeerUpdate::Upsert(node) => {
                let vaddr = TAILNET_SERVICE_PREFIX.addr_from_agent_id(node.agent_id);
                let mut addr = node.addr;
                if self.block_endpoints {
                    addr.addrs
                        .retain(|addr| matches!(addr, TransportAddr::Relay(_)));
                }
                let entry = PeerEntry {
                    endpoint_id: addr.id,
                    routable: !addr.addrs.is_empty(),
                };
                self.discovery.add_endpoint_info(addr);
                self.peers.insert(vaddr, entry);
            }
            PeerUpdate::Remove(agent_id) => {
                let vaddr = TAILNET_SERVICE_PREFIX.addr_from_agent_id(agent_id);
                if let Some((_, entry)) = self.peers.remove(&vaddr) {
                    self.discovery.remove_endpoint_info(entry.endpoint_id);
                }
            }
        }
        self.changes.send_modify(|version| *version += 1);
    }

    fn block_endpoints(&self) -> bool {
        self.block_endpoints
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.peers.clear();
        self.endpoint.close().await;
        debug!("iroh overlay closed");
    }
}

#[derive(Debug)]
struct IrohSession {
    conn: ConnectionRef,
    remote: SocketAddrV6,
    closed: AtomicBool,
}

impl OverlaySession for IrohSession {
    async fn open_stream(&self) -> io::Result<OverlayStream> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "session is closed",
            ));
        }
        let (mut send, recv) = self.conn.open_bi().await.map_err(io::Error::other)?;
        send.write_all(&stream_header(self.remote.port()))
            .await
            .map_err(io::Error::other)?;
        Ok(OverlayStream::new(self.remote, tokio::io::join(recv, send)))
    }

    fn remote(&self) -> SocketAddrV6 {
        self.remote
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed) || self.conn.close_reason().is_some()
    }

    fn close(&self) {
        // The connection itself is shared through the pool and closes once idle.
        self.closed.store(true, Ordering::Relaxed);
    }
}

/// Agent-side protocol handler that forwards overlay streams to local TCP ports.
///
/// Register it on the agent's router under [`ALPN`]:
///
/// ```ignore
/// let router = Router::builder(endpoint)
///     .accept(ALPN, AgentListener::new())
///     .spawn();
/// ```
#[derive(Debug)]
pub struct AgentListener {
    target: IpAddr,
    connections: AtomicU64,
    shutdown: CancellationToken,
    streams: TaskTracker,
}

impl Default for AgentListener {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentListener {
    /// Creates a listener that forwards to ports on localhost.
    pub fn new() -> Self {
        Self::with_target(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    /// Creates a listener that forwards to ports on `target`.
    pub fn with_target(target: IpAddr) -> Self {
        Self {
            target,
            connections: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            streams: TaskTracker::new(),
        }
    }

    /// Accepts streams until the connection or the listener closes.
    async fn serve_streams(&self, connection: Connection) -> Result<()> {
        let mut forwarded = 0u64;
        let reason = loop {
            let accepted = connection
                .accept_bi()
                .with_cancellation_token(&self.shutdown)
                .await;
            let (send, recv) = match accepted {
                Some(Ok(streams)) => streams,
                None => break "listener shut down",
                Some(Err(
                    ConnectionError::ApplicationClosed(_) | ConnectionError::LocallyClosed,
                )) => break "connection closed",
                Some(Err(err)) => return Err(err).std_context("failed to accept streams"),
            };
            let stream = ForwardStream {
                target: self.target,
                send,
                recv,
            };
            self.streams.spawn(
                stream
                    .run(self.shutdown.clone())
                    .instrument(error_span!("stream", id = forwarded)),
            );
            forwarded += 1;
        };
        debug!(forwarded, "{reason}");
        Ok(())
    }
}

impl ProtocolHandler for AgentListener {
    async fn accept(&self, connection: Connection) -> std::result::Result<(), AcceptError> {
        let id = self.connections.fetch_add(1, Ordering::Relaxed);
        let span = error_span!("agent-conn", id, remote_id = %connection.remote_id().fmt_short());
        self.serve_streams(connection)
            .instrument(span)
            .await
            .map_err(AcceptError::from_err)
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
        self.streams.close();
        let pending = self.streams.len();
        if self
            .streams
            .wait()
            .timeout(GRACEFUL_SHUTDOWN_TIMEOUT)
            .await
            .is_ok()
        {
            debug!(pending, "agent listener stopped");
        } else {
            warn!(pending, remaining = self.streams.len(), "streams still open after grace period");
        }
    }
}

/// Writes the header that opens an overlay stream to `port`.
fn stream_header(port: u16) -> [u8; STREAM_HEADER_LEN] {
    let mut header = [0u8; STREAM_HEADER_LEN];
    let (magic, port_bytes) = header.split_at_mut(STREAM_MAGIC.len());
    magic.copy_from_slice(&STREAM_MAGIC);
    port_bytes.copy_from_slice(&port.to_be_bytes());
    header
}

/// Returns the destination port, or `None` if the magic does not match.
fn parse_stream_header(header: &[u8; STREAM_HEADER_LEN]) -> Option<u16> {
    let (magic, port) = header.split_at(STREAM_MAGIC.len());
    (magic == STREAM_MAGIC).then(|| u16::from_be_bytes([port[0], port[1]]))
}

/// An accepted overlay stream on its way to a local port.
struct ForwardStream {
    target: IpAddr,
    send: SendStream,
    recv: RecvStream,
}

impl ForwardStream {
    async fn run(self, shutdown: CancellationToken) {
        match self.forward().await {
            Ok(()) => {}
            Err(err) if shutdown.is_cancelled() => debug!("aborted at shutdown: {err:#}"),
            Err(err) => warn!("failed to forward stream: {err:#}"),
        }
    }

    async fn forward(mut self) -> Result<()> {
        let mut header = [0u8; STREAM_HEADER_LEN];
        self.recv
            .read_exact(&mut header)
            .await
            .std_context("failed to read stream header")?;
        let port = parse_stream_header(&header).ok_or_else(|| anyerr!("invalid stream header"))?;
        let mut origin = match TcpStream::connect((self.target, port)).await {
            Ok(origin) => origin,
            Err(err) => {
                // The reset fails only this stream, the connection stays up.
                debug!(port, "local port refused: {err:#}");
                self.send.reset(0u32.into()).ok();
                return Ok(());
            }
        };
        let mut overlay = tokio::io::join(self.recv, self.send);
        let (to_origin, from_origin) = tokio::io::copy_bidirectional(&mut overlay, &mut origin)
            .await
            .std_context("failed to forward stream")?;
        debug!(port, to_origin, from_origin, "stream finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_header_names_port() {
        let header = stream_header(4444);
        assert_eq!(&header[..STREAM_MAGIC.len()], b"stn0");
        assert_eq!(parse_stream_header(&header), Some(4444));
        assert_eq!(parse_stream_header(&stream_header(0)), Some(0));

        let mut foreign = header;
        foreign[0] = b'x';
        assert_eq!(parse_stream_header(&foreign), None);
    }
}
