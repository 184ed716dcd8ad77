//! The overlay-network capability consumed by the multiplexer.
//!
//! An overlay identity dials peers by virtual address and port into a
//! [`OverlaySession`], on which any number of byte streams can be opened.
//! Two implementations ship with the crate: an in-process network in
//! [`memory`], and an iroh-backed one in [`iroh`].

use std::{
    fmt,
    future::Future,
    io,
    net::{Ipv6Addr, SocketAddrV6},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use dynosaur::dynosaur;
use n0_error::AnyError;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{PeerUpdate, error::OverlayError, relay::RelayMap};

pub mod iroh;
pub mod memory;

/// Configuration an overlay identity is bound with.
#[derive(Debug, Clone, Default)]
pub struct OverlayConfig {
    /// Relays the identity may route through.
    pub relay_map: RelayMap,
    /// Forces all traffic through relays, even when a direct path would work.
    pub block_endpoints: bool,
}

#[dynosaur(pub DynBindOverlay = dyn(box) BindOverlay)]
/// Factory for the server's overlay identity.
pub trait BindOverlay: Send + Sync {
    /// Binds a new overlay identity with the given configuration.
    fn bind(
        &self,
        config: OverlayConfig,
    ) -> impl Future<Output = Result<Arc<DynOverlay<'static>>, AnyError>> + Send;
}

#[dynosaur(pub DynOverlay = dyn(box) Overlay)]
/// A bound overlay identity.
///
/// The peer table is updated from coordinator notifications through
/// [`Overlay::update_peer`]; dials only succeed for peers present in it.
pub trait Overlay: Send + Sync {
    /// Dials `port` on the peer owning `addr`.
    fn dial(
        &self,
        addr: Ipv6Addr,
        port: u16,
    ) -> impl Future<Output = Result<Arc<DynOverlaySession<'static>>, OverlayError>> + Send;

    /// Waits until the peer owning `addr` is reachable.
    ///
    /// Callers bound the wait with a timeout.
    fn await_reachable(&self, addr: Ipv6Addr) -> impl Future<Output = bool> + Send;

    /// Applies a coordinator notification to the peer table.
    fn update_peer(&self, update: PeerUpdate);

    /// Whether direct paths are forbidden and every path goes through relays.
    fn block_endpoints(&self) -> bool;

    /// Shuts the identity down. Later dials fail with [`OverlayError::Closed`].
    fn close(&self) -> impl Future<Output = ()> + Send;
}

#[dynosaur(pub DynOverlaySession = dyn(box) OverlaySession)]
/// A dialed session to one peer and port.
///
/// Sessions are multiplexed: streams may be opened concurrently.
pub trait OverlaySession: Send + Sync {
    /// Opens a new byte stream to the session's peer and port.
    fn open_stream(&self) -> impl Future<Output = io::Result<OverlayStream>> + Send;

    /// Remote virtual address and port.
    fn remote(&self) -> SocketAddrV6;

    /// Whether the session can no longer be used.
    fn is_closed(&self) -> bool;

    /// Closes the session. Streams already opened may fail afterwards.
    fn close(&self);
}

/// Any bidirectional async byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A byte stream opened on an [`OverlaySession`].
pub struct OverlayStream {
    remote: SocketAddrV6,
    inner: Box<dyn AsyncStream>,
}

impl fmt::Debug for OverlayStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayStream")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl OverlayStream {
    pub fn new(remote: SocketAddrV6, inner: impl AsyncStream + 'static) -> Self {
        Self {
            remote,
            inner: Box::new(inner),
        }
    }

    pub fn remote(&self) -> SocketAddrV6 {
        self.remote
    }
}

impl AsyncRead for OverlayStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for OverlayStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}
