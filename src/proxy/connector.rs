use std::{
    future::Future,
    io,
    net::{IpAddr, Ipv6Addr},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use http::{Uri, uri::Scheme};
use hyper_util::{
    client::legacy::connect::{Connected, Connection},
    rt::TokioIo,
};
use n0_error::{anyerr, e};
use rustls::{ClientConfig, pki_types::ServerName};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::{TlsConnector, client::TlsStream};
use tracing::{debug, warn};

use crate::{
    AgentId,
    cache::{AgentConn, ConnectionCache},
    error::ConnectError,
    metrics::{NETWORK_TCP, OpenConnectionGuard, ServerMetrics},
    overlay::OverlayStream,
};

/// Connector of the HTTP client for one agent.
///
/// Every transport connection holds a lease on the agent's cached session and
/// runs over its own overlay stream. URIs that do not name the agent's virtual
/// address are refused.
#[derive(Clone, derive_more::Debug)]
pub(crate) struct AgentConnector {
    cache: ConnectionCache,
    agent_id: AgentId,
    addr: Ipv6Addr,
    #[debug("Arc<ClientConfig>")]
    tls: Arc<ClientConfig>,
    metrics: ServerMetrics,
}

impl AgentConnector {
    pub(crate) fn new(
        cache: ConnectionCache,
        agent_id: AgentId,
        addr: Ipv6Addr,
        tls: Arc<ClientConfig>,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            cache,
            agent_id,
            addr,
            tls,
            metrics,
        }
    }

    fn addresses_agent(&self, uri: &Uri) -> bool {
        uri.host()
            .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
            .and_then(|host| host.parse::<Ipv6Addr>().ok())
            == Some(self.addr)
    }

    async fn connect(self, uri: Uri) -> Result<ProxyConn, ConnectError> {
        let agent_id = self.agent_id;
        if !self.addresses_agent(&uri) {
            warn!(agent_id=%agent_id.fmt_short(), %uri, "refusing to connect to foreign address");
            return Err(e!(ConnectError::Misdirected { agent_id, uri }));
        }
        let https = uri.scheme() == Some(&Scheme::HTTPS);
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

        let lease = self.cache.acquire(agent_id, port).await?;
        let stream = lease.open_stream().await?;
        let io = if https {
            let server_name = ServerName::IpAddress(IpAddr::V6(self.addr).into());
            let tls = TlsConnector::from(self.tls.clone())
                .connect(server_name, stream)
                .await
                .map_err(|err| {
                    e!(ConnectError::DialFailure {
                        agent_id,
                        port,
                        timed_out: false,
                        source: anyerr!(err)
                    })
                })?;
            ConnStream::Tls(Box::new(tls))
        } else {
            ConnStream::Plain(stream)
        };
        debug!(agent_id=%agent_id.fmt_short(), port, https, "opened transport connection");
        let guard = self.metrics.connection_opened(NETWORK_TCP);
        Ok(ProxyConn {
            io: TokioIo::new(io),
            lease,
            _guard: guard,
        })
    }
}

impl tower_service::Service<Uri> for AgentConnector {
    type Response = ProxyConn;
    type Error = ConnectError;
    type Future = Pin<Box<dyn Future<Output = Result<ProxyConn, ConnectError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        Box::pin(self.clone().connect(uri))
    }
}

/// A plain or TLS byte stream over an overlay stream.
enum ConnStream {
    Plain(OverlayStream),
    Tls(Box<TlsStream<OverlayStream>>),
}

impl AsyncRead for ConnStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            ConnStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ConnStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            ConnStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            ConnStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            ConnStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A transport connection of the HTTP client, holding a lease on its session.
///
/// The lease is released when the HTTP client drops the connection from its
/// pool. An I/O error fails only this connection, unless the session itself
/// has closed, in which case it is evicted from the cache.
pub(crate) struct ProxyConn {
    io: TokioIo<ConnStream>,
    lease: AgentConn,
    _guard: OpenConnectionGuard,
}

impl ProxyConn {
    fn observe<T>(&self, res: &Poll<io::Result<T>>) {
        let Poll::Ready(Err(err)) = res else {
            return;
        };
        if self.lease.is_closed() {
            debug!(agent_id=%self.lease.agent_id().fmt_short(), "session failed: {err:#}");
            self.lease.mark_broken();
        } else {
            debug!(agent_id=%self.lease.agent_id().fmt_short(), "stream failed: {err:#}");
        }
    }
}

impl hyper::rt::Read for ProxyConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        let res = hyper::rt::Read::poll_read(Pin::new(&mut self.io), cx, buf);
        self.observe(&res);
        res
    }
}

impl hyper::rt::Write for ProxyConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let res = hyper::rt::Write::poll_write(Pin::new(&mut self.io), cx, buf);
        self.observe(&res);
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let res = hyper::rt::Write::poll_flush(Pin::new(&mut self.io), cx);
        self.observe(&res);
        res
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.io), cx)
    }
}

impl Connection for ProxyConn {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}
