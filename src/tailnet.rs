use std::{
    fmt,
    net::Ipv6Addr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use http::Uri;
use n0_error::{Result, e};
use n0_future::task::AbortOnDropHandle;
use rustls::ClientConfig;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, info, warn};

use crate::{
    AGENT_HTTP_API_PORT, AgentId, TAILNET_SERVICE_PREFIX,
    cache::{AgentConn, ConnectionCache, PoolOpts},
    coordinator::{Coordinator, PeerUpdate},
    dialer::{OverlayIdentity, TailnetDialer},
    error::{ConnectError, DialError},
    metrics::ServerMetrics,
    overlay::{DynOverlay, Overlay},
    proxy::{
        AgentClient, AgentConnector, AppContext, DEFAULT_HTTP_POOL_IDLE_TIMEOUT,
        DynErrorResponder, ErrorResponder, ReverseProxy, agent_client, insecure_client_config,
    },
    relay::RelayMap,
};

/// Configuration of a [`ServerTailnet`].
#[derive(derive_more::Debug, Clone)]
pub struct ServerTailnetOpts {
    /// Connection cache timeouts.
    pub pool: PoolOpts,
    /// Port used by [`ServerTailnet::agent_conn`].
    pub agent_port: u16,
    /// How long an unused HTTP connection to an agent stays pooled.
    pub http_pool_idle_timeout: Duration,
    #[debug("{:?}", tls_config.as_ref().map(|_| "ClientConfig"))]
    tls_config: Option<Arc<ClientConfig>>,
    #[debug("{:?}", error_responder.as_ref().map(|_| "DynErrorResponder"))]
    error_responder: Option<Arc<DynErrorResponder<'static>>>,
}

impl Default for ServerTailnetOpts {
    fn default() -> Self {
        Self {
            pool: PoolOpts::default(),
            agent_port: AGENT_HTTP_API_PORT,
            http_pool_idle_timeout: DEFAULT_HTTP_POOL_IDLE_TIMEOUT,
            tls_config: None,
            error_responder: None,
        }
    }
}

impl ServerTailnetOpts {
    pub fn pool(mut self, pool: PoolOpts) -> Self {
        self.pool = pool;
        self
    }

    pub fn agent_port(mut self, port: u16) -> Self {
        self.agent_port = port;
        self
    }

    pub fn http_pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.http_pool_idle_timeout = timeout;
        self
    }

    /// Sets the TLS configuration for HTTPS destinations.
    ///
    /// If not set, server certificates are not verified.
    pub fn tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Sets the generator of error pages for failed proxy requests.
    ///
    /// If not set, [`OfflinePage`](crate::proxy::OfflinePage) is used.
    pub fn error_responder(mut self, responder: impl ErrorResponder + 'static) -> Self {
        self.error_responder = Some(DynErrorResponder::new_arc(responder));
        self
    }
}

/// Server-side multiplexer of connections to agents.
///
/// Owns the overlay identity, the connection cache and one HTTP client per
/// agent. Cloning is cheap and yields a handle to the same multiplexer.
#[derive(Clone)]
pub struct ServerTailnet {
    inner: Arc<TailnetInner>,
}

impl fmt::Debug for ServerTailnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTailnet")
            .field("client_id", &self.inner.identity.client_id)
            .field("cache", &self.inner.cache)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

struct TailnetInner {
    identity: OverlayIdentity,
    cache: ConnectionCache,
    metrics: ServerMetrics,
    clients: Arc<DashMap<AgentId, AgentClient>>,
    tls_config: Arc<ClientConfig>,
    error_responder: Option<Arc<DynErrorResponder<'static>>>,
    agent_port: u16,
    http_pool_idle_timeout: Duration,
    closed: AtomicBool,
    shutdown: CancellationToken,
    _peer_updates: AbortOnDropHandle<()>,
}

impl ServerTailnet {
    /// Dials the overlay identity and sets up the multiplexer around it.
    pub async fn new(dialer: &TailnetDialer, opts: ServerTailnetOpts) -> Result<Self, DialError> {
        let metrics = ServerMetrics::new().map_err(|source| e!(DialError::Setup { source }))?;
        let tls_config = match opts.tls_config {
            Some(config) => config,
            None => insecure_client_config().map_err(|source| e!(DialError::Setup { source }))?,
        };

        let identity = dialer.dial().await?;
        let shutdown = CancellationToken::new();
        let clients = Arc::new(DashMap::new());
        let peer_updates = spawn_peer_updates(
            identity.coordinator.subscribe(),
            identity.overlay.clone(),
            clients.clone(),
            shutdown.clone(),
        );
        let cache = ConnectionCache::new(
            identity.overlay.clone(),
            identity.coordinator.clone(),
            opts.pool,
            metrics.clone(),
        );
        Ok(Self {
            inner: Arc::new(TailnetInner {
                identity,
                cache,
                metrics,
                clients,
                tls_config,
                error_responder: opts.error_responder,
                agent_port: opts.agent_port,
                http_pool_idle_timeout: opts.http_pool_idle_timeout,
                closed: AtomicBool::new(false),
                shutdown,
                _peer_updates: peer_updates,
            }),
        })
    }

    /// Returns a lease on the connection to the agent's API port.
    pub async fn agent_conn(&self, agent_id: AgentId) -> Result<AgentConn, ConnectError> {
        self.inner
            .cache
            .acquire(agent_id, self.inner.agent_port)
            .await
    }

    /// Creates a reverse proxy to the application at `destination` inside the agent.
    ///
    /// `destination` is the application's URL as seen from inside the agent; only
    /// its scheme, port, path and query are used. A non-empty `signed_token` is
    /// forwarded with every request.
    pub fn reverse_proxy(
        &self,
        destination: Uri,
        dashboard_url: Uri,
        agent_id: AgentId,
        app: AppContext,
        signed_token: &str,
    ) -> Result<ReverseProxy> {
        ReverseProxy::new(
            destination,
            dashboard_url,
            agent_id,
            app,
            signed_token,
            self.agent_client(agent_id),
            self.inner.error_responder.clone(),
        )
    }

    fn agent_client(&self, agent_id: AgentId) -> AgentClient {
        self.inner
            .clients
            .entry(agent_id)
            .or_insert_with(|| {
                debug!(agent_id=%agent_id.fmt_short(), "creating HTTP client");
                let connector = AgentConnector::new(
                    self.inner.cache.clone(),
                    agent_id,
                    TAILNET_SERVICE_PREFIX.addr_from_agent_id(agent_id),
                    self.inner.tls_config.clone(),
                    self.inner.metrics.clone(),
                );
                agent_client(connector, self.inner.http_pool_idle_timeout)
            })
            .clone()
    }

    /// The agent's virtual address.
    pub fn agent_addr(&self, agent_id: AgentId) -> Ipv6Addr {
        TAILNET_SERVICE_PREFIX.addr_from_agent_id(agent_id)
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.inner.metrics
    }

    /// Whether direct connections are blocked and every path goes through relays.
    pub fn block_endpoints(&self) -> bool {
        self.inner.identity.overlay.block_endpoints()
    }

    pub fn client_id(&self) -> AgentId {
        self.inner.identity.client_id
    }

    pub fn relay_map(&self) -> &RelayMap {
        &self.inner.identity.relay_map
    }

    /// Number of agents with a pooled HTTP client.
    pub(crate) fn http_client_count(&self) -> usize {
        self.inner.clients.len()
    }

    pub fn cache(&self) -> &ConnectionCache {
        &self.inner.cache
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Closes all agent connections, the overlay identity and deregisters it.
    ///
    /// Later acquisitions fail with [`ConnectError::Closed`]. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!("server tailnet already closed");
            return Ok(());
        }
        self.inner.shutdown.cancel();
        self.inner.clients.clear();
        self.inner.cache.close().await;
        self.inner.identity.overlay.close().await;
        let client_id = self.inner.identity.client_id;
        self.inner.identity.coordinator.deregister(client_id).await;
        info!(client_id=%client_id.fmt_short(), "server tailnet closed");
        Ok(())
    }
}

/// Pushes coordinator updates into the overlay's peer table until cancelled.
///
/// The HTTP client of a removed agent is dropped. Proxies created before the
/// removal keep their own handle to it.
fn spawn_peer_updates(
    mut updates: broadcast::Receiver<PeerUpdate>,
    overlay: Arc<DynOverlay<'static>>,
    clients: Arc<DashMap<AgentId, AgentClient>>,
    shutdown: CancellationToken,
) -> AbortOnDropHandle<()> {
    let task = async move {
        loop {
            let update = tokio::select! {
                _ = shutdown.cancelled() => break,
                update = updates.recv() => update,
            };
            match update {
                Ok(update) => {
                    if let PeerUpdate::Remove(agent_id) = &update
                        && clients.remove(agent_id).is_some()
                    {
                        debug!(agent_id=%agent_id.fmt_short(), "dropped client of removed agent");
                    }
                    overlay.update_peer(update);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "peer updates lagged");
                }
                Err(RecvError::Closed) => {
                    debug!("coordinator closed the update stream");
                    break;
                }
            }
        }
    };
    AbortOnDropHandle::new(tokio::spawn(task.instrument(error_span!("peer-updates"))))
}
