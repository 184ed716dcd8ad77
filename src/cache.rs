//! Reference-counted cache of overlay sessions, keyed by agent and port.
//!
//! Every entry moves through `Empty → Dialing → Live → Closing → Gone`:
//!
//! * **Dialing**: exactly one dial task runs for the key. Acquirers wait on a
//!   broadcast-once [`watch`] channel for its outcome.
//! * **Live**: the session is handed out to leases. When the last lease is
//!   released an idle timer is armed; an acquisition disarms it.
//! * **Closing**: the entry has been removed from the map (idle expiry,
//!   eviction of a broken session, or [`ConnectionCache::close`]) and its
//!   session is being closed.
//!
//! Each entry carries a unique id. Releases and evictions name the id they
//! were issued for and never touch a newer entry for the same key.

use std::{
    fmt,
    net::SocketAddrV6,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::{DashMap, mapref::entry::Entry as MapEntry};
use n0_error::{anyerr, e};
use n0_future::task::AbortOnDropHandle;
use tokio::{runtime::Handle, sync::watch};
use tokio_util::{future::FutureExt as _, sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error_span, trace, warn};

use crate::{
    AgentId, DynCoordinator, PeerUpdate, TAILNET_SERVICE_PREFIX,
    coordinator::Coordinator,
    error::{ConnectError, OverlayError},
    metrics::{NETWORK_TCP, ServerMetrics},
    overlay::{DynOverlay, DynOverlaySession, Overlay, OverlaySession, OverlayStream},
};

/// Default bound on a single overlay dial.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default time an unused session stays cached.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration of the connection cache.
#[derive(Debug, Clone)]
pub struct PoolOpts {
    /// Maximum time a dial may take, including the coordinator lookup.
    pub connect_timeout: Duration,
    /// How long a session without leases is kept before it is closed.
    pub idle_timeout: Duration,
}

impl Default for PoolOpts {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Identifies a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("{agent_id}:{port}")]
pub struct CacheKey {
    pub agent_id: AgentId,
    pub port: u16,
}

type Session = Arc<DynOverlaySession<'static>>;
type DialOutcome = Result<Session, Arc<OverlayError>>;

struct Entry {
    id: u64,
    state: EntryState,
}

enum EntryState {
    Dialing(watch::Receiver<Option<DialOutcome>>),
    Live(LiveEntry),
}

struct LiveEntry {
    session: Session,
    leases: usize,
    idle: Option<AbortOnDropHandle<()>>,
    last_used: Instant,
}

impl Entry {
    fn close(self) {
        if let EntryState::Live(live) = self.state {
            live.session.close();
        }
    }
}

/// Cache of overlay sessions shared by all agent connections and proxies.
///
/// Cloning is cheap and yields a handle to the same cache.
#[derive(Clone)]
pub struct ConnectionCache {
    inner: Arc<CacheInner>,
}

impl fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCache")
            .field("entries", &self.inner.entries.len())
            .field("opts", &self.inner.opts)
            .finish_non_exhaustive()
    }
}

struct CacheInner {
    overlay: Arc<DynOverlay<'static>>,
    coordinator: Arc<DynCoordinator<'static>>,
    opts: PoolOpts,
    metrics: ServerMetrics,
    entries: DashMap<CacheKey, Entry>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    runtime: Handle,
}

impl ConnectionCache {
    /// Creates an empty cache.
    ///
    /// Must be called from within a tokio runtime. Idle timers run on that
    /// runtime, so leases may be dropped from any thread.
    pub fn new(
        overlay: Arc<DynOverlay<'static>>,
        coordinator: Arc<DynCoordinator<'static>>,
        opts: PoolOpts,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                overlay,
                coordinator,
                opts,
                metrics,
                entries: DashMap::new(),
                next_id: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                runtime: Handle::current(),
            }),
        }
    }

    /// Returns a lease on the session for `(agent_id, port)`, dialing if needed.
    ///
    /// Concurrent calls for the same key share one dial and observe the same
    /// outcome. Dropping the returned future only stops this caller; the dial
    /// keeps running for the others and populates the cache.
    pub async fn acquire(&self, agent_id: AgentId, port: u16) -> Result<AgentConn, ConnectError> {
        let key = CacheKey { agent_id, port };
        loop {
            if self.inner.shutdown.is_cancelled() {
                return Err(e!(ConnectError::Closed));
            }
            let (id, rx) = match self.inner.entries.entry(key) {
                MapEntry::Occupied(mut occupied) => {
                    let entry = occupied.get_mut();
                    let id = entry.id;
                    let waiting = match &mut entry.state {
                        EntryState::Live(live) if !live.session.is_closed() => {
                            live.leases += 1;
                            live.idle = None;
                            live.last_used = Instant::now();
                            trace!(%key, id, leases = live.leases, "cache hit");
                            return Ok(AgentConn::new(self.clone(), key, id, live.session.clone()));
                        }
                        EntryState::Live(_) => None,
                        EntryState::Dialing(rx) => Some(rx.clone()),
                    };
                    match waiting {
                        Some(rx) => (id, rx),
                        None => {
                            let (_, stale) = occupied.remove_entry();
                            debug!(%key, id, "evicting closed session");
                            stale.close();
                            continue;
                        }
                    }
                }
                MapEntry::Vacant(vacant) => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    vacant.insert(Entry {
                        id,
                        state: EntryState::Dialing(rx.clone()),
                    });
                    self.spawn_dial(key, id, tx);
                    (id, rx)
                }
            };

            let outcome = tokio::select! {
                outcome = wait_outcome(rx) => outcome,
                _ = self.inner.shutdown.cancelled() => return Err(e!(ConnectError::Closed)),
            };
            match outcome {
                // Loop around to take a lease on the live entry.
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(connect_error(key, &err)),
                None => {
                    // The dial task went away without an outcome.
                    self.inner.entries.remove_if(&key, |_, entry| {
                        entry.id == id && matches!(entry.state, EntryState::Dialing(_))
                    });
                }
            }
        }
    }

    fn spawn_dial(&self, key: CacheKey, id: u64, tx: watch::Sender<Option<DialOutcome>>) {
        let inner = self.inner.clone();
        let shutdown = self.inner.shutdown.clone();
        let span = error_span!("dial", agent=%key.agent_id.fmt_short(), port=key.port, id);
        self.inner.tasks.spawn(
            async move {
                let Some(outcome) = shutdown.run_until_cancelled(dial(&inner, key)).await else {
                    debug!("dial aborted at shutdown");
                    inner.entries.remove_if(&key, |_, entry| entry.id == id);
                    return;
                };
                let outcome = outcome.map_err(Arc::new);
                inner.metrics.record_dial(NETWORK_TCP, outcome.is_ok());
                match &outcome {
                    Ok(session) => {
                        let installed = match inner.entries.get_mut(&key) {
                            Some(mut entry) if entry.id == id => {
                                entry.state = EntryState::Live(LiveEntry {
                                    session: session.clone(),
                                    leases: 0,
                                    idle: Some(arm_idle_timer(&inner, key, id)),
                                    last_used: Instant::now(),
                                });
                                true
                            }
                            _ => false,
                        };
                        if installed {
                            debug!(remote=%session.remote(), "dial succeeded");
                        } else {
                            debug!("entry vanished while dialing, closing session");
                            session.close();
                        }
                    }
                    Err(err) => {
                        debug!("dial failed: {err:#}");
                        inner.entries.remove_if(&key, |_, entry| entry.id == id);
                    }
                }
                tx.send_replace(Some(outcome));
            }
            .instrument(span),
        );
    }

    /// Returns a lease to the entry it was issued for.
    fn release(&self, key: CacheKey, id: u64) {
        let Some(mut entry) = self.inner.entries.get_mut(&key) else {
            debug!(%key, id, "released lease of a removed entry");
            return;
        };
        if entry.id != id {
            debug!(%key, id, current = entry.id, "released lease of a replaced entry");
            return;
        }
        match &mut entry.state {
            EntryState::Live(live) => {
                if live.leases == 0 {
                    warn!(%key, id, "lease released more often than acquired");
                    return;
                }
                live.leases -= 1;
                live.last_used = Instant::now();
                trace!(%key, id, leases = live.leases, "lease released");
                if live.leases == 0 && !self.inner.shutdown.is_cancelled() {
                    live.idle = Some(arm_idle_timer(&self.inner, key, id));
                }
            }
            EntryState::Dialing(_) => {
                warn!(%key, id, "lease released on an entry that is still dialing");
            }
        }
    }

    /// Removes the entry `id` for `key` and closes its session, regardless of leases.
    fn evict(&self, key: CacheKey, id: u64) {
        let removed = self
            .inner
            .entries
            .remove_if(&key, |_, entry| entry.id == id);
        if let Some((_, entry)) = removed {
            debug!(%key, id, "evicted broken session");
            entry.close();
        }
    }

    /// Number of cached entries, dialing or live.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Outstanding leases on the live entry for `(agent_id, port)`.
    ///
    /// Returns `None` if there is no live entry.
    pub fn lease_count(&self, agent_id: AgentId, port: u16) -> Option<usize> {
        let entry = self.inner.entries.get(&CacheKey { agent_id, port })?;
        match &entry.state {
            EntryState::Live(live) => Some(live.leases),
            EntryState::Dialing(_) => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Closes every cached session and refuses further acquisitions.
    ///
    /// In-flight dials are aborted and their waiters fail with [`ConnectError::Closed`].
    pub async fn close(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        let mut closed = 0;
        self.inner.entries.retain(|_, entry| {
            if let EntryState::Live(live) = &entry.state {
                live.session.close();
                closed += 1;
            }
            false
        });
        self.inner.tasks.wait().await;
        debug!(closed, "connection cache closed");
    }

    pub(crate) fn overlay(&self) -> &Arc<DynOverlay<'static>> {
        &self.inner.overlay
    }
}

async fn wait_outcome(mut rx: watch::Receiver<Option<DialOutcome>>) -> Option<DialOutcome> {
    rx.wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|outcome| outcome.clone())
}

async fn dial(inner: &CacheInner, key: CacheKey) -> Result<Session, OverlayError> {
    let addr = TAILNET_SERVICE_PREFIX.addr_from_agent_id(key.agent_id);
    let timeout = inner.opts.connect_timeout;
    let dial = async {
        let node = inner
            .coordinator
            .node(key.agent_id)
            .await
            .ok_or_else(|| e!(OverlayError::UnknownPeer { addr }))?;
        inner.overlay.update_peer(PeerUpdate::Upsert(node));
        inner.overlay.dial(addr, key.port).await
    };
    match dial.timeout(timeout).await {
        Ok(res) => res,
        Err(_) => Err(e!(OverlayError::Timeout { addr, timeout })),
    }
}

fn arm_idle_timer(inner: &Arc<CacheInner>, key: CacheKey, id: u64) -> AbortOnDropHandle<()> {
    let idle_timeout = inner.opts.idle_timeout;
    let runtime = inner.runtime.clone();
    let inner = Arc::downgrade(inner);
    AbortOnDropHandle::new(runtime.spawn(async move {
        tokio::time::sleep(idle_timeout).await;
        expire(&inner, key, id);
    }))
}

fn expire(inner: &Weak<CacheInner>, key: CacheKey, id: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let removed = inner.entries.remove_if(&key, |_, entry| {
        entry.id == id && matches!(&entry.state, EntryState::Live(live) if live.leases == 0)
    });
    if let Some((_, entry)) = removed {
        if let EntryState::Live(live) = &entry.state {
            debug!(%key, id, idle=?live.last_used.elapsed(), "closing idle session");
        }
        entry.close();
    }
}

fn connect_error(key: CacheKey, err: &Arc<OverlayError>) -> ConnectError {
    let CacheKey { agent_id, port } = key;
    match err.as_ref() {
        OverlayError::UnknownPeer { .. } | OverlayError::Unreachable { .. } => {
            e!(ConnectError::AgentUnreachable {
                agent_id,
                source: anyerr!(err.clone())
            })
        }
        OverlayError::Timeout { .. } => e!(ConnectError::DialFailure {
            agent_id,
            port,
            timed_out: true,
            source: anyerr!(err.clone())
        }),
        OverlayError::Closed { .. } => e!(ConnectError::Closed),
        _ => e!(ConnectError::DialFailure {
            agent_id,
            port,
            timed_out: false,
            source: anyerr!(err.clone())
        }),
    }
}

/// A lease on a cached overlay session to one agent port.
///
/// The session stays open while any lease on it is outstanding. The lease is
/// returned by [`AgentConn::release`] or when the value is dropped.
#[derive(derive_more::Debug)]
pub struct AgentConn {
    cache: ConnectionCache,
    key: CacheKey,
    id: u64,
    #[debug("Arc<dyn OverlaySession>")]
    session: Session,
}

impl AgentConn {
    fn new(cache: ConnectionCache, key: CacheKey, id: u64, session: Session) -> Self {
        Self {
            cache,
            key,
            id,
            session,
        }
    }

    pub fn agent_id(&self) -> AgentId {
        self.key.agent_id
    }

    pub fn port(&self) -> u16 {
        self.key.port
    }

    /// Virtual address and port of the agent.
    pub fn remote(&self) -> SocketAddrV6 {
        self.session.remote()
    }

    /// The underlying session. Leases on the same entry share it.
    pub fn session(&self) -> &Arc<DynOverlaySession<'static>> {
        &self.session
    }

    /// Opens a new byte stream to the agent port.
    ///
    /// If the session fails to open a stream it is evicted from the cache and
    /// [`ConnectError::StaleConnection`] is returned; the next acquisition redials.
    pub async fn open_stream(&self) -> Result<OverlayStream, ConnectError> {
        match self.session.open_stream().await {
            Ok(stream) => Ok(stream),
            Err(source) => {
                warn!(key=%self.key, "failed to open stream: {source:#}");
                self.cache.evict(self.key, self.id);
                Err(e!(ConnectError::StaleConnection {
                    agent_id: self.key.agent_id,
                    port: self.key.port,
                    source
                }))
            }
        }
    }

    /// Waits until the agent is reachable over the overlay.
    ///
    /// Bound the wait with a timeout.
    pub async fn await_reachable(&self) -> bool {
        let addr = *self.session.remote().ip();
        self.cache.overlay().await_reachable(addr).await
    }

    /// Evicts the session from the cache and closes it, regardless of other leases.
    pub fn mark_broken(&self) {
        self.cache.evict(self.key, self.id);
    }

    /// Whether the session can still be used.
    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Returns the lease to the cache.
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for AgentConn {
    fn drop(&mut self) {
        self.cache.release(self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use n0_error::{Result, StdResultExt};
    use n0_future::task::AbortOnDropHandle;
    use n0_tracing_test::traced_test;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::{
        InMemoryCoordinator,
        overlay::{
            BindOverlay, OverlayConfig,
            memory::{AgentPaths, MemoryAgent, MemoryListener, MemoryNet},
        },
    };

    const PORT: u16 = 4444;

    struct Harness {
        net: MemoryNet,
        coordinator: InMemoryCoordinator,
        cache: ConnectionCache,
        metrics: ServerMetrics,
    }

    async fn harness(opts: PoolOpts) -> Result<Harness> {
        let net = MemoryNet::new();
        let coordinator = InMemoryCoordinator::new();
        let overlay = net.binder().bind(OverlayConfig::default()).await?;
        let metrics = ServerMetrics::new()?;
        let cache = ConnectionCache::new(
            overlay,
            DynCoordinator::new_arc(coordinator.clone()),
            opts,
            metrics.clone(),
        );
        Ok(Harness {
            net,
            coordinator,
            cache,
            metrics,
        })
    }

    impl Harness {
        fn spawn_agent(&self) -> (MemoryAgent, MemoryListener) {
            let agent = self
                .net
                .add_agent(AgentId::new_random(), AgentPaths::direct_only());
            let listener = agent.listen(PORT);
            self.coordinator.upsert_node(agent.node());
            (agent, listener)
        }
    }

    /// Echoes one line per accepted stream, prefixed with `label`.
    fn spawn_echo(mut listener: MemoryListener, label: &'static str) -> AbortOnDropHandle<()> {
        AbortOnDropHandle::new(tokio::spawn(async move {
            while let Some(mut stream) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    let Ok(n) = stream.read(&mut buf).await else {
                        return;
                    };
                    let mut reply = label.as_bytes().to_vec();
                    reply.extend_from_slice(&buf[..n]);
                    stream.write_all(&reply).await.ok();
                    stream.shutdown().await.ok();
                });
            }
        }))
    }

    #[tokio::test]
    #[traced_test]
    async fn concurrent_acquires_share_one_dial() -> Result {
        let h = harness(PoolOpts::default()).await?;
        let (agent, _listener) = h.spawn_agent();
        h.net.set_dial_delay(Duration::from_millis(100));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = h.cache.clone();
                let agent_id = agent.agent_id();
                tokio::spawn(async move { cache.acquire(agent_id, PORT).await })
            })
            .collect();
        let mut leases = Vec::new();
        for task in tasks {
            leases.push(task.await.anyerr()??);
        }
        assert_eq!(h.net.stats().dials, 1);
        assert_eq!(h.metrics.dials_total(NETWORK_TCP, "ok"), 1);
        for lease in &leases[1..] {
            assert!(Arc::ptr_eq(lease.session(), leases[0].session()));
        }
        assert_eq!(h.cache.lease_count(agent.agent_id(), PORT), Some(16));
        drop(leases);
        assert_eq!(h.cache.lease_count(agent.agent_id(), PORT), Some(0));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn concurrent_acquires_share_one_failure() -> Result {
        let h = harness(PoolOpts::default()).await?;
        // Known to the coordinator, but gone from the network.
        let (agent, _listener) = h.spawn_agent();
        let agent_id = agent.agent_id();
        drop(agent);
        h.net.set_dial_delay(Duration::from_millis(50));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = h.cache.clone();
                tokio::spawn(async move { cache.acquire(agent_id, PORT).await })
            })
            .collect();
        for task in tasks {
            let err = task.await.anyerr()?.unwrap_err();
            assert!(matches!(
                err,
                ConnectError::DialFailure {
                    timed_out: false,
                    ..
                }
            ));
            assert_eq!(err.response_status(), http::StatusCode::BAD_GATEWAY);
        }
        assert_eq!(h.metrics.dials_total(NETWORK_TCP, "error"), 1);
        assert!(h.cache.is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn agents_are_isolated() -> Result {
        let h = harness(PoolOpts::default()).await?;
        let (a, listener_a) = h.spawn_agent();
        let (b, listener_b) = h.spawn_agent();
        let _echo_a = spawn_echo(listener_a, "a:");
        let _echo_b = spawn_echo(listener_b, "b:");

        for _ in 0..3 {
            for (agent, label) in [(&a, "a:"), (&b, "b:")] {
                let lease = h.cache.acquire(agent.agent_id(), PORT).await?;
                assert_eq!(lease.remote().ip(), &agent.addr());
                let mut stream = lease.open_stream().await?;
                stream.write_all(b"hi").await?;
                let mut reply = String::new();
                stream.read_to_string(&mut reply).await?;
                assert_eq!(reply, format!("{label}hi"));
            }
        }
        assert_eq!(h.net.stats().dials, 2);
        assert_eq!(h.cache.len(), 2);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn closed_session_is_redialed() -> Result {
        let h = harness(PoolOpts::default()).await?;
        let (agent, listener) = h.spawn_agent();
        let agent_id = agent.agent_id();
        let lease = h.cache.acquire(agent_id, PORT).await?;
        let first = lease.session().clone();
        lease.release();

        // The agent reconnects; the old session reports closed.
        drop(listener);
        drop(agent);
        let agent = h.net.add_agent(agent_id, AgentPaths::direct_only());
        let _listener = agent.listen(PORT);
        h.coordinator.upsert_node(agent.node());
        assert!(first.is_closed());

        let lease = h.cache.acquire(agent_id, PORT).await?;
        assert!(!Arc::ptr_eq(lease.session(), &first));
        assert!(!lease.is_closed());
        assert_eq!(h.net.stats().dials, 2);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn broken_stream_evicts() -> Result {
        let h = harness(PoolOpts::default()).await?;
        let (agent, listener) = h.spawn_agent();
        let lease = h.cache.acquire(agent.agent_id(), PORT).await?;
        let other = h.cache.acquire(agent.agent_id(), PORT).await?;
        drop(listener);

        let err = lease.open_stream().await.unwrap_err();
        assert!(matches!(err, ConnectError::StaleConnection { .. }));
        assert!(h.cache.is_empty());
        assert!(other.is_closed());

        // Releasing leases of the evicted entry leaves a fresh entry alone.
        let _listener = agent.listen(PORT);
        let fresh = h.cache.acquire(agent.agent_id(), PORT).await?;
        drop(lease);
        drop(other);
        assert_eq!(h.cache.lease_count(agent.agent_id(), PORT), Some(1));
        assert!(!fresh.is_closed());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn mark_broken_evicts_despite_leases() -> Result {
        let h = harness(PoolOpts::default()).await?;
        let (agent, _listener) = h.spawn_agent();
        let first = h.cache.acquire(agent.agent_id(), PORT).await?;
        let second = h.cache.acquire(agent.agent_id(), PORT).await?;
        first.mark_broken();
        assert!(second.is_closed());
        assert!(h.cache.is_empty());
        let third = h.cache.acquire(agent.agent_id(), PORT).await?;
        assert!(!third.is_closed());
        assert_eq!(h.net.stats().dials, 2);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn lease_released_off_runtime_arms_idle_timer() -> Result {
        let opts = PoolOpts {
            idle_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let h = harness(opts).await?;
        let (agent, _listener) = h.spawn_agent();

        let lease = h.cache.acquire(agent.agent_id(), PORT).await?;
        std::thread::spawn(move || drop(lease))
            .join()
            .map_err(|_| anyerr!("lease drop panicked"))?;
        assert_eq!(h.cache.lease_count(agent.agent_id(), PORT), Some(0));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(h.cache.is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn idle_entry_is_torn_down() -> Result {
        let opts = PoolOpts {
            idle_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let h = harness(opts).await?;
        let (agent, _listener) = h.spawn_agent();

        let lease = h.cache.acquire(agent.agent_id(), PORT).await?;
        let session = lease.session().clone();
        // Outstanding leases keep the entry alive past the idle window.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.cache.len(), 1);
        lease.release();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(h.cache.is_empty());
        assert!(session.is_closed());

        let _lease = h.cache.acquire(agent.agent_id(), PORT).await?;
        assert_eq!(h.net.stats().dials, 2);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn reacquire_disarms_idle_timer() -> Result {
        let opts = PoolOpts {
            idle_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let h = harness(opts).await?;
        let (agent, _listener) = h.spawn_agent();

        h.cache.acquire(agent.agent_id(), PORT).await?.release();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let lease = h.cache.acquire(agent.agent_id(), PORT).await?;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!lease.is_closed());
        assert_eq!(h.net.stats().dials, 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn cancelled_waiter_does_not_abort_dial() -> Result {
        let h = harness(PoolOpts::default()).await?;
        let (agent, _listener) = h.spawn_agent();
        h.net.set_dial_delay(Duration::from_millis(200));
        let agent_id = agent.agent_id();

        let finished = Arc::new(AtomicUsize::new(0));
        let first = {
            let cache = h.cache.clone();
            tokio::spawn(async move { cache.acquire(agent_id, PORT).await })
        };
        let second = {
            let cache = h.cache.clone();
            let finished = finished.clone();
            tokio::spawn(async move {
                let res = cache.acquire(agent_id, PORT).await;
                finished.fetch_add(1, Ordering::Relaxed);
                res
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        let lease = second.await.anyerr()??;
        assert_eq!(finished.load(Ordering::Relaxed), 1);
        assert_eq!(lease.agent_id(), agent_id);
        assert_eq!(h.net.stats().dials, 1);

        // A timed out waiter behaves the same.
        let res =
            tokio::time::timeout(Duration::from_millis(10), h.cache.acquire(agent_id, PORT + 1))
                .await;
        assert!(res.is_err());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn dial_timeout_leaves_no_entry() -> Result {
        let opts = PoolOpts {
            connect_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let h = harness(opts).await?;
        let (agent, _listener) = h.spawn_agent();
        h.net.set_dial_delay(Duration::from_secs(5));

        let err = h.cache.acquire(agent.agent_id(), PORT).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectError::DialFailure {
                timed_out: true,
                ..
            }
        ));
        assert_eq!(err.response_status(), http::StatusCode::GATEWAY_TIMEOUT);
        assert!(h.cache.is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn close_refuses_acquisitions() -> Result {
        let h = harness(PoolOpts::default()).await?;
        let (agent, _listener) = h.spawn_agent();
        let lease = h.cache.acquire(agent.agent_id(), PORT).await?;

        h.cache.close().await;
        h.cache.close().await;
        assert!(lease.is_closed());
        assert!(h.cache.is_empty());
        let err = h.cache.acquire(agent.agent_id(), PORT).await.unwrap_err();
        assert!(matches!(err, ConnectError::Closed { .. }));
        drop(lease);
        assert!(h.cache.is_empty());
        Ok(())
    }
}
