use std::{future::Future, sync::Arc, time::Duration};

use dynosaur::dynosaur;
use n0_error::{AnyError, anyerr, e};
use tokio_util::time::FutureExt;
use tracing::{debug, info, warn};

use crate::{
    AgentId, DynCoordinator,
    coordinator::Coordinator,
    error::DialError,
    overlay::{BindOverlay, DynBindOverlay, DynOverlay, OverlayConfig},
    relay::{RelayMap, RelayMapProvider},
};

/// Default bound on the backing-store health probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[dynosaur(pub DynHealthCheck = dyn(box) HealthCheck)]
/// Liveness probe of the backing store the coordinator depends on.
pub trait HealthCheck: Send + Sync {
    /// Pings the backing store and returns the round-trip latency.
    fn ping(&self) -> impl Future<Output = Result<Duration, AnyError>> + Send;
}

/// Brings up the server's overlay identity.
///
/// Dialing probes the backing store first, so that an unreachable database
/// fails fast instead of registering an identity nobody can look up.
#[derive(derive_more::Debug)]
pub struct TailnetDialer {
    client_id: AgentId,
    #[debug("Arc<dyn Coordinator>")]
    coordinator: Arc<DynCoordinator<'static>>,
    #[debug("Arc<dyn BindOverlay>")]
    bind: Arc<DynBindOverlay<'static>>,
    #[debug(skip)]
    health_check: Option<Arc<DynHealthCheck<'static>>>,
    #[debug("Arc<dyn RelayMapProvider>")]
    relay_map: Arc<dyn RelayMapProvider>,
    block_endpoints: bool,
    probe_timeout: Duration,
}

impl TailnetDialer {
    /// Creates a dialer that registers `client_id` with `coordinator` and binds
    /// the identity through `bind`.
    ///
    /// Without further configuration no health probe runs and no relays are used.
    pub fn new(
        coordinator: impl Coordinator + 'static,
        bind: impl BindOverlay + 'static,
        client_id: AgentId,
    ) -> Self {
        Self {
            client_id,
            coordinator: DynCoordinator::new_arc(coordinator),
            bind: DynBindOverlay::new_arc(bind),
            health_check: None,
            relay_map: Arc::new(RelayMap::default()),
            block_endpoints: false,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Probes `health_check` before every dial.
    pub fn health_check(mut self, health_check: impl HealthCheck + 'static) -> Self {
        self.health_check = Some(DynHealthCheck::new_arc(health_check));
        self
    }

    /// Sets the source of the relay map.
    pub fn relay_map(mut self, provider: impl RelayMapProvider) -> Self {
        self.relay_map = Arc::new(provider);
        self
    }

    /// Forces every overlay path through relays.
    pub fn block_endpoints(mut self, block: bool) -> Self {
        self.block_endpoints = block;
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn client_id(&self) -> AgentId {
        self.client_id
    }

    /// Probes the backing store, registers the client identity and binds the overlay.
    ///
    /// A failed or timed out probe returns [`DialError::BackingStoreUnreachable`]
    /// before the coordinator is contacted. Nothing is retried.
    pub async fn dial(&self) -> Result<OverlayIdentity, DialError> {
        let client_id = self.client_id;
        if let Some(health_check) = &self.health_check {
            match health_check.ping().timeout(self.probe_timeout).await {
                Ok(Ok(latency)) => debug!(?latency, "backing store is healthy"),
                Ok(Err(source)) => {
                    warn!("backing store probe failed: {source:#}");
                    return Err(e!(DialError::BackingStoreUnreachable { source }));
                }
                Err(_) => {
                    warn!(timeout=?self.probe_timeout, "backing store probe timed out");
                    return Err(e!(DialError::BackingStoreUnreachable {
                        source: anyerr!("probe timed out after {:?}", self.probe_timeout)
                    }));
                }
            }
        }

        let relay_map = self.relay_map.current();

        self.coordinator
            .register(client_id)
            .await
            .map_err(|source| e!(DialError::Register { client_id, source }))?;

        let config = OverlayConfig {
            relay_map: relay_map.clone(),
            block_endpoints: self.block_endpoints,
        };
        let overlay = match self.bind.bind(config).await {
            Ok(overlay) => overlay,
            Err(source) => {
                self.coordinator.deregister(client_id).await;
                return Err(e!(DialError::Bind { source }));
            }
        };

        info!(
            client_id=%client_id.fmt_short(),
            relays = relay_map.regions.len(),
            block_endpoints = self.block_endpoints,
            "overlay identity is up"
        );
        Ok(OverlayIdentity {
            client_id,
            overlay,
            coordinator: self.coordinator.clone(),
            relay_map,
            block_endpoints: self.block_endpoints,
        })
    }
}

/// The server's bound overlay identity, as produced by [`TailnetDialer::dial`].
#[derive(derive_more::Debug, Clone)]
pub struct OverlayIdentity {
    pub client_id: AgentId,
    #[debug("Arc<dyn Overlay>")]
    pub overlay: Arc<DynOverlay<'static>>,
    #[debug("Arc<dyn Coordinator>")]
    pub coordinator: Arc<DynCoordinator<'static>>,
    pub relay_map: RelayMap,
    pub block_endpoints: bool,
}

#[cfg(test)]
mod tests {
    use n0_error::Result;
    use n0_tracing_test::traced_test;

    use super::*;
    use crate::{
        InMemoryCoordinator,
        overlay::{
            Overlay,
            memory::{AgentPaths, MemoryNet},
        },
    };

    struct FailingProbe;

    impl HealthCheck for FailingProbe {
        async fn ping(&self) -> Result<Duration, AnyError> {
            Err(anyerr!("database is down"))
        }
    }

    struct SlowProbe;

    impl HealthCheck for SlowProbe {
        async fn ping(&self) -> Result<Duration, AnyError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Duration::from_secs(60))
        }
    }

    struct HealthyProbe;

    impl HealthCheck for HealthyProbe {
        async fn ping(&self) -> Result<Duration, AnyError> {
            Ok(Duration::from_millis(1))
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_probe_skips_registration_and_bind() -> Result {
        let net = MemoryNet::new();
        let coordinator = InMemoryCoordinator::new();
        let client_id = AgentId::new_random();
        let dialer = TailnetDialer::new(coordinator.clone(), net.binder(), client_id)
            .health_check(FailingProbe);

        let err = dialer.dial().await.unwrap_err();
        assert!(matches!(err, DialError::BackingStoreUnreachable { .. }));
        assert_eq!(coordinator.registrations(), 0);
        assert!(!coordinator.is_registered(client_id));
        assert_eq!(net.stats().binds, 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn probe_timeout_is_unreachable() -> Result {
        let net = MemoryNet::new();
        let coordinator = InMemoryCoordinator::new();
        let dialer = TailnetDialer::new(coordinator.clone(), net.binder(), AgentId::new_random())
            .health_check(SlowProbe)
            .probe_timeout(Duration::from_millis(100));

        let err = dialer.dial().await.unwrap_err();
        assert!(matches!(err, DialError::BackingStoreUnreachable { .. }));
        assert_eq!(coordinator.registrations(), 0);
        assert_eq!(net.stats().binds, 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn healthy_dial_registers_and_binds() -> Result {
        let net = MemoryNet::new();
        let coordinator = InMemoryCoordinator::new();
        let client_id = AgentId::new_random();
        let relay: iroh::RelayUrl = "https://relay.dialer.test./".parse()?;
        let dialer = TailnetDialer::new(coordinator.clone(), net.binder(), client_id)
            .health_check(HealthyProbe)
            .relay_map(move || RelayMap::from_urls([relay.clone()]))
            .block_endpoints(true);

        let identity = dialer.dial().await?;
        assert_eq!(identity.client_id, client_id);
        assert_eq!(identity.relay_map.regions.len(), 1);
        assert!(identity.overlay.block_endpoints());
        assert!(coordinator.is_registered(client_id));
        assert_eq!(net.stats().binds, 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn register_failure() -> Result {
        let net = MemoryNet::new();
        let coordinator = InMemoryCoordinator::new();
        let agent = net.add_agent(AgentId::new_random(), AgentPaths::direct_only());
        coordinator.upsert_node(agent.node());
        // Reusing an agent's identity as the client identity is rejected.
        let dialer = TailnetDialer::new(coordinator.clone(), net.binder(), agent.agent_id());

        let err = dialer.dial().await.unwrap_err();
        assert!(matches!(err, DialError::Register { .. }));
        assert_eq!(net.stats().binds, 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn bind_failure_deregisters() -> Result {
        let net = MemoryNet::new();
        net.set_fail_binds(true);
        let coordinator = InMemoryCoordinator::new();
        let client_id = AgentId::new_random();
        let dialer = TailnetDialer::new(coordinator.clone(), net.binder(), client_id);

        let err = dialer.dial().await.unwrap_err();
        assert!(matches!(err, DialError::Bind { .. }));
        assert!(!coordinator.is_registered(client_id));
        Ok(())
    }
}
