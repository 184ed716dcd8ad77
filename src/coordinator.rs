use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use dashmap::DashMap;
use dynosaur::dynosaur;
use iroh::EndpointAddr;
use n0_error::{AnyError, ensure_any};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::AgentId;

/// Capacity of the peer update channel handed out by [`InMemoryCoordinator`].
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Connectivity metadata for one agent, as tracked by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNode {
    pub agent_id: AgentId,
    /// Overlay endpoint of the agent: endpoint id, home relay and direct addresses.
    pub addr: EndpointAddr,
}

/// Change notification pushed by the coordinator.
#[derive(Debug, Clone)]
pub enum PeerUpdate {
    /// The agent connected or changed its connectivity metadata.
    Upsert(PeerNode),
    /// The agent disconnected.
    Remove(AgentId),
}

#[dynosaur(pub DynCoordinator = dyn(box) Coordinator)]
/// Registry of overlay participants.
///
/// The coordinator tracks which agents exist and how to reach them. The server
/// registers its own identity once, looks up agents on demand and receives
/// push notifications when agents connect or disconnect.
pub trait Coordinator: Send + Sync {
    /// Registers the server's client identity.
    fn register(&self, client_id: AgentId) -> impl Future<Output = Result<(), AnyError>> + Send;

    /// Removes a previously registered client identity.
    fn deregister(&self, client_id: AgentId) -> impl Future<Output = ()> + Send;

    /// Looks up the current metadata of an agent.
    fn node(&self, agent_id: AgentId) -> impl Future<Output = Option<PeerNode>> + Send;

    /// Subscribes to peer connect/disconnect notifications.
    fn subscribe(&self) -> broadcast::Receiver<PeerUpdate>;
}

/// Coordinator that keeps all state in process memory.
#[derive(Debug, Clone)]
pub struct InMemoryCoordinator {
    inner: Arc<CoordinatorInner>,
}

#[derive(Debug)]
struct CoordinatorInner {
    nodes: DashMap<AgentId, PeerNode>,
    clients: DashMap<AgentId, ()>,
    updates: broadcast::Sender<PeerUpdate>,
    registrations: AtomicUsize,
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(CoordinatorInner {
                nodes: DashMap::new(),
                clients: DashMap::new(),
                updates,
                registrations: AtomicUsize::new(0),
            }),
        }
    }

    /// Records that an agent connected (or updated its metadata) and notifies subscribers.
    pub fn upsert_node(&self, node: PeerNode) {
        debug!(agent_id=%node.agent_id.fmt_short(), "agent node updated");
        self.inner.nodes.insert(node.agent_id, node.clone());
        // No subscribers is fine.
        self.inner.updates.send(PeerUpdate::Upsert(node)).ok();
    }

    /// Records that an agent disconnected and notifies subscribers.
    pub fn remove_node(&self, agent_id: AgentId) {
        if self.inner.nodes.remove(&agent_id).is_some() {
            debug!(agent_id=%agent_id.fmt_short(), "agent node removed");
            self.inner.updates.send(PeerUpdate::Remove(agent_id)).ok();
        }
    }

    /// Returns the metadata of an agent without going through the async trait.
    pub fn get(&self, agent_id: AgentId) -> Option<PeerNode> {
        self.inner.nodes.get(&agent_id).map(|node| node.clone())
    }

    pub fn is_registered(&self, client_id: AgentId) -> bool {
        self.inner.clients.contains_key(&client_id)
    }

    /// Number of successful client registrations so far.
    pub fn registrations(&self) -> usize {
        self.inner.registrations.load(Ordering::Relaxed)
    }
}

impl Coordinator for InMemoryCoordinator {
    async fn register(&self, client_id: AgentId) -> Result<(), AnyError> {
        ensure_any!(
            !self.inner.nodes.contains_key(&client_id),
            "client id {client_id} collides with an agent"
        );
        self.inner.clients.insert(client_id, ());
        self.inner.registrations.fetch_add(1, Ordering::Relaxed);
        debug!(client_id=%client_id.fmt_short(), "client registered");
        Ok(())
    }

    async fn deregister(&self, client_id: AgentId) {
        if self.inner.clients.remove(&client_id).is_some() {
            debug!(client_id=%client_id.fmt_short(), "client deregistered");
        }
    }

    async fn node(&self, agent_id: AgentId) -> Option<PeerNode> {
        self.get(agent_id)
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerUpdate> {
        self.inner.updates.subscribe()
    }
}
