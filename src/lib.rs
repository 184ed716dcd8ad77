//! Server-side multiplexer of connections to remote agents over an overlay network.
//!
//! A [`ServerTailnet`] brings up one overlay identity through a
//! [`TailnetDialer`], caches one overlay session per agent port and exposes
//! them as raw leased connections ([`ServerTailnet::agent_conn`]) or as HTTP
//! reverse proxies ([`ServerTailnet::reverse_proxy`]).

mod addr;
pub mod cache;
mod coordinator;
pub mod dialer;
pub mod error;
pub mod metrics;
pub mod overlay;
pub mod proxy;
mod relay;
mod tailnet;


pub use {
    addr::{AGENT_HTTP_API_PORT, AgentId, ServicePrefix, TAILNET_SERVICE_PREFIX},
    cache::{AgentConn, PoolOpts},
    coordinator::{Coordinator, DynCoordinator, InMemoryCoordinator, PeerNode, PeerUpdate},
    dialer::{HealthCheck, OverlayIdentity, TailnetDialer},
    error::{ConnectError, DialError, OverlayError},
    metrics::ServerMetrics,
    proxy::{AppContext, ErrorResponder, ReverseProxy},
    relay::{RelayMap, RelayMapProvider, RelayRegion},
    tailnet::{ServerTailnet, ServerTailnetOpts},
};
