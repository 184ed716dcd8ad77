use std::{io, net::Ipv6Addr, time::Duration};

use http::{StatusCode, Uri};
use n0_error::{AnyError, stack_error};

use crate::AgentId;

/// Errors that can occur while bringing up the server's overlay identity.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum DialError {
    /// The backing store failed its health probe, so nothing was registered.
    #[error("backing store is not reachable")]
    BackingStoreUnreachable {
        #[error(source)]
        source: AnyError,
    },

    /// The coordinator rejected or failed the identity registration.
    #[error("failed to register client {client_id} with the coordinator")]
    Register {
        /// The identity we tried to register
        client_id: AgentId,
        #[error(source)]
        source: AnyError,
    },

    /// The overlay endpoint could not be bound.
    #[error("failed to bind the overlay identity")]
    Bind {
        #[error(source)]
        source: AnyError,
    },

    /// Metrics or TLS state of the multiplexer could not be set up.
    #[error("failed to set up the multiplexer")]
    Setup {
        #[error(source)]
        source: AnyError,
    },
}

/// Errors reported by an overlay implementation when dialing a virtual address.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum OverlayError {
    /// No peer metadata is known for the address.
    #[error("no peer known for {addr}")]
    UnknownPeer { addr: Ipv6Addr },

    /// The peer is known, but no direct or relayed path to it is usable.
    #[error("no usable path to {addr}")]
    Unreachable { addr: Ipv6Addr },

    /// The dial did not complete in time.
    #[error("dial to {addr} timed out after {timeout:?}")]
    Timeout { addr: Ipv6Addr, timeout: Duration },

    /// The transport failed to establish a session.
    #[error("failed to dial {addr}")]
    Dial {
        addr: Ipv6Addr,
        #[error(source)]
        source: AnyError,
    },

    /// The overlay identity was shut down.
    #[error("overlay is closed")]
    Closed,
}

/// Errors returned when acquiring or using a cached agent connection.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ConnectError {
    /// The overlay dial to the agent failed (refused, relay failure, timeout).
    #[error("failed to dial agent {agent_id} on port {port}")]
    DialFailure {
        agent_id: AgentId,
        port: u16,
        /// Whether the dial ran into the connect timeout
        timed_out: bool,
        #[error(source)]
        source: AnyError,
    },

    /// The agent's address is valid, but the agent cannot be reached.
    #[error("agent {agent_id} is not reachable")]
    AgentUnreachable {
        agent_id: AgentId,
        #[error(source)]
        source: AnyError,
    },

    /// A previously healthy cached connection failed during use and was evicted.
    #[error("connection to agent {agent_id} on port {port} is broken")]
    StaleConnection {
        agent_id: AgentId,
        port: u16,
        #[error(source, std_err)]
        source: io::Error,
    },

    /// The request target does not belong to the agent the transport is bound to.
    #[error("{uri} does not address agent {agent_id}")]
    Misdirected { agent_id: AgentId, uri: Uri },

    /// The multiplexer has been closed.
    #[error("connection cache is closed")]
    Closed,
}

impl ConnectError {
    /// Returns the gateway status code to surface to an HTTP client.
    pub fn response_status(&self) -> StatusCode {
        match self {
            ConnectError::DialFailure {
                timed_out: true, ..
            } => StatusCode::GATEWAY_TIMEOUT,
            ConnectError::Closed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ConnectError::Misdirected { .. } => StatusCode::MISDIRECTED_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}
