use std::{net::Ipv6Addr, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Port of the agent's HTTP API server, used by [`ServerTailnet::agent_conn`].
///
/// [`ServerTailnet::agent_conn`]: crate::ServerTailnet::agent_conn
pub const AGENT_HTTP_API_PORT: u16 = 4;

/// Reserved prefix that all agent virtual addresses live in: `fd7a:115c:a1e0::/48`.
pub const TAILNET_SERVICE_PREFIX: ServicePrefix =
    ServicePrefix::new([0xfd, 0x7a, 0x11, 0x5c, 0xa1, 0xe0]);

/// Globally unique identity of a remote agent.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct AgentId(Uuid);

impl AgentId {
    /// Creates a new random (v4) agent identity.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Returns a short string representation for logging.
    pub fn fmt_short(&self) -> String {
        let mut s = self.0.simple().to_string();
        s.truncate(8);
        s
    }
}

impl From<Uuid> for AgentId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for AgentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s).map(Self)
    }
}

/// A /48 IPv6 prefix that agent identities are mapped into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServicePrefix([u8; 6]);

impl ServicePrefix {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Derives the virtual address of an agent.
    ///
    /// The address is the 16 identity bytes with the leading 48 bits replaced by
    /// the prefix. No lookup is involved, so this is total and deterministic.
    pub fn addr_from_agent_id(&self, agent_id: AgentId) -> Ipv6Addr {
        let mut bytes = *agent_id.as_bytes();
        bytes[..6].copy_from_slice(&self.0);
        Ipv6Addr::from(bytes)
    }

    /// Returns true if `addr` is inside this prefix.
    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        addr.octets()[..6] == self.0
    }
}

impl Default for ServicePrefix {
    fn default() -> Self {
        TAILNET_SERVICE_PREFIX
    }
}
