//! Relay routing configuration.
//!
//! A [`RelayMap`] lists the relay servers the overlay identity may route through
//! when a direct path to a peer is unavailable or forbidden.

use iroh::{RelayConfig, RelayMode, RelayUrl};
use serde::{Deserialize, Serialize};

/// The set of relay regions available to the overlay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMap {
    #[serde(default)]
    pub regions: Vec<RelayRegion>,
}

/// A single relay region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRegion {
    pub region_id: u16,
    #[serde(default)]
    pub region_code: String,
    /// Relay server URL.
    pub url: RelayUrl,
    /// STUN port advertised by the region, if any.
    #[serde(default)]
    pub stun_port: Option<u16>,
}

impl RelayMap {
    /// Creates a relay map with one region per URL.
    pub fn from_urls(urls: impl IntoIterator<Item = RelayUrl>) -> Self {
        let regions = urls
            .into_iter()
            .zip(1u16..)
            .map(|(url, region_id)| RelayRegion {
                region_id,
                region_code: String::new(),
                url,
                stun_port: None,
            })
            .collect();
        Self { regions }
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn urls(&self) -> impl Iterator<Item = &RelayUrl> + '_ {
        self.regions.iter().map(|region| &region.url)
    }

    pub fn contains(&self, url: &RelayUrl) -> bool {
        self.urls().any(|candidate| candidate == url)
    }

    /// Returns true if any region offers STUN.
    pub fn has_stun(&self) -> bool {
        self.regions.iter().any(|region| region.stun_port.is_some())
    }

    /// Converts the map into the relay mode of an iroh endpoint.
    pub fn to_relay_mode(&self) -> RelayMode {
        if self.is_empty() {
            return RelayMode::Disabled;
        }
        let configs = self.urls().map(|url| RelayConfig {
            url: url.clone(),
            quic: None,
        });
        RelayMode::Custom(iroh::RelayMap::from_iter(configs))
    }
}

/// Supplies the current relay map.
///
/// Implemented for [`RelayMap`] itself (a static map) and for closures.
pub trait RelayMapProvider: Send + Sync + 'static {
    fn current(&self) -> RelayMap;
}

impl RelayMapProvider for RelayMap {
    fn current(&self) -> RelayMap {
        self.clone()
    }
}

impl<F> RelayMapProvider for F
where
    F: Fn() -> RelayMap + Send + Sync + 'static,
{
    fn current(&self) -> RelayMap {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_relay_map() {
        let json = r#"{
            "regions": [
                { "region_id": 1, "region_code": "eu", "url": "https://relay-eu.example.com./", "stun_port": 3478 },
                { "region_id": 2, "url": "https://relay-us.example.com./" }
            ]
        }"#;
        let map: RelayMap = serde_json::from_str(json).unwrap();
        assert_eq!(map.regions.len(), 2);
        assert_eq!(map.regions[0].region_code, "eu");
        assert!(map.has_stun());
        let us: RelayUrl = "https://relay-us.example.com./".parse().unwrap();
        assert!(map.contains(&us));
        assert!(matches!(map.to_relay_mode(), RelayMode::Custom(_)));
    }

    #[test]
    fn empty_map_disables_relays() {
        let map = RelayMap::default();
        assert!(!map.has_stun());
        assert!(matches!(map.to_relay_mode(), RelayMode::Disabled));
    }

    #[test]
    fn closure_provider() {
        let url: RelayUrl = "https://relay.example.com./".parse().unwrap();
        let provider = move || RelayMap::from_urls([url.clone()]);
        let map = provider.current();
        assert_eq!(map.regions[0].region_id, 1);
    }
}
