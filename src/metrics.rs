//! Prometheus instrumentation of the multiplexer.
//!
//! [`ServerMetrics`] is a [`Collector`]; it is not registered anywhere by
//! default. Register a clone with the registry the embedder scrapes:
//!
//! ```ignore
//! registry.register(Box::new(tailnet.metrics().clone()))?;
//! ```

use n0_error::{Result, StdResultExt};
use prometheus::{
    IntCounterVec, IntGaugeVec, Opts,
    core::{Collector, Desc},
    proto::MetricFamily,
};

/// Label value for connections carried as byte streams over the overlay.
pub const NETWORK_TCP: &str = "tcp";

/// Counters and gauges observing transport connections and overlay dials.
#[derive(Debug, Clone)]
pub struct ServerMetrics {
    connections_total: IntCounterVec,
    open_connections: IntGaugeVec,
    dials_total: IntCounterVec,
}

impl ServerMetrics {
    pub fn new() -> Result<Self> {
        let connections_total = IntCounterVec::new(
            Opts::new(
                "servertailnet_connections_total",
                "Total transport connections opened to agents",
            ),
            &["network"],
        )
        .anyerr()?;
        let open_connections = IntGaugeVec::new(
            Opts::new(
                "servertailnet_open_connections",
                "Transport connections to agents that are currently open",
            ),
            &["network"],
        )
        .anyerr()?;
        let dials_total = IntCounterVec::new(
            Opts::new("servertailnet_dials_total", "Total overlay dials to agents"),
            &["network", "result"],
        )
        .anyerr()?;
        Ok(Self {
            connections_total,
            open_connections,
            dials_total,
        })
    }

    /// Records a newly opened transport connection.
    ///
    /// The returned guard keeps the connection counted as open until dropped.
    pub fn connection_opened(&self, network: &'static str) -> OpenConnectionGuard {
        self.connections_total.with_label_values(&[network]).inc();
        self.open_connections.with_label_values(&[network]).inc();
        OpenConnectionGuard {
            metrics: self.clone(),
            network,
        }
    }

    pub(crate) fn record_dial(&self, network: &'static str, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.dials_total.with_label_values(&[network, result]).inc();
    }

    /// Total connections opened for `network`.
    pub fn connections_total(&self, network: &str) -> u64 {
        self.connections_total.with_label_values(&[network]).get()
    }

    /// Currently open connections for `network`.
    pub fn open_connections(&self, network: &str) -> i64 {
        self.open_connections.with_label_values(&[network]).get()
    }

    /// Total dials for `network` with the given result label (`ok` or `error`).
    pub fn dials_total(&self, network: &str, result: &str) -> u64 {
        self.dials_total.with_label_values(&[network, result]).get()
    }
}

impl Collector for ServerMetrics {
    fn desc(&self) -> Vec<&Desc> {
        let mut desc = self.connections_total.desc();
        desc.extend(self.open_connections.desc());
        desc.extend(self.dials_total.desc());
        desc
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut families = self.connections_total.collect();
        families.extend(self.open_connections.collect());
        families.extend(self.dials_total.collect());
        families
    }
}

/// Decrements the open-connections gauge when dropped.
#[derive(Debug)]
pub struct OpenConnectionGuard {
    metrics: ServerMetrics,
    network: &'static str,
}

impl Drop for OpenConnectionGuard {
    fn drop(&mut self) {
        self.metrics
            .open_connections
            .with_label_values(&[self.network])
            .dec();
    }
}
