//! Metrics collector using prometheus-client.
//!
//! Tracks connections, remote-leg failures, bytes relayed and session
//! duration per forwarding rule.

use crate::proxy::Direction;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;

/// Labels for per-rule metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RuleLabels {
    pub rule: String,
}

/// Labels for bytes transferred metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BytesLabels {
    pub rule: String,
    pub direction: ByteDirection,
}

/// Direction label value.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
#[allow(non_camel_case_types)]
pub enum ByteDirection {
    to_remote,
    to_local,
}

impl From<Direction> for ByteDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::ToRemote => ByteDirection::to_remote,
            Direction::ToLocal => ByteDirection::to_local,
        }
    }
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Accepted connections counter.
    connections_total: Family<RuleLabels, Counter>,
    /// Sessions currently open.
    active_connections: Family<RuleLabels, Gauge>,
    /// Failed remote-leg establishments.
    remote_connect_failures: Family<RuleLabels, Counter>,
    /// Accept errors on the local listener.
    accept_errors: Family<RuleLabels, Counter>,
    /// Bytes relayed.
    bytes_total: Family<BytesLabels, Counter>,
    /// Session duration histogram (in seconds).
    session_duration_seconds: Family<RuleLabels, Histogram>,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let connections_total = Family::<RuleLabels, Counter>::default();
        let active_connections = Family::<RuleLabels, Gauge>::default();
        let remote_connect_failures = Family::<RuleLabels, Counter>::default();
        let accept_errors = Family::<RuleLabels, Counter>::default();
        let bytes_total = Family::<BytesLabels, Counter>::default();
        let session_duration_seconds =
            Family::<RuleLabels, Histogram>::new_with_constructor(|| {
                // Buckets: 10ms up to roughly 2.7 hours
                Histogram::new(exponential_buckets(0.01, 4.0, 12))
            });

        registry.register(
            "portfwd_connections",
            "Total number of accepted connections",
            connections_total.clone(),
        );
        registry.register(
            "portfwd_active_connections",
            "Number of open relay sessions",
            active_connections.clone(),
        );
        registry.register(
            "portfwd_remote_connect_failures",
            "Total number of failed remote connections, direct or through a proxy",
            remote_connect_failures.clone(),
        );
        registry.register(
            "portfwd_accept_errors",
            "Total number of errors accepting local connections",
            accept_errors.clone(),
        );
        registry.register("portfwd_bytes", "Total bytes relayed", bytes_total.clone());
        registry.register(
            "portfwd_session_duration_seconds",
            "Relay session duration in seconds",
            session_duration_seconds.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                connections_total,
                active_connections,
                remote_connect_failures,
                accept_errors,
                bytes_total,
                session_duration_seconds,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    fn labels(rule: &str) -> RuleLabels {
        RuleLabels {
            rule: rule.to_string(),
        }
    }

    /// Count an accepted connection and mark it active.
    pub fn connection_opened(&self, rule: &str) {
        let labels = Self::labels(rule);
        self.inner.active_connections.get_or_create(&labels).inc();
        self.inner.connections_total.get_or_create(&labels).inc();
    }

    /// Mark a session as closed.
    pub fn connection_closed(&self, rule: &str) {
        self.inner
            .active_connections
            .get_or_create(&Self::labels(rule))
            .dec();
    }

    /// Count a failed remote-leg establishment.
    pub fn remote_connect_failed(&self, rule: &str) {
        self.inner
            .remote_connect_failures
            .get_or_create(&Self::labels(rule))
            .inc();
    }

    /// Count an accept error.
    pub fn accept_failed(&self, rule: &str) {
        self.inner
            .accept_errors
            .get_or_create(&Self::labels(rule))
            .inc();
    }

    /// Record a finished relay session.
    pub fn record_session(
        &self,
        rule: &str,
        bytes_to_remote: u64,
        bytes_to_local: u64,
        duration: Duration,
    ) {
        self.inner
            .session_duration_seconds
            .get_or_create(&Self::labels(rule))
            .observe(duration.as_secs_f64());

        for (direction, bytes) in [
            (Direction::ToRemote, bytes_to_remote),
            (Direction::ToLocal, bytes_to_local),
        ] {
            let labels = BytesLabels {
                rule: rule.to_string(),
                direction: direction.into(),
            };
            self.inner.bytes_total.get_or_create(&labels).inc_by(bytes);
        }
    }

    /// Current number of open sessions for `rule`.
    pub fn active_connections(&self, rule: &str) -> i64 {
        self.inner
            .active_connections
            .get_or_create(&Self::labels(rule))
            .get()
    }

    /// Total connections accepted for `rule`.
    pub fn connections_total(&self, rule: &str) -> u64 {
        self.inner
            .connections_total
            .get_or_create(&Self::labels(rule))
            .get()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
