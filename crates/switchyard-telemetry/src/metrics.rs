//! Prometheus metrics for publishes, conflicts, certificates, discovery and
//! snapshots, exposed in the text exposition format.

use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};
use serde::Deserialize;

use crate::TelemetryError;

/// Content-Type of [`MetricsRegistry::encode`] output.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Prefix of every metric name unless configured otherwise.
pub const DEFAULT_NAMESPACE: &str = "switchyard";

/// Publish duration buckets (in seconds). Health gating dominates, so the
/// range runs from 10ms up to the 10s health budget and a little past it.
const PUBLISH_BUCKETS: [f64; 10] = [0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0];

/// The `[metrics]` section of the control plane config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsSettings {
    /// Prefix for every metric name, e.g. `edge` gives `edge_publishes_total`.
    pub namespace: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl MetricsSettings {
    /// The namespace must itself be a valid Prometheus metric name.
    pub fn validate(&self) -> Result<(), TelemetryError> {
        let mut chars = self.namespace.chars();
        let valid = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if valid {
            Ok(())
        } else {
            Err(TelemetryError::InvalidNamespace(self.namespace.clone()))
        }
    }
}

/// Publish outcome labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PublishLabels {
    pub outcome: String,
}

/// Conflict labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ConflictLabels {
    pub kind: String,
    pub severity: String,
}

/// Certificate status labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CertificateLabels {
    pub status: String,
}

/// Discovery cycle labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DiscoveryLabels {
    pub result: String,
}

/// Snapshot labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SnapshotLabels {
    pub kind: String,
}

/// Every control plane metric, registered under one namespace.
#[derive(Debug)]
pub struct MetricsRegistry {
    registry: Registry,

    pub publishes_total: Family<PublishLabels, Counter>,
    pub publish_duration_seconds: Family<PublishLabels, Histogram>,
    pub conflicts_detected_total: Family<ConflictLabels, Counter>,
    pub certificates: Family<CertificateLabels, Gauge>,
    pub discovery_runs_total: Family<DiscoveryLabels, Counter>,
    pub snapshots_captured_total: Family<SnapshotLabels, Counter>,
}

impl MetricsRegistry {
    /// Registry under [`DEFAULT_NAMESPACE`].
    pub fn new() -> Self {
        Self::build(Registry::with_prefix(DEFAULT_NAMESPACE))
    }

    pub fn from_settings(settings: &MetricsSettings) -> Result<Self, TelemetryError> {
        settings.validate()?;
        Ok(Self::build(Registry::with_prefix(&settings.namespace)))
    }

    fn build(mut registry: Registry) -> Self {

        let publishes_total = Family::<PublishLabels, Counter>::default();
        registry.register(
            "publishes",
            "Total number of config publish operations by outcome",
            publishes_total.clone(),
        );

        let publish_duration_seconds =
            Family::<PublishLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(PUBLISH_BUCKETS.iter().cloned())
            });
        registry.register(
            "publish_duration_seconds",
            "Duration of publish operations including health gating",
            publish_duration_seconds.clone(),
        );

        let conflicts_detected_total = Family::<ConflictLabels, Counter>::default();
        registry.register(
            "conflicts_detected",
            "Total number of route conflicts detected",
            conflicts_detected_total.clone(),
        );

        let certificates = Family::<CertificateLabels, Gauge>::default();
        registry.register(
            "certificates",
            "Number of tracked certificates by status",
            certificates.clone(),
        );

        let discovery_runs_total = Family::<DiscoveryLabels, Counter>::default();
        registry.register(
            "discovery_runs",
            "Total number of auto-discovery reconciliation cycles",
            discovery_runs_total.clone(),
        );

        let snapshots_captured_total = Family::<SnapshotLabels, Counter>::default();
        registry.register(
            "snapshots_captured",
            "Total number of config snapshots captured",
            snapshots_captured_total.clone(),
        );

        Self {
            registry,
            publishes_total,
            publish_duration_seconds,
            conflicts_detected_total,
            certificates,
            discovery_runs_total,
            snapshots_captured_total,
        }
    }

    /// Text exposition of every metric.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }

    /// Record a finished publish operation.
    pub fn record_publish(&self, outcome: &str, duration_secs: f64) {
        let labels = PublishLabels {
            outcome: outcome.to_string(),
        };
        self.publishes_total.get_or_create(&labels).inc();
        self.publish_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a detected conflict.
    pub fn record_conflict(&self, kind: &str, severity: &str) {
        let labels = ConflictLabels {
            kind: kind.to_string(),
            severity: severity.to_string(),
        };
        self.conflicts_detected_total.get_or_create(&labels).inc();
    }

    /// Set the number of certificates in a given status.
    pub fn set_certificate_count(&self, status: &str, count: i64) {
        let labels = CertificateLabels {
            status: status.to_string(),
        };
        self.certificates.get_or_create(&labels).set(count);
    }

    /// Record a discovery cycle.
    pub fn record_discovery_run(&self, result: &str) {
        let labels = DiscoveryLabels {
            result: result.to_string(),
        };
        self.discovery_runs_total.get_or_create(&labels).inc();
    }

    /// Record a captured snapshot.
    pub fn record_snapshot(&self, automatic: bool) {
        let labels = SnapshotLabels {
            kind: if automatic { "automatic" } else { "manual" }.to_string(),
        };
        self.snapshots_captured_total.get_or_create(&labels).inc();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_publish_counts_by_outcome() {
        let registry = MetricsRegistry::new();
        registry.record_publish("published", 0.2);
        registry.record_publish("published", 0.3);
        registry.record_publish("rolled_back", 9.0);

        let published = PublishLabels {
            outcome: "published".to_string(),
        };
        assert_eq!(registry.publishes_total.get_or_create(&published).get(), 2);
    }

    #[test]
    fn certificate_gauge_is_overwritten() {
        let registry = MetricsRegistry::new();
        registry.set_certificate_count("valid", 4);
        registry.set_certificate_count("valid", 3);
        let labels = CertificateLabels {
            status: "valid".to_string(),
        };
        assert_eq!(registry.certificates.get_or_create(&labels).get(), 3);
    }

    #[test]
    fn encode_exposes_default_namespace() {
        let registry = MetricsRegistry::new();
        registry.record_publish("rolled_back", 3.2);
        registry.set_certificate_count("expiring", 2);

        let output = registry.encode().unwrap();
        assert!(output.contains("# TYPE switchyard_publishes counter"));
        assert!(output.contains("outcome=\"rolled_back\""));
        assert!(output.contains("switchyard_certificates{status=\"expiring\"} 2"));
    }

    #[test]
    fn namespace_prefixes_every_metric() {
        let settings = MetricsSettings {
            namespace: "edge".to_string(),
        };
        let registry = MetricsRegistry::from_settings(&settings).unwrap();
        registry.record_snapshot(true);
        let output = registry.encode().unwrap();
        assert!(output.contains("edge_snapshots_captured_total{kind=\"automatic\"} 1"));
        assert!(!output.contains("switchyard_"));
    }

    #[test]
    fn namespace_must_be_a_metric_name() {
        for bad in ["", "9lives", "edge-proxy", "edge.proxy"] {
            let settings = MetricsSettings {
                namespace: bad.to_string(),
            };
            assert!(matches!(
                MetricsRegistry::from_settings(&settings),
                Err(TelemetryError::InvalidNamespace(_))
            ));
        }
        assert!(MetricsSettings::default().validate().is_ok());
    }
}
