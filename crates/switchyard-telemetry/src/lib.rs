//! Logging and metrics for the Switchyard control plane.
//!
//! [`init`] installs the tracing subscriber described by the `[logging]`
//! config section and builds the [`MetricsRegistry`] named by `[metrics]`.
//! Control plane code logs through the `log_*!` macros so each record carries
//! a stable `event` field.

pub mod logging;
pub mod metrics;

pub use logging::{events, LogFormat, LogSettings};
pub use metrics::{MetricsRegistry, MetricsSettings};

use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("invalid metrics namespace '{0}': must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidNamespace(String),
}

/// Build the metrics registry, then install logging.
///
/// The registry is checked first so a bad namespace fails before the global
/// subscriber is claimed.
pub fn init(
    logging: &LogSettings,
    metrics: &MetricsSettings,
) -> Result<Arc<MetricsRegistry>, TelemetryError> {
    let registry = MetricsRegistry::from_settings(metrics)?;
    logging::init_logging(logging)?;
    Ok(Arc::new(registry))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_namespace_fails_before_logging() {
        let metrics = MetricsSettings {
            namespace: "edge proxy".to_string(),
        };
        let err = init(&LogSettings::default(), &metrics).unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidNamespace(_)));
        assert!(err.to_string().contains("edge proxy"));
    }
}
