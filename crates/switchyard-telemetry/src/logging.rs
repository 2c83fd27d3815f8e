//! Structured logging.
//!
//! Logs go to stdout as flattened JSON records in production and as pretty,
//! multi-line records in development. Every control plane event carries an
//! `event` field from [`events`] so log pipelines can key on it.

use serde::Deserialize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::TelemetryError;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// The `[logging]` section of the control plane config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSettings {
    /// `EnvFilter` directive. `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl LogSettings {
    fn filter(&self) -> Result<EnvFilter, TelemetryError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.level)
            .map_err(|e| TelemetryError::LoggingInit(format!("invalid level '{}': {e}", self.level)))
    }
}

/// Install the global subscriber. Fails if one is already set.
pub fn init_logging(settings: &LogSettings) -> Result<(), TelemetryError> {
    let filter = settings.filter()?;
    let result = match settings.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .flatten_event(true)
                    .with_filter(filter),
            )
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_filter(filter),
            )
            .try_init(),
    };
    result.map_err(|e| TelemetryError::LoggingInit(e.to_string()))
}

/// Standard log event names.
pub mod events {
    /// Control plane is starting up.
    pub const STARTUP: &str = "startup";

    /// Admin API is listening.
    pub const LISTENING: &str = "listening";

    /// A new config document passed health gating.
    pub const PUBLISH_SUCCEEDED: &str = "publish_succeeded";

    /// A publish failed health gating and the previous snapshot was restored.
    pub const ROLLED_BACK: &str = "rolled_back";

    /// Restoring the previous snapshot failed; manual intervention required.
    pub const ROLLBACK_FAILED: &str = "rollback_failed";

    /// Live file and repository rows disagree after a restore.
    pub const DRIFT_DETECTED: &str = "drift_detected";

    /// A write was blocked by the conflict detector.
    pub const CONFLICT_REJECTED: &str = "conflict_rejected";

    /// A certificate moved into `expiring` or `expired`.
    pub const CERTIFICATE_TRANSITION: &str = "certificate_transition";

    /// Auto-discovery flagged a label-declared route.
    pub const DISCOVERY_FLAGGED: &str = "discovery_flagged";
}

/// Helper macros for structured logging with standard fields.
#[macro_export]
macro_rules! log_startup {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::STARTUP,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_listening {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::LISTENING,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_publish_succeeded {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::PUBLISH_SUCCEEDED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_rolled_back {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::ROLLED_BACK,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_rollback_failed {
    ($($field:tt)*) => {
        tracing::error!(
            event = $crate::logging::events::ROLLBACK_FAILED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_drift_detected {
    ($($field:tt)*) => {
        tracing::error!(
            event = $crate::logging::events::DRIFT_DETECTED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_conflict_rejected {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::CONFLICT_REJECTED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_certificate_transition {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::CERTIFICATE_TRANSITION,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_discovery_flagged {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::DISCOVERY_FLAGGED,
            $($field)*
        )
    };
}
