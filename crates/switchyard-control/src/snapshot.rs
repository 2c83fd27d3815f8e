//! Point-in-time configuration snapshots: capture, restore, export/import and
//! retention.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchyard_rules::{ConflictDetector, ConflictReport, RouteSpec, Severity};
use switchyard_telemetry::MetricsRegistry;
use uuid::Uuid;

use crate::db::{ConfigSnapshot, ConfigState, ConfigStore, SnapshotSummary};
use crate::error::ControlError;
use crate::publisher::AtomicPublisher;
use crate::renderer::{self, RenderSettings, RenderedConfig};
use crate::repository::validate_state;

/// Format tag written into exported bundles.
pub const BUNDLE_FORMAT: &str = "switchyard.snapshot/v1";

/// Portable snapshot document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotBundle {
    pub format: String,
    pub exported_at: DateTime<Utc>,
    #[serde(default)]
    pub source_id: Option<Uuid>,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub config: ConfigState,
    #[serde(default)]
    pub rendered: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
}

/// What a restore did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreResult {
    pub snapshot_id: Uuid,
    pub checksum: Option<String>,
    /// False when the snapshot predates any publish and the live file was removed.
    pub file_restored: bool,
    /// Set when the file was restored but the rows could not be.
    pub drift: Option<String>,
    pub restored_at: DateTime<Utc>,
}

/// Check a configuration the way create, update and publish would: entities,
/// rules, conflicts and references. Returns the rendered document and any
/// warnings.
pub fn validate_config(
    state: &ConfigState,
    settings: &RenderSettings,
) -> Result<(RenderedConfig, ConflictReport), ControlError> {
    validate_state(state)?;
    let detector = ConflictDetector::new(
        state
            .active_routes()
            .map(|r| RouteSpec::new(&r.name, &r.rule, r.priority)),
    );
    if let Some((name, err)) = detector.unparseable().first() {
        return Err(ControlError::Validation(format!(
            "route '{name}' has an invalid rule: {err}"
        )));
    }
    let (errors, warnings): (Vec<_>, Vec<_>) = detector
        .scan()
        .into_iter()
        .partition(|c| c.severity == Severity::Error);
    let report = ConflictReport {
        valid: errors.is_empty(),
        errors,
        warnings,
    };
    if !report.valid {
        return Err(ControlError::Conflict(report));
    }
    let rendered = renderer::render(state, settings)?;
    Ok((rendered, report))
}

/// Captures and restores snapshots. Callers hold the publish lock.
pub struct SnapshotManager {
    store: Arc<dyn ConfigStore>,
    publisher: AtomicPublisher,
    settings: RenderSettings,
    retention: usize,
    metrics: Arc<MetricsRegistry>,
}

impl SnapshotManager {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        publisher: AtomicPublisher,
        settings: RenderSettings,
        retention: usize,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            store,
            publisher,
            settings,
            retention,
            metrics,
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Capture the stored rows and the live document.
    pub async fn capture(
        &self,
        label: &str,
        automatic: bool,
        actor: &str,
    ) -> Result<ConfigSnapshot, ControlError> {
        let state = self.store.load_state().await?;
        let live = self.publisher.current().await?;
        self.capture_state(&state, live, label, automatic, actor).await
    }

    /// Capture an explicit state and document.
    pub async fn capture_state(
        &self,
        state: &ConfigState,
        rendered: Option<String>,
        label: &str,
        automatic: bool,
        actor: &str,
    ) -> Result<ConfigSnapshot, ControlError> {
        let mut config_data = state.clone();
        for middleware in &mut config_data.middlewares {
            middleware.usage_count = 0;
        }
        let snapshot = ConfigSnapshot {
            id: Uuid::now_v7(),
            label: label.to_string(),
            created_at: Utc::now(),
            created_by: actor.to_string(),
            is_automatic: automatic,
            checksum: rendered.as_deref().map(renderer::checksum),
            config_data,
            rendered_file_content: rendered,
            restored_at: None,
        };
        self.store.insert_snapshot(&snapshot).await?;
        self.metrics.record_snapshot(automatic);
        tracing::debug!(
            snapshot_id = %snapshot.id,
            label = %snapshot.label,
            automatic,
            "snapshot captured"
        );
        Ok(snapshot)
    }

    /// Restore a snapshot: the live file first, then the rows.
    ///
    /// A failed file restore is an error and nothing else is touched. A failed
    /// row restore after the file was swapped is reported as drift.
    pub async fn restore(&self, id: Uuid) -> Result<RestoreResult, ControlError> {
        let snapshot = self.get(id).await?;

        let file_restored = match &snapshot.rendered_file_content {
            Some(content) => {
                self.publisher.publish(content).await?;
                true
            }
            None => {
                self.publisher.withdraw().await?;
                false
            }
        };

        let mut drift = None;
        if let Err(e) = self.store.set_published_snapshot(snapshot.id).await {
            drift = Some(format!("published pointer not updated: {e}"));
        }
        if let Err(e) = self.store.replace_state(&snapshot.config_data).await {
            drift = Some(format!("rows not restored: {e}"));
        }

        let restored_at = Utc::now();
        if let Some(reason) = &drift {
            switchyard_telemetry::log_drift_detected!(
                snapshot_id = %snapshot.id,
                reason = %reason,
                "live file restored but store is out of sync"
            );
        } else if let Err(e) = self.store.mark_snapshot_restored(snapshot.id, restored_at).await {
            tracing::warn!(snapshot_id = %snapshot.id, error = %e, "failed to mark snapshot restored");
        }

        Ok(RestoreResult {
            snapshot_id: snapshot.id,
            checksum: snapshot.checksum.clone(),
            file_restored,
            drift,
            restored_at,
        })
    }

    pub async fn list(&self) -> Result<Vec<SnapshotSummary>, ControlError> {
        Ok(self.store.list_snapshots().await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<ConfigSnapshot, ControlError> {
        self.store
            .get_snapshot(id)
            .await?
            .ok_or_else(|| ControlError::not_found("snapshot", id))
    }

    pub async fn export(&self, id: Uuid) -> Result<SnapshotBundle, ControlError> {
        let snapshot = self.get(id).await?;
        Ok(SnapshotBundle {
            format: BUNDLE_FORMAT.to_string(),
            exported_at: Utc::now(),
            source_id: Some(snapshot.id),
            label: snapshot.label,
            created_at: snapshot.created_at,
            created_by: snapshot.created_by,
            config: snapshot.config_data,
            rendered: snapshot.rendered_file_content,
            checksum: snapshot.checksum,
        })
    }

    /// Validate a bundle and store it as a manual snapshot. Nothing is applied.
    pub async fn import(
        &self,
        bundle: SnapshotBundle,
        actor: &str,
    ) -> Result<ConfigSnapshot, ControlError> {
        let (rendered, _) = check_bundle(&bundle, &self.settings)?;
        let mut state = bundle.config;
        state.sort();
        self.capture_state(
            &state,
            Some(rendered.content),
            &format!("import: {}", bundle.label),
            false,
            actor,
        )
        .await
    }

    /// Delete automatic snapshots beyond the retention count. Manual snapshots
    /// and the published one are always kept.
    pub async fn prune(&self) -> Result<usize, ControlError> {
        let published = self.store.published_snapshot().await?;
        let doomed: Vec<Uuid> = self
            .store
            .list_snapshots()
            .await?
            .into_iter()
            .filter(|s| s.is_automatic)
            .skip(self.retention)
            .filter(|s| Some(s.id) != published)
            .map(|s| s.id)
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        let deleted = self.store.delete_snapshots(&doomed).await?;
        tracing::debug!(deleted, retention = self.retention, "pruned snapshots");
        Ok(deleted as usize)
    }
}

/// Validate a bundle's format, integrity and contents. Returns the
/// rendered document and any warnings.
pub fn check_bundle(
    bundle: &SnapshotBundle,
    settings: &RenderSettings,
) -> Result<(RenderedConfig, ConflictReport), ControlError> {
    if bundle.format != BUNDLE_FORMAT {
        return Err(ControlError::Validation(format!(
            "unsupported bundle format '{}', expected '{BUNDLE_FORMAT}'",
            bundle.format
        )));
    }
    if let (Some(rendered), Some(expected)) = (&bundle.rendered, &bundle.checksum) {
        if renderer::checksum(rendered) != *expected {
            return Err(ControlError::Validation(
                "bundle checksum does not match its rendered document".into(),
            ));
        }
    }
    validate_config(&bundle.config, settings)
}
