//! Health-gated publishing with automatic rollback.
//!
//! Every mutating operation runs under one publish lock:
//!
//! ```text
//! PENDING -> PUBLISHED -> HEALTH_CHECKING -> HEALTHY
//!    |                                   \-> ROLLED_BACK
//!    \-> FAILED (render or file swap failed, nothing went live)
//! ```
//!
//! Before any row changes, the current rows and live document are captured as
//! an automatic snapshot. That snapshot is what a failed health check restores.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use switchyard_rules::Conflict;
use switchyard_telemetry::MetricsRegistry;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::context::{AuditDraft, OperationContext};
use crate::db::{
    audit_action, audit_result, entity_type, ConfigSnapshot, ConfigState, ConfigStore,
};
use crate::error::ControlError;
use crate::health::{saturating_millis, HealthGate, ProbeTarget};
use crate::publisher::AtomicPublisher;
use crate::renderer::{self, RenderSettings, RenderedConfig};
use crate::repository::{conflict_records, Plan};
use crate::snapshot::{RestoreResult, SnapshotBundle, SnapshotManager};

/// Phase of a single publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishPhase {
    Pending,
    Published,
    HealthChecking,
    Healthy,
    RolledBack,
    Failed,
}

impl PublishPhase {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Published => "published",
            Self::HealthChecking => "health_checking",
            Self::Healthy => "healthy",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }
}

/// Record of one publish attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishReport {
    pub reason: String,
    pub phase: PublishPhase,
    pub transitions: Vec<PublishPhase>,
    pub pre_snapshot_id: Option<Uuid>,
    pub snapshot_id: Option<Uuid>,
    pub checksum: Option<String>,
    pub health_attempts: u32,
    pub probed_routes: Vec<String>,
    pub duration_ms: u64,
}

impl PublishReport {
    fn start(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
            phase: PublishPhase::Pending,
            transitions: vec![PublishPhase::Pending],
            pre_snapshot_id: None,
            snapshot_id: None,
            checksum: None,
            health_attempts: 0,
            probed_routes: Vec::new(),
            duration_ms: 0,
        }
    }

    fn advance(&mut self, phase: PublishPhase) {
        tracing::debug!(reason = %self.reason, from = self.phase.as_str(), to = phase.as_str(), "publish transition");
        self.phase = phase;
        self.transitions.push(phase);
    }
}

/// Result of a committed operation.
#[derive(Debug, Clone, Serialize)]
pub struct Applied<T> {
    pub data: T,
    /// Non-blocking conflict findings, including errors overridden with `force`.
    pub warnings: Vec<Conflict>,
    /// Absent when the operation changed nothing.
    pub publish: Option<PublishReport>,
}

pub struct Orchestrator {
    store: Arc<dyn ConfigStore>,
    publisher: AtomicPublisher,
    snapshots: Arc<SnapshotManager>,
    gate: HealthGate,
    settings: RenderSettings,
    metrics: Arc<MetricsRegistry>,
    lock: Arc<Mutex<()>>,
    last_publish: SyncMutex<Option<PublishReport>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        publisher: AtomicPublisher,
        snapshots: Arc<SnapshotManager>,
        gate: HealthGate,
        settings: RenderSettings,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            store,
            publisher,
            snapshots,
            gate,
            settings,
            metrics,
            lock: Arc::new(Mutex::new(())),
            last_publish: SyncMutex::new(None),
        }
    }

    /// The lock every mutating operation holds, for components outside the
    /// orchestrator that write state.
    pub fn lock_handle(&self) -> Arc<Mutex<()>> {
        self.lock.clone()
    }

    pub fn last_publish(&self) -> Option<PublishReport> {
        self.last_publish.lock().clone()
    }

    pub fn render_settings(&self) -> &RenderSettings {
        &self.settings
    }

    /// Plan, commit and publish one operation.
    ///
    /// The planner sees the state loaded under the lock. Planner errors are
    /// returned without side effects beyond conflict history.
    pub async fn apply<T, F>(
        &self,
        ctx: &OperationContext,
        label: &str,
        planner: F,
    ) -> Result<Applied<T>, ControlError>
    where
        F: FnOnce(&ConfigState) -> Result<Plan<T>, ControlError> + Send,
        T: Send,
    {
        let _guard = self.lock.lock().await;
        let before = self.store.load_state().await?;

        let plan = match planner(&before) {
            Ok(plan) => plan,
            Err(err) => {
                self.record_rejection(label, &before, &err).await;
                return Err(err);
            }
        };
        for conflict in plan.report.all() {
            self.metrics
                .record_conflict(conflict.kind.as_str(), conflict.severity.as_str());
        }
        let warnings: Vec<Conflict> = plan.report.all().cloned().collect();
        if plan.is_noop() {
            return Ok(Applied {
                data: plan.value,
                warnings,
                publish: None,
            });
        }

        let started = Instant::now();
        let mut run = PublishReport::start(label);
        let pre = self.capture_pre(&before, label, ctx).await?;
        run.pre_snapshot_id = Some(pre.id);

        if let Err(e) = self.store.apply(&plan.changes).await {
            run.advance(PublishPhase::Failed);
            self.finish(ctx, &plan.audits, false, audit_result::FAILED).await;
            self.metrics
                .record_publish("failed", started.elapsed().as_secs_f64());
            return Err(e.into());
        }
        if !plan.conflicts.is_empty() {
            if let Err(e) = self.store.record_conflicts(&plan.conflicts).await {
                tracing::warn!(error = %e, "failed to record conflict history");
            }
        }

        let targets = TargetSelection::Named(&plan.touched);
        let outcome = self.publish_locked(ctx, &mut run, &pre, targets, started).await;
        let (success, result) = match &outcome {
            Ok(_) => (true, audit_result::APPLIED),
            Err(ControlError::PublishFailedRolledBack { .. }) => (false, audit_result::ROLLED_BACK),
            Err(_) => (false, audit_result::FAILED),
        };
        self.finish(ctx, &plan.audits, success, result).await;
        self.prune().await;

        Ok(Applied {
            data: plan.value,
            warnings,
            publish: Some(outcome?),
        })
    }

    /// Re-render and publish the stored state, health gated. Every rendered
    /// router is probed.
    pub async fn publish_current(
        &self,
        ctx: &OperationContext,
        reason: &str,
    ) -> Result<PublishReport, ControlError> {
        let _guard = self.lock.lock().await;
        let started = Instant::now();
        let before = self.store.load_state().await?;
        let mut run = PublishReport::start(reason);
        let pre = self.capture_pre(&before, reason, ctx).await?;
        run.pre_snapshot_id = Some(pre.id);
        let outcome = self
            .publish_locked(ctx, &mut run, &pre, TargetSelection::All, started)
            .await;
        self.prune().await;
        outcome
    }

    /// Publish only if the live file differs from the rendered stored state.
    pub async fn reconcile(&self, ctx: &OperationContext) -> Result<Option<PublishReport>, ControlError> {
        {
            let _guard = self.lock.lock().await;
            let state = self.store.load_state().await?;
            let rendered = renderer::render(&state, &self.settings)?;
            let live = self.publisher.current().await?;
            if live.as_deref() == Some(rendered.content.as_str()) {
                tracing::info!(checksum = %rendered.checksum, "live config matches stored state");
                return Ok(None);
            }
        }
        self.publish_current(ctx, "startup reconciliation").await.map(Some)
    }

    /// Restore a snapshot on operator request.
    pub async fn restore(
        &self,
        ctx: &OperationContext,
        id: Uuid,
    ) -> Result<RestoreResult, ControlError> {
        let _guard = self.lock.lock().await;
        let target = self.snapshots.get(id).await?;
        let before = self.store.load_state().await?;
        self.capture_pre(&before, &format!("restore {id}"), ctx).await?;

        let draft = AuditDraft::new(
            entity_type::SNAPSHOT,
            Some(id),
            &target.label,
            audit_action::RESTORE,
            serde_json::json!({ "checksum": target.checksum }),
        );
        match self.snapshots.restore(id).await {
            Ok(result) => {
                let outcome = if result.drift.is_some() {
                    audit_result::DRIFT
                } else {
                    audit_result::RESTORED
                };
                self.audit(draft.finish(ctx, result.drift.is_none(), outcome)).await;
                self.prune().await;
                Ok(result)
            }
            Err(e) => {
                self.audit(draft.finish(ctx, false, audit_result::FAILED)).await;
                Err(e)
            }
        }
    }

    /// Store a manual snapshot of the current state.
    pub async fn capture(
        &self,
        ctx: &OperationContext,
        label: &str,
    ) -> Result<ConfigSnapshot, ControlError> {
        let _guard = self.lock.lock().await;
        let snapshot = self.snapshots.capture(label, false, &ctx.actor).await?;
        self.audit(
            AuditDraft::new(
                entity_type::SNAPSHOT,
                Some(snapshot.id),
                &snapshot.label,
                audit_action::CAPTURE,
                serde_json::json!({ "checksum": snapshot.checksum }),
            )
            .finish(ctx, true, audit_result::APPLIED),
        )
        .await;
        Ok(snapshot)
    }

    /// Validate and store an imported bundle as a manual snapshot.
    pub async fn import(
        &self,
        ctx: &OperationContext,
        bundle: SnapshotBundle,
    ) -> Result<ConfigSnapshot, ControlError> {
        let _guard = self.lock.lock().await;
        let label = bundle.label.clone();
        match self.snapshots.import(bundle, &ctx.actor).await {
            Ok(snapshot) => {
                self.audit(
                    AuditDraft::new(
                        entity_type::SNAPSHOT,
                        Some(snapshot.id),
                        &snapshot.label,
                        audit_action::IMPORT,
                        serde_json::json!({ "checksum": snapshot.checksum }),
                    )
                    .finish(ctx, true, audit_result::APPLIED),
                )
                .await;
                Ok(snapshot)
            }
            Err(err) => {
                self.record_rejection(&format!("import {label}"), &ConfigState::default(), &err)
                    .await;
                Err(err)
            }
        }
    }

    async fn capture_pre(
        &self,
        before: &ConfigState,
        label: &str,
        ctx: &OperationContext,
    ) -> Result<ConfigSnapshot, ControlError> {
        let live = self.publisher.current().await?;
        self.snapshots
            .capture_state(before, live, &format!("pre: {label}"), true, &ctx.actor)
            .await
    }

    /// Render the committed rows, swap the file, and gate on health.
    async fn publish_locked(
        &self,
        ctx: &OperationContext,
        run: &mut PublishReport,
        pre: &ConfigSnapshot,
        targets: TargetSelection<'_>,
        started: Instant,
    ) -> Result<PublishReport, ControlError> {
        let result = self.publish_inner(ctx, run, pre, targets).await;
        run.duration_ms = saturating_millis(started.elapsed());
        self.metrics
            .record_publish(run.phase.as_str(), started.elapsed().as_secs_f64());
        *self.last_publish.lock() = Some(run.clone());
        result.map(|()| run.clone())
    }

    async fn publish_inner(
        &self,
        ctx: &OperationContext,
        run: &mut PublishReport,
        pre: &ConfigSnapshot,
        targets: TargetSelection<'_>,
    ) -> Result<(), ControlError> {
        let state = self.store.load_state().await?;

        let rendered = match renderer::render(&state, &self.settings) {
            Ok(rendered) => rendered,
            Err(e) => {
                run.advance(PublishPhase::Failed);
                tracing::error!(reason = %run.reason, error = %e, "render failed, reverting rows");
                self.revert_rows(pre).await;
                self.audit_publish(ctx, run, false, audit_result::FAILED, Some(e.to_string()))
                    .await;
                return Err(e.into());
            }
        };
        run.checksum = Some(rendered.checksum.clone());

        if let Err(e) = self.publisher.publish(&rendered.content).await {
            run.advance(PublishPhase::Failed);
            tracing::error!(reason = %run.reason, error = %e, "file swap failed, reverting rows");
            self.revert_rows(pre).await;
            self.audit_publish(ctx, run, false, audit_result::FAILED, Some(e.to_string()))
                .await;
            return Err(e.into());
        }
        run.advance(PublishPhase::Published);

        match self
            .snapshots
            .capture_state(
                &state,
                Some(rendered.content.clone()),
                &format!("published: {}", run.reason),
                true,
                &ctx.actor,
            )
            .await
        {
            Ok(snapshot) => {
                run.snapshot_id = Some(snapshot.id);
                if let Err(e) = self.store.set_published_snapshot(snapshot.id).await {
                    tracing::warn!(error = %e, "failed to update published pointer");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to snapshot published state"),
        }

        run.advance(PublishPhase::HealthChecking);
        let targets = targets.resolve(&rendered);
        run.probed_routes = targets.iter().map(|t| t.name.clone()).collect();

        let reason = match self.gate.wait_healthy(&targets).await {
            Ok(attempts) => {
                run.health_attempts = attempts;
                run.advance(PublishPhase::Healthy);
                switchyard_telemetry::log_publish_succeeded!(
                    reason = %run.reason,
                    checksum = %rendered.checksum,
                    attempts,
                    "configuration published"
                );
                self.audit_publish(ctx, run, true, audit_result::PUBLISHED, None)
                    .await;
                return Ok(());
            }
            Err(e) => ControlError::HealthCheckTimeout(e.to_string()).to_string(),
        };
        run.health_attempts = self.gate.policy().attempts;

        match self.snapshots.restore(pre.id).await {
            Ok(restored) => {
                run.advance(PublishPhase::RolledBack);
                switchyard_telemetry::log_rolled_back!(
                    reason = %run.reason,
                    snapshot_id = %pre.id,
                    cause = %reason,
                    "publish rolled back"
                );
                self.audit_publish(ctx, run, false, audit_result::ROLLED_BACK, Some(reason.clone()))
                    .await;
                if let Some(drift) = &restored.drift {
                    self.audit_publish(ctx, run, false, audit_result::DRIFT, Some(drift.clone()))
                        .await;
                }
                Err(ControlError::PublishFailedRolledBack {
                    reason,
                    snapshot_id: pre.id,
                    drift: restored.drift,
                })
            }
            Err(e) => {
                run.advance(PublishPhase::Failed);
                let reason = format!("{reason}; restore failed: {e}");
                switchyard_telemetry::log_rollback_failed!(
                    reason = %run.reason,
                    snapshot_id = %pre.id,
                    cause = %reason,
                    "rollback failed, manual intervention required"
                );
                self.audit_publish(ctx, run, false, audit_result::FAILED, Some(reason.clone()))
                    .await;
                Err(ControlError::RollbackFailure {
                    reason,
                    snapshot_id: pre.id,
                })
            }
        }
    }

    /// Put rows back after a render or swap failure. Nothing went live.
    async fn revert_rows(&self, pre: &ConfigSnapshot) {
        if let Err(e) = self.store.replace_state(&pre.config_data).await {
            switchyard_telemetry::log_drift_detected!(
                snapshot_id = %pre.id,
                error = %e,
                "failed to revert rows after aborted publish"
            );
        }
    }

    async fn record_rejection(&self, label: &str, before: &ConfigState, err: &ControlError) {
        let ControlError::Conflict(report) = err else {
            return;
        };
        for conflict in &report.errors {
            switchyard_telemetry::log_conflict_rejected!(
                operation = %label,
                route = %conflict.route_a,
                conflicts_with = %conflict.route_b,
                kind = conflict.kind.as_str(),
                "write rejected by conflict detector"
            );
        }
        for conflict in report.all() {
            self.metrics
                .record_conflict(conflict.kind.as_str(), conflict.severity.as_str());
        }
        let records = conflict_records(report, before, None, chrono::Utc::now());
        if let Err(e) = self.store.record_conflicts(&records).await {
            tracing::warn!(error = %e, "failed to record conflict history");
        }
    }

    async fn audit_publish(
        &self,
        ctx: &OperationContext,
        run: &PublishReport,
        success: bool,
        result: &str,
        error: Option<String>,
    ) {
        let draft = AuditDraft::new(
            entity_type::CONFIG,
            run.snapshot_id,
            &run.reason,
            audit_action::PUBLISH,
            serde_json::json!({
                "checksum": run.checksum,
                "pre_snapshot_id": run.pre_snapshot_id,
                "snapshot_id": run.snapshot_id,
                "phase": run.phase,
                "error": error,
            }),
        );
        self.audit(draft.finish(ctx, success, result)).await;
    }

    async fn finish(&self, ctx: &OperationContext, drafts: &[AuditDraft], success: bool, result: &str) {
        for draft in drafts {
            self.audit(draft.finish(ctx, success, result)).await;
        }
    }

    async fn audit(&self, entry: crate::db::AuditEntry) {
        if let Err(e) = self.store.append_audit(&entry).await {
            tracing::error!(
                error = %e,
                action = %entry.action,
                entity = %entry.entity_name,
                "failed to write audit entry"
            );
        }
    }

    async fn prune(&self) {
        if let Err(e) = self.snapshots.prune().await {
            tracing::warn!(error = %e, "snapshot pruning failed");
        }
    }
}

/// Which routers to confirm after a swap.
enum TargetSelection<'a> {
    Named(&'a [String]),
    All,
}

impl TargetSelection<'_> {
    fn resolve(&self, rendered: &RenderedConfig) -> Vec<ProbeTarget> {
        let target = |(name, protocol): (&String, &renderer::Protocol)| ProbeTarget {
            name: name.clone(),
            protocol: *protocol,
        };
        match self {
            Self::All => rendered.routers.iter().map(target).collect(),
            Self::Named(names) => names
                .iter()
                .filter_map(|n| rendered.routers.get_key_value(n))
                .map(target)
                .collect(),
        }
    }
}
