//! The control plane facade: every operator-facing operation, wired to the
//! repository, orchestrator and snapshot manager.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use switchyard_rules::{Conflict, ConflictReport};
use switchyard_telemetry::MetricsRegistry;
use uuid::Uuid;

use crate::context::OperationContext;
use crate::db::{
    AuditEntry, Certificate, ConfigSnapshot, ConfigStore, Middleware, NewMiddleware, NewRoute,
    NewService, Route, RouteConflict, RouteSource, Service, SnapshotSummary, UpdateMiddleware,
    UpdateRoute, UpdateService,
};
use crate::error::ControlError;
use crate::health::{HealthGate, HealthPolicy, ProxyProbe};
use crate::orchestrator::{Applied, Orchestrator, PublishReport};
use crate::publisher::AtomicPublisher;
use crate::renderer::RenderSettings;
use crate::repository::{
    plan_create_middleware, plan_create_route, plan_create_service, plan_delete_middleware,
    plan_delete_route, plan_delete_service, plan_update_middleware, plan_update_route,
    plan_update_service, resolve_middleware, resolve_route, resolve_service, scan_conflicts,
    ConfigRepository, RouteDraft,
};
use crate::snapshot::{RestoreResult, SnapshotBundle, SnapshotManager};

/// How many conflict history rows `conflicts()` returns.
const CONFLICT_HISTORY_LIMIT: i64 = 200;

#[derive(Debug, Clone)]
pub struct PlaneSettings {
    /// The dynamic configuration file the proxy watches.
    pub live_path: PathBuf,
    pub render: RenderSettings,
    pub health: HealthPolicy,
    /// Automatic snapshots kept after pruning.
    pub snapshot_retention: usize,
}

/// Current findings plus persisted history.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictsView {
    pub current: Vec<Conflict>,
    pub history: Vec<RouteConflict>,
}

/// Liveness of the control plane and its store.
#[derive(Debug, Clone, Serialize)]
pub struct PlaneHealth {
    pub status: &'static str,
    pub store: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
    pub published_snapshot: Option<Uuid>,
    pub last_publish: Option<PublishReport>,
}

pub struct ControlPlane {
    store: Arc<dyn ConfigStore>,
    repository: ConfigRepository,
    snapshots: Arc<SnapshotManager>,
    orchestrator: Arc<Orchestrator>,
    publisher: AtomicPublisher,
    metrics: Arc<MetricsRegistry>,
}

impl ControlPlane {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        probe: Arc<dyn ProxyProbe>,
        settings: PlaneSettings,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let publisher = AtomicPublisher::new(settings.live_path);
        let snapshots = Arc::new(SnapshotManager::new(
            store.clone(),
            publisher.clone(),
            settings.render.clone(),
            settings.snapshot_retention,
            metrics.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            publisher.clone(),
            snapshots.clone(),
            HealthGate::new(probe, settings.health),
            settings.render,
            metrics.clone(),
        ));
        Self {
            repository: ConfigRepository::new(store.clone()),
            store,
            snapshots,
            orchestrator,
            publisher,
            metrics,
        }
    }

    pub fn repository(&self) -> &ConfigRepository {
        &self.repository
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn publisher(&self) -> &AtomicPublisher {
        &self.publisher
    }

    // --- routes ---

    pub async fn create_route(
        &self,
        ctx: &OperationContext,
        input: NewRoute,
        force: bool,
    ) -> Result<Applied<Route>, ControlError> {
        let label = format!("create route {}", input.name);
        let actor = ctx.actor.clone();
        self.orchestrator
            .apply(ctx, &label, move |state| {
                plan_create_route(state, input, &actor, RouteSource::Manual, force)
            })
            .await
    }

    pub async fn update_route(
        &self,
        ctx: &OperationContext,
        key: &str,
        update: UpdateRoute,
        force: bool,
    ) -> Result<Applied<Route>, ControlError> {
        let label = format!("update route {key}");
        self.orchestrator
            .apply(ctx, &label, move |state| {
                let id = resolve_route(state, key)?;
                plan_update_route(state, id, update, force)
            })
            .await
    }

    pub async fn delete_route(
        &self,
        ctx: &OperationContext,
        key: &str,
    ) -> Result<Applied<Route>, ControlError> {
        let label = format!("delete route {key}");
        self.orchestrator
            .apply(ctx, &label, move |state| {
                plan_delete_route(state, resolve_route(state, key)?)
            })
            .await
    }

    /// Dry-run the conflict detector. Nothing is written.
    pub async fn validate_route(&self, draft: &RouteDraft) -> Result<ConflictReport, ControlError> {
        self.repository.validate_route(draft).await
    }

    // --- services ---

    pub async fn create_service(
        &self,
        ctx: &OperationContext,
        input: NewService,
    ) -> Result<Applied<Service>, ControlError> {
        let label = format!("create service {}", input.name);
        self.orchestrator
            .apply(ctx, &label, move |state| plan_create_service(state, input))
            .await
    }

    pub async fn update_service(
        &self,
        ctx: &OperationContext,
        key: &str,
        update: UpdateService,
        force: bool,
    ) -> Result<Applied<Service>, ControlError> {
        let label = format!("update service {key}");
        self.orchestrator
            .apply(ctx, &label, move |state| {
                let id = resolve_service(state, key)?;
                plan_update_service(state, id, update, force)
            })
            .await
    }

    pub async fn delete_service(
        &self,
        ctx: &OperationContext,
        key: &str,
        force: bool,
    ) -> Result<Applied<Service>, ControlError> {
        let label = format!("delete service {key}");
        self.orchestrator
            .apply(ctx, &label, move |state| {
                plan_delete_service(state, resolve_service(state, key)?, force)
            })
            .await
    }

    // --- middlewares ---

    pub async fn create_middleware(
        &self,
        ctx: &OperationContext,
        input: NewMiddleware,
    ) -> Result<Applied<Middleware>, ControlError> {
        let label = format!("create middleware {}", input.name);
        self.orchestrator
            .apply(ctx, &label, move |state| plan_create_middleware(state, input))
            .await
    }

    pub async fn update_middleware(
        &self,
        ctx: &OperationContext,
        key: &str,
        update: UpdateMiddleware,
    ) -> Result<Applied<Middleware>, ControlError> {
        let label = format!("update middleware {key}");
        self.orchestrator
            .apply(ctx, &label, move |state| {
                let id = resolve_middleware(state, key)?;
                plan_update_middleware(state, id, update)
            })
            .await
    }

    pub async fn delete_middleware(
        &self,
        ctx: &OperationContext,
        key: &str,
        force: bool,
    ) -> Result<Applied<Middleware>, ControlError> {
        let label = format!("delete middleware {key}");
        self.orchestrator
            .apply(ctx, &label, move |state| {
                plan_delete_middleware(state, resolve_middleware(state, key)?, force)
            })
            .await
    }

    // --- publishing and snapshots ---

    pub async fn publish(&self, ctx: &OperationContext) -> Result<PublishReport, ControlError> {
        self.orchestrator.publish_current(ctx, "manual publish").await
    }

    pub async fn capture_snapshot(
        &self,
        ctx: &OperationContext,
        label: &str,
    ) -> Result<ConfigSnapshot, ControlError> {
        self.orchestrator.capture(ctx, label).await
    }

    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotSummary>, ControlError> {
        self.snapshots.list().await
    }

    pub async fn get_snapshot(&self, id: Uuid) -> Result<ConfigSnapshot, ControlError> {
        self.snapshots.get(id).await
    }

    pub async fn restore_snapshot(
        &self,
        ctx: &OperationContext,
        id: Uuid,
    ) -> Result<RestoreResult, ControlError> {
        self.orchestrator.restore(ctx, id).await
    }

    pub async fn export_snapshot(&self, id: Uuid) -> Result<SnapshotBundle, ControlError> {
        self.snapshots.export(id).await
    }

    pub async fn import_snapshot(
        &self,
        ctx: &OperationContext,
        bundle: SnapshotBundle,
    ) -> Result<ConfigSnapshot, ControlError> {
        self.orchestrator.import(ctx, bundle).await
    }

    // --- reads ---

    pub async fn certificates(&self) -> Result<Vec<Certificate>, ControlError> {
        Ok(self.store.list_certificates().await?)
    }

    pub async fn conflicts(&self) -> Result<ConflictsView, ControlError> {
        let state = self.store.load_state().await?;
        Ok(ConflictsView {
            current: scan_conflicts(&state),
            history: self.store.list_conflicts(CONFLICT_HISTORY_LIMIT).await?,
        })
    }

    pub async fn audit(&self, limit: i64) -> Result<Vec<AuditEntry>, ControlError> {
        Ok(self.store.list_audit(limit).await?)
    }

    pub async fn health(&self) -> PlaneHealth {
        let (store, store_error) = match self.store.ping().await {
            Ok(()) => ("ok", None),
            Err(e) => ("unavailable", Some(e.to_string())),
        };
        PlaneHealth {
            status: if store_error.is_none() { "ok" } else { "degraded" },
            store,
            store_error,
            published_snapshot: self.store.published_snapshot().await.ok().flatten(),
            last_publish: self.orchestrator.last_publish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        audit_action, audit_result, BackendTarget, MiddlewareType, RouteStatus, ServiceStatus,
        ServiceType,
    };
    use crate::testing::{new_route, test_plane};

    fn service(name: &str) -> NewService {
        NewService {
            name: name.into(),
            kind: ServiceType::Http,
            backend_targets: vec![BackendTarget {
                url: format!("http://{name}:8080"),
                weight: 1,
            }],
            health_check: None,
            status: ServiceStatus::Active,
        }
    }

    #[tokio::test]
    async fn duplicate_priority_is_rejected_then_warns_after_priority_change() {
        let t = test_plane();
        let ctx = OperationContext::new("alice");
        t.plane.create_service(&ctx, service("api")).await.unwrap();
        t.plane
            .create_route(
                &ctx,
                new_route("api-v1", "Host(`api.example.com`) && PathPrefix(`/v1`)", "api", 10),
                false,
            )
            .await
            .unwrap();

        let err = t
            .plane
            .create_route(
                &ctx,
                new_route("api-all", "Host(`api.example.com`) && PathPrefix(`/`)", "api", 10),
                false,
            )
            .await
            .unwrap_err();
        let ControlError::Conflict(report) = err else {
            panic!("expected a conflict rejection");
        };
        assert!(!report.valid);

        let applied = t
            .plane
            .create_route(
                &ctx,
                new_route("api-all", "Host(`api.example.com`) && PathPrefix(`/`)", "api", 5),
                false,
            )
            .await
            .unwrap();
        assert!(!applied.warnings.is_empty());
        assert!(applied.publish.is_some());
    }

    #[tokio::test]
    async fn force_overrides_conflict_errors() {
        let t = test_plane();
        let ctx = OperationContext::new("alice");
        t.plane.create_service(&ctx, service("api")).await.unwrap();
        t.plane
            .create_route(&ctx, new_route("a", "Host(`x.example.com`)", "api", 1), false)
            .await
            .unwrap();
        let applied = t
            .plane
            .create_route(&ctx, new_route("b", "Host(`x.example.com`)", "api", 1), true)
            .await
            .unwrap();
        assert!(!applied.warnings.is_empty());
        assert_eq!(t.plane.repository().get_route("b").await.unwrap().name, "b");
    }

    #[tokio::test]
    async fn service_delete_with_dependents_needs_force_and_cascades() {
        let t = test_plane();
        let ctx = OperationContext::new("alice");
        t.plane.create_service(&ctx, service("api")).await.unwrap();
        t.plane
            .create_route(&ctx, new_route("web", "Host(`web.example.com`)", "api", 0), false)
            .await
            .unwrap();

        let err = t.plane.delete_service(&ctx, "api", false).await.unwrap_err();
        assert!(matches!(err, ControlError::ReferentialConflict { .. }));

        t.plane.delete_service(&ctx, "api", true).await.unwrap();
        let route = t.plane.repository().get_route("web").await.unwrap();
        assert_eq!(route.status, RouteStatus::Disabled);
        let audit = t.plane.audit(50).await.unwrap();
        assert!(audit
            .iter()
            .any(|e| e.action == audit_action::DISABLE && e.result == audit_result::CASCADE));
        let live = t.publisher.current().await.unwrap().unwrap();
        assert!(!live.contains("web.example.com"));
    }

    #[tokio::test]
    async fn middleware_usage_counts_follow_routes() {
        let t = test_plane();
        let ctx = OperationContext::new("alice");
        t.plane.create_service(&ctx, service("api")).await.unwrap();
        t.plane
            .create_middleware(
                &ctx,
                NewMiddleware {
                    name: "strip".into(),
                    kind: MiddlewareType::StripPrefix,
                    config: serde_json::json!({ "prefixes": ["/api"] }),
                },
            )
            .await
            .unwrap();
        let mut route = new_route("web", "Host(`web.example.com`)", "api", 0);
        route.middleware_refs = vec!["strip".into()];
        t.plane.create_route(&ctx, route, false).await.unwrap();

        let mw = t.plane.repository().get_middleware("strip").await.unwrap();
        assert_eq!(mw.usage_count, 1);
        let err = t.plane.delete_middleware(&ctx, "strip", false).await.unwrap_err();
        assert!(matches!(err, ControlError::ReferentialConflict { .. }));
    }

    #[tokio::test]
    async fn noop_update_does_not_publish() {
        let t = test_plane();
        let ctx = OperationContext::new("alice");
        t.plane.create_service(&ctx, service("api")).await.unwrap();
        t.plane
            .create_route(&ctx, new_route("web", "Host(`web.example.com`)", "api", 0), false)
            .await
            .unwrap();
        let before = t.store.list_snapshots().await.unwrap().len();
        let applied = t
            .plane
            .update_route(
                &ctx,
                "web",
                UpdateRoute {
                    priority: Some(0),
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap();
        assert!(applied.publish.is_none());
        assert_eq!(t.store.list_snapshots().await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn restore_returns_to_captured_state() {
        let t = test_plane();
        let ctx = OperationContext::new("alice");
        t.plane.create_service(&ctx, service("api")).await.unwrap();
        let snap = t.plane.capture_snapshot(&ctx, "baseline").await.unwrap();
        let baseline_file = t.publisher.current().await.unwrap();

        t.plane
            .create_route(&ctx, new_route("web", "Host(`web.example.com`)", "api", 0), false)
            .await
            .unwrap();
        let result = t.plane.restore_snapshot(&ctx, snap.id).await.unwrap();
        assert!(result.drift.is_none());
        assert!(t.plane.repository().get_route("web").await.is_err());
        assert_eq!(t.publisher.current().await.unwrap(), baseline_file);

        let audit = t.plane.audit(5).await.unwrap();
        assert_eq!(audit[0].action, audit_action::RESTORE);
        assert_eq!(audit[0].result, audit_result::RESTORED);
    }

    #[tokio::test]
    async fn health_reports_store_state() {
        let t = test_plane();
        let health = t.plane.health().await;
        assert_eq!(health.status, "ok");
        assert!(health.last_publish.is_none());
    }
}
