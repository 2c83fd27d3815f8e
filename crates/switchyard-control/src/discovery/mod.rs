//! Label-driven service auto-discovery.
//!
//! Each cycle lists containers, turns their labels into [`RouteIntent`]s and
//! reconciles the auto-discovered routes against them through the same
//! planners operator writes use. One cycle commits as one publish.

mod labels;
mod runtime;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use switchyard_telemetry::MetricsRegistry;
use tokio::sync::broadcast;

pub use labels::{is_enabled, parse_labels, DeclaredRoute, DeclaredService, RouteIntent};
pub use runtime::{ContainerInfo, ContainerRuntime, DockerApiRuntime};

use crate::context::OperationContext;
use crate::db::{
    BackendTarget, ConfigState, NewRoute, NewService, Route, RouteSource, RouteStatus,
    ServiceStatus, ServiceType, UpdateRoute,
};
use crate::error::ControlError;
use crate::orchestrator::{Applied, Orchestrator};
use crate::repository::{
    conflict_records, plan_create_route, plan_create_service, plan_update_route, Plan,
};

/// Route metadata key naming the container a route came from.
pub const CONTAINER_KEY: &str = "container";

/// A declared route that was not applied as asked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlaggedRoute {
    pub container: String,
    pub router: String,
    pub reason: String,
}

/// Outcome of one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub disabled: Vec<String>,
    pub services_created: Vec<String>,
    pub flagged: Vec<FlaggedRoute>,
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub label_prefix: String,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            label_prefix: "traefik".to_string(),
        }
    }
}

/// Builds the cycle's plan against a working copy of `state`, so each step
/// sees the ones before it.
struct Reconciler<'a> {
    working: ConfigState,
    plan: Plan<DiscoveryReport>,
    actor: &'a str,
}

impl<'a> Reconciler<'a> {
    fn new(state: &ConfigState, actor: &'a str) -> Self {
        Self {
            working: state.clone(),
            plan: Plan::new(DiscoveryReport::default()),
            actor,
        }
    }

    fn commit<T>(&mut self, step: Plan<T>) -> T {
        self.working.apply_changes(&step.changes);
        self.plan.absorb(step)
    }

    fn flag(&mut self, container: &str, router: &str, reason: impl Into<String>) {
        self.plan.value.flagged.push(FlaggedRoute {
            container: container.to_string(),
            router: router.to_string(),
            reason: reason.into(),
        });
    }

    fn ensure_service(&mut self, declared: &DeclaredService) -> Result<(), ControlError> {
        if self.working.service_by_name(&declared.name).is_some() {
            return Ok(());
        }
        let step = plan_create_service(
            &self.working,
            NewService {
                name: declared.name.clone(),
                kind: ServiceType::Http,
                backend_targets: vec![BackendTarget {
                    url: declared.url.clone(),
                    weight: 1,
                }],
                health_check: None,
                status: ServiceStatus::Active,
            },
        )?;
        let service = self.commit(step);
        self.plan.value.services_created.push(service.name);
        Ok(())
    }

    fn desired(route: &DeclaredRoute, status: RouteStatus) -> NewRoute {
        NewRoute {
            name: route.router.clone(),
            rule: route.rule.clone(),
            service_ref: route.service.clone(),
            priority: route.priority,
            entrypoints: route.entrypoints.clone(),
            tls_enabled: route.tls,
            middleware_refs: route.middlewares.clone(),
            status,
            metadata: serde_json::json!({ CONTAINER_KEY: route.container }),
        }
    }

    fn reconcile(&mut self, declared: &DeclaredRoute) {
        if let Some(service) = &declared.declared_service {
            if let Err(e) = self.ensure_service(service) {
                self.flag(&declared.container, &declared.router, e.to_string());
                return;
            }
        }
        match self.working.route_by_name(&declared.router).cloned() {
            Some(existing) if existing.source == RouteSource::Manual => self.flag(
                &declared.container,
                &declared.router,
                "name is taken by a manually managed route",
            ),
            Some(existing) => self.update(existing, declared),
            None => self.create(declared),
        }
    }

    fn create(&mut self, declared: &DeclaredRoute) {
        let new = Self::desired(declared, RouteStatus::Active);
        match plan_create_route(&self.working, new, self.actor, RouteSource::AutoDiscovered, false) {
            Ok(step) => {
                let route = self.commit(step);
                self.plan.value.created.push(route.name);
            }
            Err(ControlError::Conflict(report)) => {
                let parked = Self::desired(declared, RouteStatus::Conflict);
                match plan_create_route(
                    &self.working,
                    parked,
                    self.actor,
                    RouteSource::AutoDiscovered,
                    false,
                ) {
                    Ok(step) => {
                        let route = self.commit(step);
                        self.record_conflicts(&route, &report);
                        self.plan.value.created.push(route.name);
                        self.flag(&declared.container, &declared.router, conflict_reason(&report));
                    }
                    Err(e) => self.flag(&declared.container, &declared.router, e.to_string()),
                }
            }
            Err(e) => self.flag(&declared.container, &declared.router, e.to_string()),
        }
    }

    fn update(&mut self, existing: Route, declared: &DeclaredRoute) {
        let desired = Self::desired(declared, RouteStatus::Active);
        let update = |status: RouteStatus| UpdateRoute {
            name: None,
            rule: Some(desired.rule.clone()),
            service_ref: Some(desired.service_ref.clone()),
            priority: Some(desired.priority),
            entrypoints: Some(desired.entrypoints.clone()),
            tls_enabled: Some(desired.tls_enabled),
            middleware_refs: Some(desired.middleware_refs.clone()),
            status: Some(status),
            metadata: Some(desired.metadata.clone()),
        };

        let active = plan_update_route(&self.working, existing.id, update(RouteStatus::Active), false);
        let outcome = match active {
            Err(ControlError::Conflict(report)) => {
                plan_update_route(&self.working, existing.id, update(RouteStatus::Conflict), false)
                    .map(|step| (step, Some(report)))
            }
            other => other.map(|step| (step, None)),
        };
        match outcome {
            Ok((step, conflict)) => {
                let changed = !step.is_noop();
                let route = self.commit(step);
                if let Some(report) = conflict {
                    if changed {
                        self.record_conflicts(&route, &report);
                    }
                    self.flag(&declared.container, &declared.router, conflict_reason(&report));
                }
                if changed {
                    self.plan.value.updated.push(route.name);
                } else {
                    self.plan.value.unchanged.push(route.name);
                }
            }
            Err(e) => self.flag(&declared.container, &declared.router, e.to_string()),
        }
    }

    fn record_conflicts(&mut self, route: &Route, report: &switchyard_rules::ConflictReport) {
        self.plan.conflicts.extend(conflict_records(
            report,
            &self.working,
            Some(route.id),
            chrono::Utc::now(),
        ));
    }

    /// Disable auto-discovered routes nobody declares any more.
    fn disable_vanished(&mut self, declared: &BTreeSet<String>) {
        let stale: Vec<Route> = self
            .working
            .routes
            .iter()
            .filter(|r| r.source == RouteSource::AutoDiscovered)
            .filter(|r| r.status != RouteStatus::Disabled)
            .filter(|r| !declared.contains(&r.name))
            .cloned()
            .collect();
        for route in stale {
            let disable = UpdateRoute {
                status: Some(RouteStatus::Disabled),
                ..Default::default()
            };
            match plan_update_route(&self.working, route.id, disable, false) {
                Ok(step) => {
                    let route = self.commit(step);
                    self.plan.value.disabled.push(route.name);
                }
                Err(e) => tracing::warn!(route = %route.name, error = %e, "failed to disable vanished route"),
            }
        }
    }
}

fn conflict_reason(report: &switchyard_rules::ConflictReport) -> String {
    let others: Vec<&str> = report.errors.iter().map(|c| c.route_b.as_str()).collect();
    format!("conflicts with {}", others.join(", "))
}

/// Plan one reconciliation cycle. Pure; flagged routes never fail the cycle.
pub fn plan_discovery(
    state: &ConfigState,
    containers: &[ContainerInfo],
    settings: &DiscoverySettings,
    actor: &str,
) -> Result<Plan<DiscoveryReport>, ControlError> {
    let mut reconciler = Reconciler::new(state, actor);

    let mut intents: Vec<RouteIntent> = containers
        .iter()
        .filter(|c| c.is_running() && is_enabled(c, &settings.label_prefix))
        .flat_map(|c| parse_labels(c, &settings.label_prefix))
        .collect();
    intents.sort_by(|a, b| (a.router(), a.container()).cmp(&(b.router(), b.container())));

    let mut claims: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for intent in &intents {
        claims
            .entry(intent.router().to_string())
            .or_default()
            .push(intent.container().to_string());
    }

    let mut declared_names = BTreeSet::new();
    for intent in &intents {
        declared_names.insert(intent.router().to_string());
        match intent {
            RouteIntent::Malformed {
                container,
                router,
                reason,
            } => reconciler.flag(container, router, reason.clone()),
            RouteIntent::Declared(route) => {
                let owners = &claims[&route.router];
                if owners.len() > 1 {
                    reconciler.flag(
                        &route.container,
                        &route.router,
                        format!("router declared by several containers: {}", owners.join(", ")),
                    );
                    continue;
                }
                reconciler.reconcile(route);
            }
        }
    }
    reconciler.disable_vanished(&declared_names);
    Ok(reconciler.plan)
}

/// Runs reconciliation cycles against a container runtime.
pub struct ServiceDiscovery {
    runtime: Arc<dyn ContainerRuntime>,
    orchestrator: Arc<Orchestrator>,
    metrics: Arc<MetricsRegistry>,
    settings: DiscoverySettings,
}

impl ServiceDiscovery {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        orchestrator: Arc<Orchestrator>,
        metrics: Arc<MetricsRegistry>,
        settings: DiscoverySettings,
    ) -> Self {
        Self {
            runtime,
            orchestrator,
            metrics,
            settings,
        }
    }

    pub async fn run_once(&self) -> Result<Applied<DiscoveryReport>, ControlError> {
        let containers = match self.runtime.list_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                self.metrics.record_discovery_run("runtime_error");
                return Err(e);
            }
        };
        let ctx = OperationContext::system("discovery");
        let settings = self.settings.clone();
        let actor = ctx.actor.clone();
        let result = self
            .orchestrator
            .apply(&ctx, "auto-discovery", move |state| {
                plan_discovery(state, &containers, &settings, &actor)
            })
            .await;

        match &result {
            Ok(applied) => {
                for flagged in &applied.data.flagged {
                    switchyard_telemetry::log_discovery_flagged!(
                        container = %flagged.container,
                        router = %flagged.router,
                        reason = %flagged.reason,
                        "discovered route flagged"
                    );
                }
                self.metrics.record_discovery_run(if applied.data.flagged.is_empty() {
                    "clean"
                } else {
                    "flagged"
                });
                tracing::info!(
                    created = applied.data.created.len(),
                    updated = applied.data.updated.len(),
                    disabled = applied.data.disabled.len(),
                    flagged = applied.data.flagged.len(),
                    "discovery cycle finished"
                );
            }
            Err(e) => {
                self.metrics.record_discovery_run("failed");
                tracing::error!(error = %e, "discovery cycle failed");
            }
        }
        result
    }

    /// Reconcile on `interval` until shutdown.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Failures are logged and counted by run_once.
                    let _ = self.run_once().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("service discovery stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ConfigStore;
    use crate::testing::{http_service, route, state, test_plane};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    fn container(name: &str, labels: &[(&str, &str)]) -> ContainerInfo {
        ContainerInfo {
            id: format!("{name}-id"),
            name: name.into(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            state: "running".into(),
        }
    }

    fn shop(rule: &str, priority: &str) -> ContainerInfo {
        container(
            "shop",
            &[
                ("traefik.enable", "true"),
                ("traefik.http.routers.shop.rule", rule),
                ("traefik.http.routers.shop.priority", priority),
                ("traefik.http.services.shop.loadbalancer.server.port", "8080"),
            ],
        )
    }

    #[test]
    fn new_containers_create_routes_and_services() {
        let plan = plan_discovery(
            &ConfigState::default(),
            &[shop("Host(`shop.example.com`)", "1")],
            &DiscoverySettings::default(),
            "system:discovery",
        )
        .unwrap();
        assert_eq!(plan.value.created, vec!["shop"]);
        assert_eq!(plan.value.services_created, vec!["shop"]);
        assert!(plan.value.flagged.is_empty());
        assert_eq!(plan.changes.len(), 2);
        assert_eq!(plan.touched, vec!["shop"]);
    }

    #[test]
    fn disabled_or_stopped_containers_are_ignored() {
        let mut stopped = shop("Host(`shop.example.com`)", "1");
        stopped.state = "exited".into();
        let mut opted_out = shop("Host(`shop.example.com`)", "1");
        opted_out.labels.insert("traefik.enable".into(), "false".into());
        let plan = plan_discovery(
            &ConfigState::default(),
            &[stopped, opted_out],
            &DiscoverySettings::default(),
            "system:discovery",
        )
        .unwrap();
        assert!(plan.is_noop());
    }

    #[test]
    fn conflicting_declaration_is_parked_and_flagged() {
        let existing = state(
            vec![route("storefront", "Host(`shop.example.com`)", "api", 1)],
            vec![http_service("api")],
            vec![],
        );
        let plan = plan_discovery(
            &existing,
            &[shop("Host(`shop.example.com`)", "1")],
            &DiscoverySettings::default(),
            "system:discovery",
        )
        .unwrap();
        assert_eq!(plan.value.flagged.len(), 1);
        assert!(plan.value.flagged[0].reason.contains("storefront"));
        let mut after = existing.clone();
        after.apply_changes(&plan.changes);
        assert_eq!(after.route_by_name("shop").unwrap().status, RouteStatus::Conflict);
        assert!(!plan.conflicts.is_empty());
    }

    #[test]
    fn manual_route_names_are_never_taken_over() {
        let existing = state(
            vec![route("shop", "Host(`other.example.com`)", "api", 1)],
            vec![http_service("api")],
            vec![],
        );
        let plan = plan_discovery(
            &existing,
            &[shop("Host(`shop.example.com`)", "1")],
            &DiscoverySettings::default(),
            "system:discovery",
        )
        .unwrap();
        assert_eq!(plan.value.flagged.len(), 1);
        assert!(plan.value.created.is_empty());
        assert!(plan
            .changes
            .iter()
            .all(|c| !matches!(c, crate::db::Change::PutRoute(_))));
    }

    #[test]
    fn duplicate_router_names_across_containers_are_flagged() {
        let a = shop("Host(`a.example.com`)", "1");
        let mut b = shop("Host(`b.example.com`)", "1");
        b.name = "shop-2".into();
        let plan = plan_discovery(
            &ConfigState::default(),
            &[a, b],
            &DiscoverySettings::default(),
            "system:discovery",
        )
        .unwrap();
        assert_eq!(plan.value.flagged.len(), 2);
        assert!(plan.value.created.is_empty());
    }

    struct FakeRuntime(Mutex<Vec<ContainerInfo>>);

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn list_containers(&self) -> Result<Vec<ContainerInfo>, ControlError> {
            Ok(self.0.lock().clone())
        }
    }

    #[tokio::test]
    async fn cycles_update_then_disable_vanished_routes() {
        let t = test_plane();
        let runtime = Arc::new(FakeRuntime(Mutex::new(vec![shop(
            "Host(`shop.example.com`)",
            "1",
        )])));
        let discovery = ServiceDiscovery::new(
            runtime.clone(),
            t.plane.orchestrator().clone(),
            t.plane.metrics().clone(),
            DiscoverySettings::default(),
        );

        let first = discovery.run_once().await.unwrap();
        assert_eq!(first.data.created, vec!["shop"]);
        assert!(first.publish.is_some());

        let second = discovery.run_once().await.unwrap();
        assert_eq!(second.data.unchanged, vec!["shop"]);
        assert!(second.publish.is_none());

        *runtime.0.lock() = vec![shop("Host(`shop.example.com`)", "5")];
        let third = discovery.run_once().await.unwrap();
        assert_eq!(third.data.updated, vec!["shop"]);
        assert_eq!(t.store.load_state().await.unwrap().route_by_name("shop").unwrap().priority, 5);

        runtime.0.lock().clear();
        let fourth = discovery.run_once().await.unwrap();
        assert_eq!(fourth.data.disabled, vec!["shop"]);
        let route = t.plane.repository().get_route("shop").await.unwrap();
        assert_eq!(route.status, RouteStatus::Disabled);
        assert_eq!(route.source, RouteSource::AutoDiscovered);
        let live = t.publisher.current().await.unwrap().unwrap();
        assert!(!live.contains("shop.example.com"));
    }
}
