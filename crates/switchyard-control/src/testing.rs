//! Fixtures shared by the in-crate tests.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use switchyard_telemetry::MetricsRegistry;
use uuid::Uuid;

use crate::db::{
    BackendTarget, ConfigState, Middleware, MiddlewareType, NewRoute, Route, RouteSource,
    RouteStatus, Service, ServiceStatus, ServiceType,
};
use crate::db::MemoryStore;
use crate::health::{HealthPolicy, ProbeTarget, ProxyProbe};
use crate::plane::{ControlPlane, PlaneSettings};
use crate::publisher::AtomicPublisher;
use crate::renderer::RenderSettings;

pub fn http_service(name: &str) -> Service {
    let now = Utc::now();
    Service {
        id: Uuid::now_v7(),
        name: name.into(),
        kind: ServiceType::Http,
        backend_targets: vec![BackendTarget {
            url: format!("http://{name}:8080"),
            weight: 1,
        }],
        health_check: None,
        status: ServiceStatus::Active,
        created_at: now,
        updated_at: now,
    }
}

pub fn tcp_service(name: &str) -> Service {
    Service {
        kind: ServiceType::Tcp,
        backend_targets: vec![BackendTarget {
            url: format!("{name}:5432"),
            weight: 1,
        }],
        ..http_service(name)
    }
}

pub fn route(name: &str, rule: &str, service: &str, priority: i32) -> Route {
    let now = Utc::now();
    Route {
        id: Uuid::now_v7(),
        name: name.into(),
        rule: rule.into(),
        service_ref: service.into(),
        priority,
        entrypoints: vec![],
        tls_enabled: false,
        middleware_refs: vec![],
        status: RouteStatus::Active,
        source: RouteSource::Manual,
        metadata: serde_json::json!({}),
        created_at: now,
        created_by: "test".into(),
        updated_at: now,
    }
}

pub fn new_route(name: &str, rule: &str, service: &str, priority: i32) -> NewRoute {
    NewRoute {
        name: name.into(),
        rule: rule.into(),
        service_ref: service.into(),
        priority,
        entrypoints: vec![],
        tls_enabled: false,
        middleware_refs: vec![],
        status: RouteStatus::Active,
        metadata: serde_json::json!({}),
    }
}

pub fn middleware(name: &str, kind: MiddlewareType, config: serde_json::Value) -> Middleware {
    let now = Utc::now();
    Middleware {
        id: Uuid::now_v7(),
        name: name.into(),
        kind,
        config,
        usage_count: 0,
        created_at: now,
        updated_at: now,
    }
}

pub fn state(routes: Vec<Route>, services: Vec<Service>, middlewares: Vec<Middleware>) -> ConfigState {
    let mut state = ConfigState {
        routes,
        services,
        middlewares,
    };
    state.sort();
    state
}

/// Probe whose answers are scripted by the test.
pub struct ScriptedProbe {
    /// Remaining health failures; negative means fail forever.
    failures_left: AtomicI64,
    health_calls: AtomicU32,
}

impl ScriptedProbe {
    pub fn healthy() -> Self {
        Self::failing_times(0)
    }

    pub fn unhealthy() -> Self {
        Self::failing_times(-1)
    }

    pub fn failing_times(n: i64) -> Self {
        Self {
            failures_left: AtomicI64::new(n),
            health_calls: AtomicU32::new(0),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.failures_left
            .store(if healthy { 0 } else { -1 }, Ordering::SeqCst);
    }

    pub fn health_calls(&self) -> u32 {
        self.health_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxyProbe for ScriptedProbe {
    async fn health(&self) -> Result<(), String> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left == 0 {
            return Ok(());
        }
        if left > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
        }
        Err("proxy returned 503".into())
    }

    async fn router_loaded(&self, _target: &ProbeTarget) -> Result<(), String> {
        Ok(())
    }
}

/// A control plane over the in-memory store and a temp directory.
pub struct TestPlane {
    pub plane: Arc<ControlPlane>,
    pub store: Arc<MemoryStore>,
    pub probe: Arc<ScriptedProbe>,
    pub publisher: AtomicPublisher,
    /// Holds the live file's directory until the plane is dropped.
    _dir: tempfile::TempDir,
}

pub fn quick_health_policy() -> HealthPolicy {
    HealthPolicy {
        attempts: 3,
        initial_backoff: Duration::from_millis(2),
        max_backoff: Duration::from_millis(10),
        budget: Duration::from_secs(5),
        settle: Duration::ZERO,
    }
}

pub fn test_plane() -> TestPlane {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let probe = Arc::new(ScriptedProbe::healthy());
    let publisher = AtomicPublisher::new(dir.path().join("switchyard.yml"));
    let plane = ControlPlane::new(
        store.clone(),
        probe.clone(),
        PlaneSettings {
            live_path: publisher.path().to_path_buf(),
            render: RenderSettings {
                default_entrypoints: vec!["websecure".into()],
                cert_resolver: Some("letsencrypt".into()),
            },
            health: quick_health_policy(),
            snapshot_retention: 50,
        },
        Arc::new(MetricsRegistry::new()),
    );
    TestPlane {
        plane: Arc::new(plane),
        store,
        probe,
        publisher,
        _dir: dir,
    }
}
