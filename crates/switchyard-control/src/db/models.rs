//! Database models for the control plane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use switchyard_rules::{ConflictKind, Severity};
use uuid::Uuid;

/// Lifecycle status of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "route_status", rename_all = "snake_case")]
pub enum RouteStatus {
    Active,
    Disabled,
    Pending,
    Conflict,
}

impl RouteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
            Self::Pending => "pending",
            Self::Conflict => "conflict",
        }
    }
}

/// Where a route came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "route_source", rename_all = "snake_case")]
pub enum RouteSource {
    Manual,
    AutoDiscovered,
}

/// A routing rule mapped to a backend service.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Route {
    pub id: Uuid,
    pub name: String,
    pub rule: String,
    pub service_ref: String,
    pub priority: i32,
    pub entrypoints: Vec<String>,
    pub tls_enabled: bool,
    pub middleware_refs: Vec<String>,
    pub status: RouteStatus,
    pub source: RouteSource,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
}

impl Route {
    pub fn is_active(&self) -> bool {
        self.status == RouteStatus::Active
    }
}

/// Input for creating a route.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewRoute {
    pub name: String,
    pub rule: String,
    pub service_ref: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub entrypoints: Vec<String>,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default)]
    pub middleware_refs: Vec<String>,
    #[serde(default = "default_route_status")]
    pub status: RouteStatus,
    #[serde(default = "default_metadata")]
    pub metadata: serde_json::Value,
}

fn default_route_status() -> RouteStatus {
    RouteStatus::Active
}

fn default_metadata() -> serde_json::Value {
    serde_json::json!({})
}

/// Input for updating a route.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UpdateRoute {
    pub name: Option<String>,
    pub rule: Option<String>,
    pub service_ref: Option<String>,
    pub priority: Option<i32>,
    pub entrypoints: Option<Vec<String>>,
    pub tls_enabled: Option<bool>,
    pub middleware_refs: Option<Vec<String>>,
    pub status: Option<RouteStatus>,
    pub metadata: Option<serde_json::Value>,
}

/// Protocol family of a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "service_type", rename_all = "snake_case")]
pub enum ServiceType {
    #[default]
    Http,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "service_status", rename_all = "snake_case")]
pub enum ServiceStatus {
    Active,
    Disabled,
}

/// One upstream of a service load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendTarget {
    /// `http(s)://host:port` for http services, `host:port` for tcp services.
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Active health check the proxy runs against a service's targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub path: String,
    #[serde(default = "default_health_interval")]
    pub interval: String,
}

fn default_health_interval() -> String {
    "10s".to_string()
}

/// A backend service.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    #[sqlx(rename = "service_type")]
    pub kind: ServiceType,
    #[sqlx(json)]
    pub backend_targets: Vec<BackendTarget>,
    #[sqlx(json)]
    pub health_check: Option<HealthCheck>,
    pub status: ServiceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewService {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ServiceType,
    pub backend_targets: Vec<BackendTarget>,
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
    #[serde(default = "default_service_status")]
    pub status: ServiceStatus,
}

fn default_service_status() -> ServiceStatus {
    ServiceStatus::Active
}

/// Input for updating a service.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UpdateService {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<ServiceType>,
    pub backend_targets: Option<Vec<BackendTarget>>,
    /// `Some(None)` clears the health check.
    #[serde(default, with = "double_option", skip_serializing_if = "Option::is_none")]
    pub health_check: Option<Option<HealthCheck>>,
    pub status: Option<ServiceStatus>,
}

mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T: Serialize, S: Serializer>(
        value: &Option<Option<T>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "middleware_type", rename_all = "snake_case")]
pub enum MiddlewareType {
    RateLimit,
    Headers,
    BasicAuth,
    StripPrefix,
    AddPrefix,
    RedirectScheme,
    Compress,
    IpAllowList,
    Retry,
    CircuitBreaker,
}

impl MiddlewareType {
    /// Key of this middleware in the proxy's dynamic configuration.
    pub fn proxy_key(&self) -> &'static str {
        match self {
            Self::RateLimit => "rateLimit",
            Self::Headers => "headers",
            Self::BasicAuth => "basicAuth",
            Self::StripPrefix => "stripPrefix",
            Self::AddPrefix => "addPrefix",
            Self::RedirectScheme => "redirectScheme",
            Self::Compress => "compress",
            Self::IpAllowList => "ipAllowList",
            Self::Retry => "retry",
            Self::CircuitBreaker => "circuitBreaker",
        }
    }

    /// Config keys that must be present for this type.
    pub fn required_keys(&self) -> &'static [&'static str] {
        match self {
            Self::RateLimit => &["average"],
            Self::BasicAuth => &["users"],
            Self::StripPrefix => &["prefixes"],
            Self::AddPrefix => &["prefix"],
            Self::RedirectScheme => &["scheme"],
            Self::IpAllowList => &["sourceRange"],
            Self::Retry => &["attempts"],
            Self::CircuitBreaker => &["expression"],
            Self::Headers | Self::Compress => &[],
        }
    }
}

/// A reusable request/response transform attached to routes by name.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Middleware {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    #[sqlx(rename = "middleware_type")]
    pub kind: MiddlewareType,
    pub config: serde_json::Value,
    /// Number of active routes referencing this middleware. Derived, never stored.
    #[sqlx(skip)]
    #[serde(default)]
    pub usage_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a middleware.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewMiddleware {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: MiddlewareType,
    #[serde(default = "default_metadata")]
    pub config: serde_json::Value,
}

/// Input for updating a middleware.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UpdateMiddleware {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<MiddlewareType>,
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "certificate_status", rename_all = "snake_case")]
pub enum CertificateStatus {
    Valid,
    Expiring,
    Expired,
    Pending,
}

impl CertificateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Expiring => "expiring",
            Self::Expired => "expired",
            Self::Pending => "pending",
        }
    }

    /// Statuses an operator should be told about.
    pub fn needs_attention(&self) -> bool {
        matches!(self, Self::Expiring | Self::Expired)
    }
}

/// Observed TLS certificate state for a domain.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Certificate {
    pub domain: String,
    pub resolver: String,
    pub status: CertificateStatus,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_checked_at: DateTime<Utc>,
}

/// Routes, services and middlewares as one consistent unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigState {
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub middlewares: Vec<Middleware>,
}

impl ConfigState {
    pub fn route(&self, id: Uuid) -> Option<&Route> {
        self.routes.iter().find(|r| r.id == id)
    }

    pub fn route_by_name(&self, name: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.name == name)
    }

    pub fn service(&self, id: Uuid) -> Option<&Service> {
        self.services.iter().find(|s| s.id == id)
    }

    pub fn service_by_name(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn middleware(&self, id: Uuid) -> Option<&Middleware> {
        self.middlewares.iter().find(|m| m.id == id)
    }

    pub fn middleware_by_name(&self, name: &str) -> Option<&Middleware> {
        self.middlewares.iter().find(|m| m.name == name)
    }

    pub fn active_routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter().filter(|r| r.is_active())
    }

    /// Apply a batch of changes in order. Mirrors what a store commit does.
    pub fn apply_changes(&mut self, changes: &[Change]) {
        for change in changes {
            match change {
                Change::PutRoute(route) => upsert(&mut self.routes, route.clone(), |r| r.id),
                Change::DeleteRoute(id) => self.routes.retain(|r| r.id != *id),
                Change::PutService(service) => {
                    upsert(&mut self.services, service.clone(), |s| s.id)
                }
                Change::DeleteService(id) => self.services.retain(|s| s.id != *id),
                Change::PutMiddleware(middleware) => {
                    upsert(&mut self.middlewares, middleware.clone(), |m| m.id)
                }
                Change::DeleteMiddleware(id) => self.middlewares.retain(|m| m.id != *id),
            }
        }
        self.sort();
    }

    /// Order every collection by name so equal states compare equal.
    pub fn sort(&mut self) {
        self.routes.sort_by(|a, b| a.name.cmp(&b.name));
        self.services.sort_by(|a, b| a.name.cmp(&b.name));
        self.middlewares.sort_by(|a, b| a.name.cmp(&b.name));
    }

    /// Fill in `usage_count` on every middleware from the active routes.
    pub fn with_usage_counts(mut self) -> Self {
        for middleware in &mut self.middlewares {
            middleware.usage_count = self
                .routes
                .iter()
                .filter(|r| r.is_active() && r.middleware_refs.contains(&middleware.name))
                .count() as i64;
        }
        self
    }
}

fn upsert<T>(items: &mut Vec<T>, item: T, key: impl Fn(&T) -> Uuid) {
    let id = key(&item);
    match items.iter_mut().find(|existing| key(existing) == id) {
        Some(slot) => *slot = item,
        None => items.push(item),
    }
}

/// One row-level change in a repository write batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    PutRoute(Route),
    DeleteRoute(Uuid),
    PutService(Service),
    DeleteService(Uuid),
    PutMiddleware(Middleware),
    DeleteMiddleware(Uuid),
}

/// A point-in-time copy of the configuration and the document that was live.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub id: Uuid,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub is_automatic: bool,
    #[sqlx(json)]
    pub config_data: ConfigState,
    pub rendered_file_content: Option<String>,
    pub checksum: Option<String>,
    pub restored_at: Option<DateTime<Utc>>,
}

impl ConfigSnapshot {
    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            id: self.id,
            label: self.label.clone(),
            created_at: self.created_at,
            created_by: self.created_by.clone(),
            is_automatic: self.is_automatic,
            checksum: self.checksum.clone(),
            restored_at: self.restored_at,
            route_count: self.config_data.routes.len(),
        }
    }
}

/// Snapshot listing entry without the config payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotSummary {
    pub id: Uuid,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub is_automatic: bool,
    pub checksum: Option<String>,
    pub restored_at: Option<DateTime<Utc>>,
    pub route_count: usize,
}

/// A detected conflict, persisted for history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConflict {
    pub id: Uuid,
    pub route_a: String,
    pub route_b: String,
    /// Unset when the route was a rejected draft that never got stored.
    pub route_id_a: Option<Uuid>,
    pub route_id_b: Option<Uuid>,
    pub kind: ConflictKind,
    pub severity: Severity,
    pub message: String,
    pub resolved: bool,
    pub detected_at: DateTime<Utc>,
}

/// Audit log entity types.
pub mod entity_type {
    pub const ROUTE: &str = "route";
    pub const SERVICE: &str = "service";
    pub const MIDDLEWARE: &str = "middleware";
    pub const SNAPSHOT: &str = "snapshot";
    pub const CONFIG: &str = "config";
    pub const CERTIFICATE: &str = "certificate";
}

/// Audit log actions.
pub mod audit_action {
    pub const CREATE: &str = "create";
    pub const UPDATE: &str = "update";
    pub const DELETE: &str = "delete";
    pub const PUBLISH: &str = "publish";
    pub const RESTORE: &str = "restore";
    pub const IMPORT: &str = "import";
    pub const CAPTURE: &str = "capture";
    pub const DISABLE: &str = "disable";
}

/// Audit log outcomes.
pub mod audit_result {
    pub const APPLIED: &str = "applied";
    pub const PUBLISHED: &str = "published";
    pub const ROLLED_BACK: &str = "rolled_back";
    pub const REJECTED: &str = "rejected";
    pub const FAILED: &str = "failed";
    pub const CASCADE: &str = "cascade";
    pub const RESTORED: &str = "restored";
    pub const DRIFT: &str = "drift";
}

/// Append-only audit record.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    pub entity_name: String,
    pub action: String,
    pub diff: serde_json::Value,
    pub actor: String,
    pub source_ip: Option<String>,
    pub success: bool,
    pub result: String,
    pub created_at: DateTime<Utc>,
}
