//! Transactional repository API over routes, services and middlewares.
//!
//! Writes are planned against a loaded [`ConfigState`]: a planner validates the
//! request, runs the conflict detector, and returns a [`Plan`] holding every row
//! change and audit record. Nothing is written until the orchestrator commits
//! the plan, so a rejected request never leaves partial state behind.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchyard_rules::{ConflictDetector, ConflictReport, RouteSpec, RuleMatch};
use uuid::Uuid;

use crate::context::AuditDraft;
use crate::db::{
    audit_action, audit_result, entity_type, BackendTarget, Change, ConfigState, ConfigStore,
    HealthCheck, Middleware, MiddlewareType, NewMiddleware, NewRoute, NewService, Route,
    RouteConflict, RouteSource, RouteStatus, Service, ServiceStatus, ServiceType,
    UpdateMiddleware, UpdateRoute, UpdateService,
};
use crate::error::ControlError;

const MAX_NAME_LEN: usize = 128;

/// A validated write, ready to commit.
#[derive(Debug, Clone)]
pub struct Plan<T> {
    /// What the caller gets back on success.
    pub value: T,
    pub changes: Vec<Change>,
    pub audits: Vec<AuditDraft>,
    /// Active routes whose routers must be confirmed after publishing.
    pub touched: Vec<String>,
    /// Warnings (and forced errors) from the conflict detector.
    pub report: ConflictReport,
    pub conflicts: Vec<RouteConflict>,
}

impl<T> Plan<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            changes: Vec::new(),
            audits: Vec::new(),
            touched: Vec::new(),
            report: ConflictReport::default(),
            conflicts: Vec::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Plan<U> {
        Plan {
            value: f(self.value),
            changes: self.changes,
            audits: self.audits,
            touched: self.touched,
            report: self.report,
            conflicts: self.conflicts,
        }
    }

    /// Append another plan's effects, keeping this plan's value.
    pub fn absorb<U>(&mut self, other: Plan<U>) -> U {
        self.changes.extend(other.changes);
        self.audits.extend(other.audits);
        for name in other.touched {
            if !self.touched.contains(&name) {
                self.touched.push(name);
            }
        }
        self.report.merge(other.report);
        self.conflicts.extend(other.conflicts);
        other.value
    }
}

// --- validation -------------------------------------------------------------

/// Names are non-empty, at most 128 chars of `[A-Za-z0-9_.-]`.
pub fn validate_name(kind: &str, name: &str) -> Result<(), ControlError> {
    if name.is_empty() {
        return Err(ControlError::Validation(format!("{kind} name must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ControlError::Validation(format!(
            "{kind} name '{name}' exceeds {MAX_NAME_LEN} characters"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
    {
        return Err(ControlError::Validation(format!(
            "{kind} name '{name}' contains invalid character '{bad}'"
        )));
    }
    Ok(())
}

fn validate_targets(kind: ServiceType, targets: &[BackendTarget]) -> Result<(), ControlError> {
    if targets.is_empty() {
        return Err(ControlError::Validation(
            "service needs at least one backend target".into(),
        ));
    }
    for target in targets {
        match kind {
            ServiceType::Http => {
                let url = reqwest::Url::parse(&target.url).map_err(|e| {
                    ControlError::Validation(format!("invalid target url '{}': {e}", target.url))
                })?;
                if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
                    return Err(ControlError::Validation(format!(
                        "target url '{}' must be http(s)://host[:port]",
                        target.url
                    )));
                }
            }
            ServiceType::Tcp => {
                let valid = target
                    .url
                    .rsplit_once(':')
                    .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
                if !valid {
                    return Err(ControlError::Validation(format!(
                        "tcp target '{}' must be host:port",
                        target.url
                    )));
                }
            }
        }
    }
    Ok(())
}

fn validate_health_check(check: Option<&HealthCheck>) -> Result<(), ControlError> {
    if let Some(check) = check {
        if !check.path.starts_with('/') {
            return Err(ControlError::Validation(format!(
                "health check path '{}' must start with '/'",
                check.path
            )));
        }
    }
    Ok(())
}

fn validate_middleware_config(
    kind: MiddlewareType,
    config: &serde_json::Value,
) -> Result<(), ControlError> {
    let Some(object) = config.as_object() else {
        return Err(ControlError::Validation(
            "middleware config must be a JSON object".into(),
        ));
    };
    let missing: Vec<&str> = kind
        .required_keys()
        .iter()
        .copied()
        .filter(|key| !object.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        return Err(ControlError::Validation(format!(
            "{} middleware requires key(s): {}",
            kind.proxy_key(),
            missing.join(", ")
        )));
    }
    Ok(())
}

fn validate_rule(rule: &str) -> Result<RuleMatch, ControlError> {
    Ok(RuleMatch::parse(rule)?)
}

/// Check a route's references against the state it will live in.
fn validate_route_refs(state: &ConfigState, route: &Route) -> Result<(), ControlError> {
    let service = state.service_by_name(&route.service_ref).ok_or_else(|| {
        ControlError::Validation(format!(
            "route '{}' references unknown service '{}'",
            route.name, route.service_ref
        ))
    })?;
    for name in &route.middleware_refs {
        if state.middleware_by_name(name).is_none() {
            return Err(ControlError::Validation(format!(
                "route '{}' references unknown middleware '{name}'",
                route.name
            )));
        }
    }
    if route.is_active() && service.status == ServiceStatus::Disabled {
        return Err(ControlError::Validation(format!(
            "route '{}' cannot be active on disabled service '{}'",
            route.name, service.name
        )));
    }
    for entrypoint in &route.entrypoints {
        validate_name("entrypoint", entrypoint)?;
    }
    Ok(())
}

/// Run the per-entity checks of create and update over a whole state, as
/// found in an imported bundle. Names must be unique per kind. References
/// are left to the renderer.
pub fn validate_state(state: &ConfigState) -> Result<(), ControlError> {
    let mut seen = BTreeSet::new();
    for service in &state.services {
        validate_name("service", &service.name)?;
        validate_targets(service.kind, &service.backend_targets)?;
        validate_health_check(service.health_check.as_ref())?;
        if !seen.insert(service.name.as_str()) {
            return Err(ControlError::Validation(format!(
                "duplicate service name '{}'",
                service.name
            )));
        }
    }

    seen.clear();
    for middleware in &state.middlewares {
        validate_name("middleware", &middleware.name)?;
        validate_middleware_config(middleware.kind, &middleware.config)?;
        if !seen.insert(middleware.name.as_str()) {
            return Err(ControlError::Validation(format!(
                "duplicate middleware name '{}'",
                middleware.name
            )));
        }
    }

    seen.clear();
    for route in &state.routes {
        validate_name("route", &route.name)?;
        validate_rule(&route.rule).map_err(|e| {
            ControlError::Validation(format!("route '{}' has an invalid rule: {e}", route.name))
        })?;
        for entrypoint in &route.entrypoints {
            validate_name("entrypoint", entrypoint)?;
        }
        if !seen.insert(route.name.as_str()) {
            return Err(ControlError::Validation(format!(
                "duplicate route name '{}'",
                route.name
            )));
        }
    }
    Ok(())
}

// --- conflicts --------------------------------------------------------------

/// Run the detector for `route` against the other active routes in `state`.
pub fn check_conflicts(state: &ConfigState, route: &Route) -> Result<ConflictReport, ControlError> {
    let detector = ConflictDetector::new(
        state
            .active_routes()
            .filter(|r| r.id != route.id)
            .map(|r| RouteSpec::new(&r.name, &r.rule, r.priority)),
    );
    Ok(detector.check(&RouteSpec::new(&route.name, &route.rule, route.priority))?)
}

/// Pairwise findings over the whole active set.
pub fn scan_conflicts(state: &ConfigState) -> Vec<switchyard_rules::Conflict> {
    ConflictDetector::new(
        state
            .active_routes()
            .map(|r| RouteSpec::new(&r.name, &r.rule, r.priority)),
    )
    .scan()
}

/// History records for a report. `candidate` is the id of `route_a` when known.
pub fn conflict_records(
    report: &ConflictReport,
    state: &ConfigState,
    candidate: Option<Uuid>,
    now: DateTime<Utc>,
) -> Vec<RouteConflict> {
    report
        .all()
        .map(|c| RouteConflict {
            id: Uuid::now_v7(),
            route_a: c.route_a.clone(),
            route_b: c.route_b.clone(),
            route_id_a: candidate.or_else(|| state.route_by_name(&c.route_a).map(|r| r.id)),
            route_id_b: state.route_by_name(&c.route_b).map(|r| r.id),
            kind: c.kind,
            severity: c.severity,
            message: c.message.clone(),
            resolved: false,
            detected_at: now,
        })
        .collect()
}

/// Validate `route` and gate it on the conflict detector.
///
/// Errors block unless `force`; warnings never do.
fn vet_route(
    state: &ConfigState,
    route: &Route,
    force: bool,
    now: DateTime<Utc>,
) -> Result<(ConflictReport, Vec<RouteConflict>), ControlError> {
    validate_name("route", &route.name)?;
    validate_rule(&route.rule)?;
    validate_route_refs(state, route)?;
    if !route.is_active() {
        return Ok((ConflictReport::default(), Vec::new()));
    }
    let report = check_conflicts(state, route)?;
    if !report.valid && !force {
        return Err(ControlError::Conflict(report));
    }
    let records = conflict_records(&report, state, Some(route.id), now);
    Ok((report, records))
}

fn to_json<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// Route fields that matter to the proxy, for change detection.
fn route_shape(route: &Route) -> impl PartialEq + '_ {
    (
        &route.name,
        &route.rule,
        &route.service_ref,
        route.priority,
        &route.entrypoints,
        route.tls_enabled,
        &route.middleware_refs,
        route.status,
        &route.metadata,
    )
}

// --- routes -----------------------------------------------------------------

/// Plan creating a route.
pub fn plan_create_route(
    state: &ConfigState,
    input: NewRoute,
    actor: &str,
    source: RouteSource,
    force: bool,
) -> Result<Plan<Route>, ControlError> {
    let now = Utc::now();
    if state.route_by_name(&input.name).is_some() {
        return Err(ControlError::AlreadyExists(format!("route '{}'", input.name)));
    }
    let route = Route {
        id: Uuid::now_v7(),
        name: input.name,
        rule: input.rule,
        service_ref: input.service_ref,
        priority: input.priority,
        entrypoints: input.entrypoints,
        tls_enabled: input.tls_enabled,
        middleware_refs: input.middleware_refs,
        status: input.status,
        source,
        metadata: input.metadata,
        created_at: now,
        created_by: actor.to_string(),
        updated_at: now,
    };
    let (report, conflicts) = vet_route(state, &route, force, now)?;

    let mut plan = Plan::new(route.clone());
    plan.changes.push(Change::PutRoute(route.clone()));
    plan.audits.push(AuditDraft::new(
        entity_type::ROUTE,
        Some(route.id),
        &route.name,
        audit_action::CREATE,
        serde_json::json!({ "after": to_json(&route) }),
    ));
    if route.is_active() {
        plan.touched.push(route.name.clone());
    }
    plan.report = report;
    plan.conflicts = conflicts;
    Ok(plan)
}

/// Plan updating a route. A request that changes nothing yields an empty plan.
pub fn plan_update_route(
    state: &ConfigState,
    id: Uuid,
    update: UpdateRoute,
    force: bool,
) -> Result<Plan<Route>, ControlError> {
    let now = Utc::now();
    let before = state
        .route(id)
        .ok_or_else(|| ControlError::not_found("route", id))?
        .clone();

    let mut route = before.clone();
    if let Some(name) = update.name {
        if name != before.name && state.route_by_name(&name).is_some() {
            return Err(ControlError::AlreadyExists(format!("route '{name}'")));
        }
        route.name = name;
    }
    if let Some(rule) = update.rule {
        route.rule = rule;
    }
    if let Some(service_ref) = update.service_ref {
        route.service_ref = service_ref;
    }
    if let Some(priority) = update.priority {
        route.priority = priority;
    }
    if let Some(entrypoints) = update.entrypoints {
        route.entrypoints = entrypoints;
    }
    if let Some(tls_enabled) = update.tls_enabled {
        route.tls_enabled = tls_enabled;
    }
    if let Some(middleware_refs) = update.middleware_refs {
        route.middleware_refs = middleware_refs;
    }
    if let Some(status) = update.status {
        route.status = status;
    }
    if let Some(metadata) = update.metadata {
        route.metadata = metadata;
    }

    if route_shape(&route) == route_shape(&before) {
        return Ok(Plan::new(before));
    }
    route.updated_at = now;

    let (report, conflicts) = vet_route(state, &route, force, now)?;

    let mut plan = Plan::new(route.clone());
    plan.changes.push(Change::PutRoute(route.clone()));
    plan.audits.push(AuditDraft::new(
        entity_type::ROUTE,
        Some(route.id),
        &route.name,
        audit_action::UPDATE,
        serde_json::json!({ "before": to_json(&before), "after": to_json(&route) }),
    ));
    if route.is_active() {
        plan.touched.push(route.name.clone());
    }
    plan.report = report;
    plan.conflicts = conflicts;
    Ok(plan)
}

/// Plan deleting a route.
pub fn plan_delete_route(state: &ConfigState, id: Uuid) -> Result<Plan<Route>, ControlError> {
    let route = state
        .route(id)
        .ok_or_else(|| ControlError::not_found("route", id))?
        .clone();
    let mut plan = Plan::new(route.clone());
    plan.changes.push(Change::DeleteRoute(route.id));
    plan.audits.push(AuditDraft::new(
        entity_type::ROUTE,
        Some(route.id),
        &route.name,
        audit_action::DELETE,
        serde_json::json!({ "before": to_json(&route) }),
    ));
    Ok(plan)
}

/// Disable every active route in `dependents`, recording each as a cascade.
fn plan_cascade(
    state: &ConfigState,
    dependents: &[String],
    cause: &str,
) -> Vec<(Change, AuditDraft)> {
    let now = Utc::now();
    dependents
        .iter()
        .filter_map(|name| state.route_by_name(name))
        .map(|route| {
            let mut disabled = route.clone();
            disabled.status = RouteStatus::Disabled;
            disabled.updated_at = now;
            let audit = AuditDraft::new(
                entity_type::ROUTE,
                Some(route.id),
                &route.name,
                audit_action::DISABLE,
                serde_json::json!({ "cause": cause, "before": route.status, "after": disabled.status }),
            )
            .with_result(audit_result::CASCADE);
            (Change::PutRoute(disabled), audit)
        })
        .collect()
}

fn active_dependents(state: &ConfigState, matches: impl Fn(&Route) -> bool) -> Vec<String> {
    state
        .active_routes()
        .filter(|r| matches(r))
        .map(|r| r.name.clone())
        .collect()
}

fn any_dependents(state: &ConfigState, matches: impl Fn(&Route) -> bool) -> Vec<String> {
    state
        .routes
        .iter()
        .filter(|r| matches(r))
        .map(|r| r.name.clone())
        .collect()
}

/// Fail with `ReferentialConflict`, or fold cascade disables into `plan` when forced.
fn gate_dependents<T>(
    plan: &mut Plan<T>,
    state: &ConfigState,
    entity: &'static str,
    name: &str,
    dependents: Vec<String>,
    force: bool,
) -> Result<(), ControlError> {
    if dependents.is_empty() {
        return Ok(());
    }
    if !force {
        return Err(ControlError::ReferentialConflict {
            entity,
            name: name.to_string(),
            dependents,
        });
    }
    for (change, audit) in plan_cascade(state, &dependents, &format!("{entity} '{name}'")) {
        plan.changes.push(change);
        plan.audits.push(audit);
    }
    Ok(())
}

// --- services ---------------------------------------------------------------

pub fn plan_create_service(
    state: &ConfigState,
    input: NewService,
) -> Result<Plan<Service>, ControlError> {
    validate_name("service", &input.name)?;
    validate_targets(input.kind, &input.backend_targets)?;
    validate_health_check(input.health_check.as_ref())?;
    if state.service_by_name(&input.name).is_some() {
        return Err(ControlError::AlreadyExists(format!("service '{}'", input.name)));
    }
    let now = Utc::now();
    let service = Service {
        id: Uuid::now_v7(),
        name: input.name,
        kind: input.kind,
        backend_targets: input.backend_targets,
        health_check: input.health_check,
        status: input.status,
        created_at: now,
        updated_at: now,
    };
    let mut plan = Plan::new(service.clone());
    plan.changes.push(Change::PutService(service.clone()));
    plan.audits.push(AuditDraft::new(
        entity_type::SERVICE,
        Some(service.id),
        &service.name,
        audit_action::CREATE,
        serde_json::json!({ "after": to_json(&service) }),
    ));
    Ok(plan)
}

/// Plan updating a service. Disabling it or changing its type while active
/// routes use it cascades only with `force`.
pub fn plan_update_service(
    state: &ConfigState,
    id: Uuid,
    update: UpdateService,
    force: bool,
) -> Result<Plan<Service>, ControlError> {
    let before = state
        .service(id)
        .ok_or_else(|| ControlError::not_found("service", id))?
        .clone();
    let mut service = before.clone();

    if let Some(name) = update.name {
        if name != before.name {
            validate_name("service", &name)?;
            if state.service_by_name(&name).is_some() {
                return Err(ControlError::AlreadyExists(format!("service '{name}'")));
            }
            let dependents = any_dependents(state, |r| r.service_ref == before.name);
            if !dependents.is_empty() {
                return Err(ControlError::ReferentialConflict {
                    entity: "service",
                    name: before.name.clone(),
                    dependents,
                });
            }
        }
        service.name = name;
    }
    if let Some(kind) = update.kind {
        service.kind = kind;
    }
    if let Some(targets) = update.backend_targets {
        service.backend_targets = targets;
    }
    if let Some(health_check) = update.health_check {
        service.health_check = health_check;
    }
    if let Some(status) = update.status {
        service.status = status;
    }
    validate_targets(service.kind, &service.backend_targets)?;
    validate_health_check(service.health_check.as_ref())?;

    let unchanged = (
        &service.name,
        service.kind,
        &service.backend_targets,
        &service.health_check,
        service.status,
    ) == (
        &before.name,
        before.kind,
        &before.backend_targets,
        &before.health_check,
        before.status,
    );
    if unchanged {
        return Ok(Plan::new(before));
    }
    service.updated_at = Utc::now();

    let mut plan = Plan::new(service.clone());
    plan.changes.push(Change::PutService(service.clone()));
    plan.audits.push(AuditDraft::new(
        entity_type::SERVICE,
        Some(service.id),
        &service.name,
        audit_action::UPDATE,
        serde_json::json!({ "before": to_json(&before), "after": to_json(&service) }),
    ));

    let users = active_dependents(state, |r| r.service_ref == before.name);
    let breaks_users = service.status == ServiceStatus::Disabled || service.kind != before.kind;
    if breaks_users {
        gate_dependents(&mut plan, state, "service", &before.name, users, force)?;
    } else {
        plan.touched = users;
    }
    Ok(plan)
}

pub fn plan_delete_service(
    state: &ConfigState,
    id: Uuid,
    force: bool,
) -> Result<Plan<Service>, ControlError> {
    let service = state
        .service(id)
        .ok_or_else(|| ControlError::not_found("service", id))?
        .clone();
    let mut plan = Plan::new(service.clone());
    let dependents = active_dependents(state, |r| r.service_ref == service.name);
    gate_dependents(&mut plan, state, "service", &service.name, dependents, force)?;
    plan.changes.push(Change::DeleteService(service.id));
    plan.audits.push(AuditDraft::new(
        entity_type::SERVICE,
        Some(service.id),
        &service.name,
        audit_action::DELETE,
        serde_json::json!({ "before": to_json(&service) }),
    ));
    Ok(plan)
}

// --- middlewares ------------------------------------------------------------

pub fn plan_create_middleware(
    state: &ConfigState,
    input: NewMiddleware,
) -> Result<Plan<Middleware>, ControlError> {
    validate_name("middleware", &input.name)?;
    validate_middleware_config(input.kind, &input.config)?;
    if state.middleware_by_name(&input.name).is_some() {
        return Err(ControlError::AlreadyExists(format!(
            "middleware '{}'",
            input.name
        )));
    }
    let now = Utc::now();
    let middleware = Middleware {
        id: Uuid::now_v7(),
        name: input.name,
        kind: input.kind,
        config: input.config,
        usage_count: 0,
        created_at: now,
        updated_at: now,
    };
    let mut plan = Plan::new(middleware.clone());
    plan.changes.push(Change::PutMiddleware(middleware.clone()));
    plan.audits.push(AuditDraft::new(
        entity_type::MIDDLEWARE,
        Some(middleware.id),
        &middleware.name,
        audit_action::CREATE,
        serde_json::json!({ "after": to_json(&middleware) }),
    ));
    Ok(plan)
}

pub fn plan_update_middleware(
    state: &ConfigState,
    id: Uuid,
    update: UpdateMiddleware,
) -> Result<Plan<Middleware>, ControlError> {
    let before = state
        .middleware(id)
        .ok_or_else(|| ControlError::not_found("middleware", id))?
        .clone();
    let mut middleware = before.clone();

    if let Some(name) = update.name {
        if name != before.name {
            validate_name("middleware", &name)?;
            if state.middleware_by_name(&name).is_some() {
                return Err(ControlError::AlreadyExists(format!("middleware '{name}'")));
            }
            let dependents =
                any_dependents(state, |r| r.middleware_refs.contains(&before.name));
            if !dependents.is_empty() {
                return Err(ControlError::ReferentialConflict {
                    entity: "middleware",
                    name: before.name.clone(),
                    dependents,
                });
            }
        }
        middleware.name = name;
    }
    if let Some(kind) = update.kind {
        middleware.kind = kind;
    }
    if let Some(config) = update.config {
        middleware.config = config;
    }
    validate_middleware_config(middleware.kind, &middleware.config)?;

    if (&middleware.name, middleware.kind, &middleware.config)
        == (&before.name, before.kind, &before.config)
    {
        return Ok(Plan::new(before));
    }
    middleware.updated_at = Utc::now();

    let mut plan = Plan::new(middleware.clone());
    plan.changes.push(Change::PutMiddleware(middleware.clone()));
    plan.audits.push(AuditDraft::new(
        entity_type::MIDDLEWARE,
        Some(middleware.id),
        &middleware.name,
        audit_action::UPDATE,
        serde_json::json!({ "before": to_json(&before), "after": to_json(&middleware) }),
    ));
    plan.touched = active_dependents(state, |r| r.middleware_refs.contains(&before.name));
    Ok(plan)
}

pub fn plan_delete_middleware(
    state: &ConfigState,
    id: Uuid,
    force: bool,
) -> Result<Plan<Middleware>, ControlError> {
    let middleware = state
        .middleware(id)
        .ok_or_else(|| ControlError::not_found("middleware", id))?
        .clone();
    let mut plan = Plan::new(middleware.clone());
    let dependents = active_dependents(state, |r| r.middleware_refs.contains(&middleware.name));
    gate_dependents(
        &mut plan,
        state,
        "middleware",
        &middleware.name,
        dependents,
        force,
    )?;
    plan.changes.push(Change::DeleteMiddleware(middleware.id));
    plan.audits.push(AuditDraft::new(
        entity_type::MIDDLEWARE,
        Some(middleware.id),
        &middleware.name,
        audit_action::DELETE,
        serde_json::json!({ "before": to_json(&middleware) }),
    ));
    Ok(plan)
}

// --- reads ------------------------------------------------------------------

/// Filters for listing routes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteFilter {
    pub status: Option<RouteStatus>,
    pub source: Option<RouteSource>,
    /// Case-insensitive name substring.
    pub name: Option<String>,
}

impl RouteFilter {
    fn matches(&self, route: &Route) -> bool {
        self.status.map_or(true, |s| route.status == s)
            && self.source.map_or(true, |s| route.source == s)
            && self.name.as_ref().map_or(true, |needle| {
                route.name.to_lowercase().contains(&needle.to_lowercase())
            })
    }
}

/// Filters for listing services and middlewares.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NameFilter {
    pub name: Option<String>,
}

impl NameFilter {
    fn matches(&self, name: &str) -> bool {
        self.name
            .as_ref()
            .map_or(true, |needle| name.to_lowercase().contains(&needle.to_lowercase()))
    }
}

/// A route draft for dry-run validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteDraft {
    /// Existing route being edited, excluded from the comparison.
    pub id: Option<Uuid>,
    #[serde(default = "draft_name")]
    pub name: String,
    pub rule: String,
    #[serde(default)]
    pub priority: i32,
}

fn draft_name() -> String {
    "draft".to_string()
}

/// Read access to configuration records.
#[derive(Clone)]
pub struct ConfigRepository {
    store: Arc<dyn ConfigStore>,
}

/// Resolve a path key that is either an id or a name.
fn lookup<'a, T>(
    items: &'a [T],
    key: &str,
    id: impl Fn(&T) -> Uuid,
    name: impl Fn(&T) -> &str,
) -> Option<&'a T> {
    match Uuid::parse_str(key) {
        Ok(uuid) => items.iter().find(|item| id(item) == uuid),
        Err(_) => items.iter().find(|item| name(item) == key),
    }
}

/// Resolve an id-or-name key against `state`.
pub fn resolve_route(state: &ConfigState, key: &str) -> Result<Uuid, ControlError> {
    lookup(&state.routes, key, |r| r.id, |r| r.name.as_str())
        .map(|r| r.id)
        .ok_or_else(|| ControlError::not_found("route", key))
}

pub fn resolve_service(state: &ConfigState, key: &str) -> Result<Uuid, ControlError> {
    lookup(&state.services, key, |s| s.id, |s| s.name.as_str())
        .map(|s| s.id)
        .ok_or_else(|| ControlError::not_found("service", key))
}

pub fn resolve_middleware(state: &ConfigState, key: &str) -> Result<Uuid, ControlError> {
    lookup(&state.middlewares, key, |m| m.id, |m| m.name.as_str())
        .map(|m| m.id)
        .ok_or_else(|| ControlError::not_found("middleware", key))
}

impl ConfigRepository {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    /// Current state with derived middleware usage counts.
    pub async fn state(&self) -> Result<ConfigState, ControlError> {
        Ok(self.store.load_state().await?.with_usage_counts())
    }

    pub async fn list_routes(&self, filter: &RouteFilter) -> Result<Vec<Route>, ControlError> {
        let state = self.store.load_state().await?;
        Ok(state.routes.into_iter().filter(|r| filter.matches(r)).collect())
    }

    /// Get a route by id or name.
    pub async fn get_route(&self, key: &str) -> Result<Route, ControlError> {
        let state = self.store.load_state().await?;
        lookup(&state.routes, key, |r| r.id, |r| r.name.as_str())
            .cloned()
            .ok_or_else(|| ControlError::not_found("route", key))
    }

    pub async fn list_services(&self, filter: &NameFilter) -> Result<Vec<Service>, ControlError> {
        let state = self.store.load_state().await?;
        Ok(state
            .services
            .into_iter()
            .filter(|s| filter.matches(&s.name))
            .collect())
    }

    pub async fn get_service(&self, key: &str) -> Result<Service, ControlError> {
        let state = self.store.load_state().await?;
        lookup(&state.services, key, |s| s.id, |s| s.name.as_str())
            .cloned()
            .ok_or_else(|| ControlError::not_found("service", key))
    }

    pub async fn list_middlewares(
        &self,
        filter: &NameFilter,
    ) -> Result<Vec<Middleware>, ControlError> {
        let state = self.state().await?;
        Ok(state
            .middlewares
            .into_iter()
            .filter(|m| filter.matches(&m.name))
            .collect())
    }

    pub async fn get_middleware(&self, key: &str) -> Result<Middleware, ControlError> {
        let state = self.state().await?;
        lookup(&state.middlewares, key, |m| m.id, |m| m.name.as_str())
            .cloned()
            .ok_or_else(|| ControlError::not_found("middleware", key))
    }

    /// Dry-run the conflict detector for a draft. Writes nothing.
    pub async fn validate_route(&self, draft: &RouteDraft) -> Result<ConflictReport, ControlError> {
        validate_rule(&draft.rule)?;
        let state = self.store.load_state().await?;
        let exclude = draft
            .id
            .or_else(|| state.route_by_name(&draft.name).map(|r| r.id));
        let detector = ConflictDetector::new(
            state
                .active_routes()
                .filter(|r| Some(r.id) != exclude)
                .map(|r| RouteSpec::new(&r.name, &r.rule, r.priority)),
        );
        Ok(detector.check(&RouteSpec::new(&draft.name, &draft.rule, draft.priority))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{http_service, middleware, new_route, route, state};
    use switchyard_rules::{ConflictKind, Severity};

    fn base() -> ConfigState {
        state(
            vec![route("app", "Host(`app.example.com`) && PathPrefix(`/`)", "api", 10)],
            vec![http_service("api")],
            vec![middleware(
                "limit",
                MiddlewareType::RateLimit,
                serde_json::json!({"average": 10}),
            )],
        )
    }

    #[test]
    fn names_are_validated() {
        assert!(validate_name("route", "web-1.v2_b").is_ok());
        assert!(validate_name("route", "").is_err());
        assert!(validate_name("route", "has space").is_err());
        assert!(validate_name("route", &"a".repeat(129)).is_err());
        assert!(validate_name("route", &"a".repeat(128)).is_ok());
    }

    #[test]
    fn targets_are_validated_per_type() {
        let http = |url: &str| vec![BackendTarget { url: url.into(), weight: 1 }];
        assert!(validate_targets(ServiceType::Http, &http("http://api:8080")).is_ok());
        assert!(validate_targets(ServiceType::Http, &http("api:8080")).is_err());
        assert!(validate_targets(ServiceType::Http, &[]).is_err());
        assert!(validate_targets(ServiceType::Tcp, &http("db:5432")).is_ok());
        assert!(validate_targets(ServiceType::Tcp, &http("db")).is_err());
    }

    #[test]
    fn middleware_config_requires_type_keys() {
        assert!(validate_middleware_config(
            MiddlewareType::StripPrefix,
            &serde_json::json!({"prefixes": ["/api"]})
        )
        .is_ok());
        let err = validate_middleware_config(MiddlewareType::BasicAuth, &serde_json::json!({}))
            .unwrap_err();
        assert!(err.to_string().contains("users"));
        assert!(validate_middleware_config(MiddlewareType::Compress, &serde_json::json!([])).is_err());
    }

    #[test]
    fn whole_state_checks_every_entity() {
        assert!(validate_state(&base()).is_ok());

        let mut dup = base();
        dup.routes.push(route("app", "Host(`b.example.com`)", "api", 0));
        let err = validate_state(&dup).unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
        assert!(err.to_string().contains("duplicate route name 'app'"));

        let mut bad_url = base();
        bad_url.services[0].backend_targets[0].url = "not a url at all".into();
        assert!(validate_state(&bad_url)
            .unwrap_err()
            .to_string()
            .contains("not a url at all"));

        let mut bad_config = base();
        bad_config.middlewares[0].config = serde_json::json!({});
        assert!(validate_state(&bad_config).is_err());

        let mut bad_check = base();
        bad_check.services[0].health_check = Some(HealthCheck {
            path: "healthz".into(),
            interval: "10s".into(),
        });
        assert!(validate_state(&bad_check).is_err());

        let mut dup_service = base();
        dup_service.services.push(http_service("api"));
        assert!(validate_state(&dup_service).is_err());
    }

    #[test]
    fn duplicate_priority_is_rejected_then_warned_after_priority_change() {
        let state = base();
        let input = new_route("app-api", "Host(`app.example.com`) && PathPrefix(`/api`)", "api", 10);

        let err = plan_create_route(&state, input.clone(), "alice", RouteSource::Manual, false)
            .unwrap_err();
        let ControlError::Conflict(report) = err else {
            panic!("expected a conflict error");
        };
        assert!(!report.valid);
        assert_eq!(report.errors[0].kind, ConflictKind::DuplicatePriority);
        assert_eq!(report.errors[0].route_b, "app");

        let input = NewRoute { priority: 20, ..input };
        let plan = plan_create_route(&state, input, "alice", RouteSource::Manual, false).unwrap();
        assert!(plan.report.valid);
        assert_eq!(plan.report.warnings.len(), 1);
        assert_eq!(plan.report.warnings[0].kind, ConflictKind::PathOverlap);
        assert_eq!(plan.conflicts[0].severity, Severity::Warning);
        assert_eq!(plan.touched, vec!["app-api"]);
    }

    #[test]
    fn force_overrides_conflict_errors() {
        let state = base();
        let input = new_route("dup", "Host(`app.example.com`)", "api", 10);
        let plan = plan_create_route(&state, input, "alice", RouteSource::Manual, true).unwrap();
        assert!(!plan.report.valid);
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].route_id_a, Some(plan.value.id));
    }

    #[test]
    fn disabled_routes_skip_conflict_detection() {
        let state = base();
        let mut input = new_route("dup", "Host(`app.example.com`)", "api", 10);
        input.status = RouteStatus::Disabled;
        let plan = plan_create_route(&state, input, "alice", RouteSource::Manual, false).unwrap();
        assert!(plan.report.is_clean());
        assert!(plan.touched.is_empty());
    }

    #[test]
    fn route_refs_must_exist() {
        let state = base();
        let err = plan_create_route(
            &state,
            new_route("web", "Host(`w.example.com`)", "nope", 0),
            "alice",
            RouteSource::Manual,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));

        let mut input = new_route("web", "Host(`w.example.com`)", "api", 0);
        input.middleware_refs = vec!["ghost".into()];
        let err = plan_create_route(&state, input, "alice", RouteSource::Manual, false).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn invalid_rule_is_a_validation_error() {
        let err = plan_create_route(
            &base(),
            new_route("web", "Host(`a.example.com`", "api", 0),
            "alice",
            RouteSource::Manual,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = plan_create_route(
            &base(),
            new_route("app", "Host(`other.example.com`)", "api", 0),
            "alice",
            RouteSource::Manual,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ControlError::AlreadyExists(_)));
    }

    #[test]
    fn update_never_conflicts_with_itself() {
        let state = base();
        let id = state.routes[0].id;
        let plan = plan_update_route(
            &state,
            id,
            UpdateRoute {
                name: Some("app-renamed".into()),
                tls_enabled: Some(true),
                ..Default::default()
            },
            false,
        )
        .unwrap();
        assert!(plan.report.is_clean());
        assert_eq!(plan.value.name, "app-renamed");
        assert_eq!(plan.value.id, id);
    }

    #[test]
    fn no_op_update_produces_empty_plan() {
        let state = base();
        let id = state.routes[0].id;
        let plan = plan_update_route(
            &state,
            id,
            UpdateRoute {
                priority: Some(10),
                ..Default::default()
            },
            false,
        )
        .unwrap();
        assert!(plan.is_noop());
    }

    #[test]
    fn deleting_referenced_service_requires_force() {
        let state = base();
        let service_id = state.services[0].id;
        let err = plan_delete_service(&state, service_id, false).unwrap_err();
        let ControlError::ReferentialConflict { dependents, .. } = err else {
            panic!("expected referential conflict");
        };
        assert_eq!(dependents, vec!["app"]);

        let plan = plan_delete_service(&state, service_id, true).unwrap();
        let mut after = state.clone();
        after.apply_changes(&plan.changes);
        assert!(after.services.is_empty());
        assert_eq!(after.routes[0].status, RouteStatus::Disabled);
        let cascade: Vec<_> = plan
            .audits
            .iter()
            .filter(|a| a.fixed_result == Some(audit_result::CASCADE))
            .collect();
        assert_eq!(cascade.len(), 1);
        assert_eq!(cascade[0].entity_name, "app");
    }

    #[test]
    fn deleting_referenced_middleware_cascades_with_force() {
        let mut state = base();
        state.routes[0].middleware_refs = vec!["limit".into()];
        let id = state.middlewares[0].id;
        assert!(matches!(
            plan_delete_middleware(&state, id, false),
            Err(ControlError::ReferentialConflict { .. })
        ));
        let plan = plan_delete_middleware(&state, id, true).unwrap();
        let mut after = state.clone();
        after.apply_changes(&plan.changes);
        assert!(after.middlewares.is_empty());
        assert!(!after.routes[0].is_active());
    }

    #[test]
    fn unreferenced_service_deletes_cleanly() {
        let mut state = base();
        state.services.push(http_service("spare"));
        let id = state.service_by_name("spare").unwrap().id;
        let plan = plan_delete_service(&state, id, false).unwrap();
        assert_eq!(plan.changes, vec![Change::DeleteService(id)]);
    }

    #[test]
    fn renaming_a_referenced_service_is_refused() {
        let state = base();
        let id = state.services[0].id;
        let err = plan_update_service(
            &state,
            id,
            UpdateService {
                name: Some("api2".into()),
                ..Default::default()
            },
            true,
        )
        .unwrap_err();
        assert!(matches!(err, ControlError::ReferentialConflict { .. }));
    }

    #[test]
    fn service_target_change_touches_its_routes() {
        let state = base();
        let id = state.services[0].id;
        let plan = plan_update_service(
            &state,
            id,
            UpdateService {
                backend_targets: Some(vec![BackendTarget {
                    url: "http://api-v2:8080".into(),
                    weight: 1,
                }]),
                ..Default::default()
            },
            false,
        )
        .unwrap();
        assert_eq!(plan.touched, vec!["app"]);
    }

    #[test]
    fn disabling_a_used_service_is_gated() {
        let state = base();
        let id = state.services[0].id;
        let update = UpdateService {
            status: Some(ServiceStatus::Disabled),
            ..Default::default()
        };
        assert!(plan_update_service(&state, id, update.clone(), false).is_err());
        let plan = plan_update_service(&state, id, update, true).unwrap();
        assert_eq!(plan.changes.len(), 2);
    }

    #[test]
    fn route_filter_matches_fields() {
        let mut r = route("Shop-Front", "Host(`shop.example.com`)", "api", 0);
        r.source = RouteSource::AutoDiscovered;
        let filter = RouteFilter {
            status: Some(RouteStatus::Active),
            source: Some(RouteSource::AutoDiscovered),
            name: Some("front".into()),
        };
        assert!(filter.matches(&r));
        r.status = RouteStatus::Disabled;
        assert!(!filter.matches(&r));
    }

    #[tokio::test]
    async fn repository_reads_by_id_or_name() {
        let store = Arc::new(crate::db::MemoryStore::new());
        store.replace_state(&base()).await.unwrap();
        let repo = ConfigRepository::new(store);

        let by_name = repo.get_route("app").await.unwrap();
        let by_id = repo.get_route(&by_name.id.to_string()).await.unwrap();
        assert_eq!(by_name, by_id);
        assert!(matches!(
            repo.get_route("missing").await,
            Err(ControlError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn middleware_usage_is_derived() {
        let mut state = base();
        state.routes[0].middleware_refs = vec!["limit".into()];
        let store = Arc::new(crate::db::MemoryStore::new());
        store.replace_state(&state).await.unwrap();
        let repo = ConfigRepository::new(store);
        let limit = repo.get_middleware("limit").await.unwrap();
        assert_eq!(limit.usage_count, 1);
    }

    #[tokio::test]
    async fn validate_route_is_a_dry_run() {
        let store = Arc::new(crate::db::MemoryStore::new());
        store.replace_state(&base()).await.unwrap();
        let repo = ConfigRepository::new(store.clone());

        let report = repo
            .validate_route(&RouteDraft {
                id: None,
                name: "probe".into(),
                rule: "Host(`APP.example.com`)".into(),
                priority: 10,
            })
            .await
            .unwrap();
        assert!(!report.valid);
        assert_eq!(store.load_state().await.unwrap().routes.len(), 1);

        // Editing the existing route against itself is clean.
        let report = repo
            .validate_route(&RouteDraft {
                id: None,
                name: "app".into(),
                rule: "Host(`app.example.com`)".into(),
                priority: 10,
            })
            .await
            .unwrap();
        assert!(report.valid);
    }
}
