//! Container label parsing.
//!
//! Recognised labels, with `<p>` the configured prefix:
//!
//! ```text
//! <p>.enable=true
//! <p>.http.routers.<router>.rule=Host(`shop.example.com`)
//! <p>.http.routers.<router>.priority=10
//! <p>.http.routers.<router>.entrypoints=web,websecure
//! <p>.http.routers.<router>.tls=true
//! <p>.http.routers.<router>.middlewares=auth,strip
//! <p>.http.routers.<router>.service=<service>
//! <p>.http.services.<service>.loadbalancer.server.port=8080
//! <p>.http.services.<service>.loadbalancer.server.scheme=http
//! ```

use std::collections::BTreeMap;

use serde::Serialize;

use super::runtime::ContainerInfo;

/// A backend a container declares for itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeclaredService {
    pub name: String,
    pub url: String,
}

/// A router a container asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeclaredRoute {
    pub container: String,
    pub router: String,
    pub rule: String,
    pub priority: i32,
    pub entrypoints: Vec<String>,
    pub tls: bool,
    pub middlewares: Vec<String>,
    pub service: String,
    /// Set when the container itself declares the service's backend.
    pub declared_service: Option<DeclaredService>,
}

/// One router's worth of labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteIntent {
    Declared(DeclaredRoute),
    Malformed {
        container: String,
        router: String,
        reason: String,
    },
}

impl RouteIntent {
    pub fn router(&self) -> &str {
        match self {
            Self::Declared(route) => &route.router,
            Self::Malformed { router, .. } => router,
        }
    }

    pub fn container(&self) -> &str {
        match self {
            Self::Declared(route) => &route.container,
            Self::Malformed { container, .. } => container,
        }
    }
}

/// Whether the container opted into discovery.
pub fn is_enabled(container: &ContainerInfo, prefix: &str) -> bool {
    container
        .labels
        .get(&format!("{prefix}.enable"))
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Parse a container's labels into route intents, sorted by router name.
pub fn parse_labels(container: &ContainerInfo, prefix: &str) -> Vec<RouteIntent> {
    let router_prefix = format!("{prefix}.http.routers.");
    let service_prefix = format!("{prefix}.http.services.");

    let mut routers: BTreeMap<&str, BTreeMap<&str, &str>> = BTreeMap::new();
    let mut service_labels: BTreeMap<&str, BTreeMap<&str, &str>> = BTreeMap::new();
    for (key, value) in &container.labels {
        if let Some(rest) = key.strip_prefix(&router_prefix) {
            if let Some((router, field)) = rest.split_once('.') {
                routers.entry(router).or_default().insert(field, value.as_str());
            }
        } else if let Some(rest) = key.strip_prefix(&service_prefix) {
            if let Some((service, field)) = rest.split_once('.') {
                service_labels
                    .entry(service)
                    .or_default()
                    .insert(field, value.as_str());
            }
        }
    }

    let services: BTreeMap<&str, Result<DeclaredService, String>> = service_labels
        .iter()
        .map(|(name, fields)| (*name, declared_service(&container.name, name, fields)))
        .collect();

    routers
        .into_iter()
        .map(|(router, fields)| {
            declared_route(container, router, &fields, &services).unwrap_or_else(|reason| {
                RouteIntent::Malformed {
                    container: container.name.clone(),
                    router: router.to_string(),
                    reason,
                }
            })
        })
        .collect()
}

fn declared_service(
    container: &str,
    name: &str,
    fields: &BTreeMap<&str, &str>,
) -> Result<DeclaredService, String> {
    let port = fields
        .get("loadbalancer.server.port")
        .ok_or_else(|| format!("service '{name}' has no loadbalancer.server.port"))?;
    let port: u16 = port
        .trim()
        .parse()
        .map_err(|_| format!("service '{name}' has invalid port '{port}'"))?;
    let scheme = fields
        .get("loadbalancer.server.scheme")
        .map(|s| s.trim().to_ascii_lowercase())
        .unwrap_or_else(|| "http".to_string());
    if scheme != "http" && scheme != "https" {
        return Err(format!("service '{name}' has unsupported scheme '{scheme}'"));
    }
    Ok(DeclaredService {
        name: name.to_string(),
        url: format!("{scheme}://{container}:{port}"),
    })
}

fn declared_route(
    container: &ContainerInfo,
    router: &str,
    fields: &BTreeMap<&str, &str>,
    services: &BTreeMap<&str, Result<DeclaredService, String>>,
) -> Result<RouteIntent, String> {
    let rule = fields
        .get("rule")
        .map(|r| r.trim())
        .filter(|r| !r.is_empty())
        .ok_or("missing rule label")?;
    let priority = match fields.get("priority") {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("invalid priority '{raw}'"))?,
        None => 0,
    };
    let tls = match fields.get("tls").map(|v| v.trim().to_ascii_lowercase()) {
        None => false,
        Some(v) if v == "true" => true,
        Some(v) if v == "false" => false,
        Some(v) => return Err(format!("invalid tls flag '{v}'")),
    };

    let service = match fields.get("service").map(|s| s.trim()) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => match services.keys().collect::<Vec<_>>().as_slice() {
            [only] => only.to_string(),
            [] => return Err("no service label and the container declares no service".into()),
            _ => return Err("no service label and the container declares several services".into()),
        },
    };
    let declared_service = match services.get(service.as_str()) {
        Some(Ok(declared)) => Some(declared.clone()),
        Some(Err(reason)) => return Err(reason.clone()),
        None => None,
    };

    Ok(RouteIntent::Declared(DeclaredRoute {
        container: container.name.clone(),
        router: router.to_string(),
        rule: rule.to_string(),
        priority,
        entrypoints: fields.get("entrypoints").map(|v| split_list(v)).unwrap_or_default(),
        tls,
        middlewares: fields.get("middlewares").map(|v| split_list(v)).unwrap_or_default(),
        service,
        declared_service,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn parses_router_with_its_own_service() {
        let c = container(
            "shop",
            &[
                ("traefik.enable", "true"),
                ("traefik.http.routers.shop.rule", "Host(`shop.example.com`)"),
                ("traefik.http.routers.shop.priority", "10"),
                ("traefik.http.routers.shop.entrypoints", "web, websecure"),
                ("traefik.http.routers.shop.tls", "true"),
                ("traefik.http.routers.shop.middlewares", "auth"),
                ("traefik.http.services.shop-svc.loadbalancer.server.port", "8080"),
            ],
        );
        assert!(is_enabled(&c, "traefik"));
        let intents = parse_labels(&c, "traefik");
        let [RouteIntent::Declared(route)] = intents.as_slice() else {
            panic!("expected one declared route, got {intents:?}");
        };
        assert_eq!(route.priority, 10);
        assert_eq!(route.entrypoints, vec!["web", "websecure"]);
        assert!(route.tls);
        assert_eq!(route.service, "shop-svc");
        assert_eq!(
            route.declared_service.as_ref().map(|s| s.url.as_str()),
            Some("http://shop:8080")
        );
    }

    #[test]
    fn explicit_service_may_reference_existing_backend() {
        let c = container(
            "admin",
            &[
                ("traefik.http.routers.admin.rule", "Host(`admin.example.com`)"),
                ("traefik.http.routers.admin.service", "shared-api"),
            ],
        );
        let intents = parse_labels(&c, "traefik");
        let [RouteIntent::Declared(route)] = intents.as_slice() else {
            panic!("expected one declared route");
        };
        assert_eq!(route.service, "shared-api");
        assert!(route.declared_service.is_none());
        assert!(!is_enabled(&c, "traefik"));
    }

    #[test]
    fn malformed_routers_are_reported_not_dropped() {
        let c = container(
            "broken",
            &[
                ("traefik.http.routers.a.priority", "1"),
                ("traefik.http.routers.b.rule", "Host(`b.example.com`)"),
                ("traefik.http.routers.b.priority", "high"),
                ("traefik.http.routers.c.rule", "Host(`c.example.com`)"),
                ("traefik.http.services.c.loadbalancer.server.port", "99999"),
            ],
        );
        let intents = parse_labels(&c, "traefik");
        let reasons: Vec<_> = intents
            .iter()
            .map(|i| match i {
                RouteIntent::Malformed { router, reason, .. } => (router.as_str(), reason.as_str()),
                RouteIntent::Declared(r) => panic!("unexpected declared route {}", r.router),
            })
            .collect();
        assert_eq!(reasons[0], ("a", "missing rule label"));
        assert!(reasons[1].1.contains("invalid priority"));
        assert!(reasons[2].1.contains("invalid port"));
    }

    #[test]
    fn custom_prefix_is_honoured() {
        let c = container(
            "shop",
            &[
                ("switchyard.enable", "TRUE"),
                ("switchyard.http.routers.shop.rule", "Host(`shop.example.com`)"),
                ("switchyard.http.services.shop.loadbalancer.server.port", "80"),
                ("switchyard.http.services.shop.loadbalancer.server.scheme", "https"),
                ("traefik.http.routers.ignored.rule", "Host(`x.example.com`)"),
            ],
        );
        assert!(is_enabled(&c, "switchyard"));
        let intents = parse_labels(&c, "switchyard");
        assert_eq!(intents.len(), 1);
        let RouteIntent::Declared(route) = &intents[0] else {
            panic!("expected declared route");
        };
        assert_eq!(route.declared_service.as_ref().unwrap().url, "https://shop:80");
    }
}
