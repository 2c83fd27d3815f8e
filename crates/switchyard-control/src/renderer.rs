//! Deterministic rendering of configuration records into the proxy's dynamic
//! configuration document.
//!
//! Every map is a `BTreeMap` and middleware configs are re-keyed in sorted
//! order, so equal inputs always produce byte-identical YAML.

use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};
use switchyard_rules::RuleMatch;
use thiserror::Error;

use crate::db::{ConfigState, Middleware, Route, Service, ServiceStatus, ServiceType};

/// Referential problems found while rendering. Nothing is emitted when any occur.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("E2301: route '{route}' references missing service '{service}'")]
    MissingService { route: String, service: String },

    #[error("E2302: route '{route}' references missing middleware '{middleware}'")]
    MissingMiddleware { route: String, middleware: String },

    #[error("E2303: route '{route}' references disabled service '{service}'")]
    DisabledService { route: String, service: String },

    #[error("E2304: {protocol} route '{route}' cannot use {service_type} service '{service}'")]
    ProtocolMismatch {
        route: String,
        service: String,
        protocol: Protocol,
        service_type: Protocol,
    },

    #[error("E2305: tcp route '{route}' cannot use http middleware '{middleware}'")]
    TcpMiddleware { route: String, middleware: String },

    #[error("E2306: failed to serialize document: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

/// Protocol section a router or service is rendered into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Tcp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Http => "http",
            Self::Tcp => "tcp",
        })
    }
}

impl Protocol {
    /// TCP routers are the ones matching on SNI. An unparseable rule is
    /// left to the HTTP section, where the proxy reports it.
    pub fn of_route(route: &Route) -> Self {
        match RuleMatch::parse(&route.rule) {
            Ok(rule) if rule.sni => Self::Tcp,
            _ => Self::Http,
        }
    }

    fn of_service(service: &Service) -> Self {
        match service.kind {
            ServiceType::Http => Self::Http,
            ServiceType::Tcp => Self::Tcp,
        }
    }
}

/// Settings applied to every rendered router.
#[derive(Debug, Clone, Default)]
pub struct RenderSettings {
    /// Entrypoints for routes that name none.
    pub default_entrypoints: Vec<String>,
    /// Certificate resolver attached to TLS routers.
    pub cert_resolver: Option<String>,
}

/// A rendered document and what went into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    pub content: String,
    /// Hex SHA-256 of `content`.
    pub checksum: String,
    /// Active-route reference count per middleware name.
    pub middleware_usage: BTreeMap<String, i64>,
    /// Rendered routers and the section they landed in.
    pub routers: BTreeMap<String, Protocol>,
}

#[derive(Serialize, Default)]
struct Document {
    #[serde(skip_serializing_if = "Option::is_none")]
    http: Option<HttpSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tcp: Option<TcpSection>,
}

#[derive(Serialize, Default)]
struct HttpSection {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    routers: BTreeMap<String, Router>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    services: BTreeMap<String, ServiceDoc<UrlServer>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    middlewares: BTreeMap<String, BTreeMap<&'static str, serde_json::Value>>,
}

impl HttpSection {
    fn is_empty(&self) -> bool {
        self.routers.is_empty() && self.services.is_empty() && self.middlewares.is_empty()
    }
}

#[derive(Serialize, Default)]
struct TcpSection {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    routers: BTreeMap<String, Router>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    services: BTreeMap<String, ServiceDoc<AddressServer>>,
}

impl TcpSection {
    fn is_empty(&self) -> bool {
        self.routers.is_empty() && self.services.is_empty()
    }
}

#[derive(Serialize)]
struct Router {
    #[serde(rename = "entryPoints", skip_serializing_if = "Vec::is_empty")]
    entry_points: Vec<String>,
    rule: String,
    priority: i32,
    service: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    middlewares: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls: Option<Tls>,
}

#[derive(Serialize)]
struct Tls {
    #[serde(rename = "certResolver", skip_serializing_if = "Option::is_none")]
    cert_resolver: Option<String>,
}

#[derive(Serialize)]
struct ServiceDoc<S> {
    #[serde(rename = "loadBalancer")]
    load_balancer: LoadBalancer<S>,
}

#[derive(Serialize)]
struct LoadBalancer<S> {
    servers: Vec<S>,
    #[serde(rename = "healthCheck", skip_serializing_if = "Option::is_none")]
    health_check: Option<HealthCheckDoc>,
}

#[derive(Serialize)]
struct UrlServer {
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    weight: Option<u32>,
}

#[derive(Serialize)]
struct AddressServer {
    address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    weight: Option<u32>,
}

#[derive(Serialize)]
struct HealthCheckDoc {
    path: String,
    interval: String,
}

fn weight(w: u32) -> Option<u32> {
    (w != 1).then_some(w)
}

/// Rebuild objects with sorted keys at every depth.
fn canonical(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<&String, serde_json::Value> =
                map.iter().map(|(k, v)| (k, canonical(v))).collect();
            serde_json::Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), v))
                    .collect(),
            )
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonical).collect())
        }
        other => other.clone(),
    }
}

/// Hex SHA-256 of a document.
pub fn checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Render the active configuration.
pub fn render(state: &ConfigState, settings: &RenderSettings) -> Result<RenderedConfig, RenderError> {
    let services: BTreeMap<&str, &Service> =
        state.services.iter().map(|s| (s.name.as_str(), s)).collect();
    let middlewares: BTreeMap<&str, &Middleware> =
        state.middlewares.iter().map(|m| (m.name.as_str(), m)).collect();

    let mut http = HttpSection::default();
    let mut tcp = TcpSection::default();
    let mut routers = BTreeMap::new();
    let mut usage: BTreeMap<String, i64> =
        middlewares.keys().map(|name| (name.to_string(), 0)).collect();

    for route in state.active_routes() {
        let service = services
            .get(route.service_ref.as_str())
            .ok_or_else(|| RenderError::MissingService {
                route: route.name.clone(),
                service: route.service_ref.clone(),
            })?;
        if service.status == ServiceStatus::Disabled {
            return Err(RenderError::DisabledService {
                route: route.name.clone(),
                service: service.name.clone(),
            });
        }

        let protocol = Protocol::of_route(route);
        let service_protocol = Protocol::of_service(service);
        if protocol != service_protocol {
            return Err(RenderError::ProtocolMismatch {
                route: route.name.clone(),
                service: service.name.clone(),
                protocol,
                service_type: service_protocol,
            });
        }

        for name in &route.middleware_refs {
            if !middlewares.contains_key(name.as_str()) {
                return Err(RenderError::MissingMiddleware {
                    route: route.name.clone(),
                    middleware: name.clone(),
                });
            }
            if protocol == Protocol::Tcp {
                return Err(RenderError::TcpMiddleware {
                    route: route.name.clone(),
                    middleware: name.clone(),
                });
            }
            *usage.entry(name.clone()).or_default() += 1;
        }

        let router = Router {
            entry_points: if route.entrypoints.is_empty() {
                settings.default_entrypoints.clone()
            } else {
                route.entrypoints.clone()
            },
            rule: route.rule.clone(),
            priority: route.priority,
            service: route.service_ref.clone(),
            middlewares: route.middleware_refs.clone(),
            tls: route.tls_enabled.then(|| Tls {
                cert_resolver: settings.cert_resolver.clone(),
            }),
        };
        match protocol {
            Protocol::Http => http.routers.insert(route.name.clone(), router),
            Protocol::Tcp => tcp.routers.insert(route.name.clone(), router),
        };
        routers.insert(route.name.clone(), protocol);
    }

    for service in services.values().filter(|s| s.status == ServiceStatus::Active) {
        match service.kind {
            ServiceType::Http => {
                let servers = service
                    .backend_targets
                    .iter()
                    .map(|t| UrlServer {
                        url: t.url.clone(),
                        weight: weight(t.weight),
                    })
                    .collect();
                let health_check = service.health_check.as_ref().map(|h| HealthCheckDoc {
                    path: h.path.clone(),
                    interval: h.interval.clone(),
                });
                http.services.insert(
                    service.name.clone(),
                    ServiceDoc {
                        load_balancer: LoadBalancer {
                            servers,
                            health_check,
                        },
                    },
                );
            }
            ServiceType::Tcp => {
                let servers = service
                    .backend_targets
                    .iter()
                    .map(|t| AddressServer {
                        address: t.url.clone(),
                        weight: weight(t.weight),
                    })
                    .collect();
                tcp.services.insert(
                    service.name.clone(),
                    ServiceDoc {
                        load_balancer: LoadBalancer {
                            servers,
                            health_check: None,
                        },
                    },
                );
            }
        }
    }

    for middleware in middlewares.values() {
        let mut body = BTreeMap::new();
        body.insert(middleware.kind.proxy_key(), canonical(&middleware.config));
        http.middlewares.insert(middleware.name.clone(), body);
    }

    let document = Document {
        http: (!http.is_empty()).then_some(http),
        tcp: (!tcp.is_empty()).then_some(tcp),
    };
    let content = serde_yaml::to_string(&document)?;

    Ok(RenderedConfig {
        checksum: checksum(&content),
        content,
        middleware_usage: usage,
        routers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MiddlewareType, RouteStatus};
    use crate::testing::{http_service, middleware, route, tcp_service};

    fn settings() -> RenderSettings {
        RenderSettings {
            default_entrypoints: vec!["websecure".into()],
            cert_resolver: Some("letsencrypt".into()),
        }
    }

    fn sample() -> ConfigState {
        let mut web = route("web", "Host(`app.example.com`)", "api", 10);
        web.middleware_refs = vec!["limit".into()];
        web.tls_enabled = true;
        ConfigState {
            routes: vec![web, route("docs", "Host(`docs.example.com`)", "api", 0)],
            services: vec![http_service("api")],
            middlewares: vec![middleware(
                "limit",
                MiddlewareType::RateLimit,
                serde_json::json!({"burst": 50, "average": 100}),
            )],
        }
    }

    #[test]
    fn rendering_is_byte_identical_regardless_of_input_order() {
        let a = render(&sample(), &settings()).unwrap();
        let mut shuffled = sample();
        shuffled.routes.reverse();
        let b = render(&shuffled, &settings()).unwrap();
        assert_eq!(a.content, b.content);
        assert_eq!(a.checksum, b.checksum);
        assert_eq!(a.checksum, checksum(&a.content));
    }

    #[test]
    fn renders_proxy_schema() {
        let rendered = render(&sample(), &settings()).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&rendered.content).unwrap();

        let web = &doc["http"]["routers"]["web"];
        assert_eq!(web["rule"].as_str(), Some("Host(`app.example.com`)"));
        assert_eq!(web["priority"].as_i64(), Some(10));
        assert_eq!(web["entryPoints"][0].as_str(), Some("websecure"));
        assert_eq!(web["middlewares"][0].as_str(), Some("limit"));
        assert_eq!(web["tls"]["certResolver"].as_str(), Some("letsencrypt"));
        assert!(doc["http"]["routers"]["docs"]["tls"].is_null());

        let servers = &doc["http"]["services"]["api"]["loadBalancer"]["servers"];
        assert_eq!(servers[0]["url"].as_str(), Some("http://api:8080"));
        assert_eq!(
            doc["http"]["middlewares"]["limit"]["rateLimit"]["average"].as_i64(),
            Some(100)
        );
        assert!(doc.get("tcp").is_none());
    }

    #[test]
    fn middleware_keys_are_sorted() {
        let rendered = render(&sample(), &settings()).unwrap();
        let average = rendered.content.find("average").unwrap();
        let burst = rendered.content.find("burst").unwrap();
        assert!(average < burst);
    }

    #[test]
    fn only_active_routes_are_rendered() {
        let mut state = sample();
        state.routes[1].status = RouteStatus::Disabled;
        state.routes.push({
            let mut r = route("flagged", "Host(`x.example.com`)", "missing", 0);
            r.status = RouteStatus::Conflict;
            r
        });
        let rendered = render(&state, &settings()).unwrap();
        assert_eq!(rendered.routers.keys().collect::<Vec<_>>(), vec!["web"]);
        assert!(!rendered.content.contains("docs.example.com"));
    }

    #[test]
    fn usage_counts_only_active_routes() {
        let mut state = sample();
        let mut other = route("other", "Host(`other.example.com`)", "api", 0);
        other.middleware_refs = vec!["limit".into()];
        other.status = RouteStatus::Disabled;
        state.routes.push(other);
        let rendered = render(&state, &settings()).unwrap();
        assert_eq!(rendered.middleware_usage.get("limit"), Some(&1));
    }

    #[test]
    fn missing_service_is_an_error() {
        let mut state = sample();
        state.services.clear();
        let err = render(&state, &settings()).unwrap_err();
        assert!(matches!(err, RenderError::MissingService { .. }));
    }

    #[test]
    fn missing_middleware_is_an_error() {
        let mut state = sample();
        state.middlewares.clear();
        let err = render(&state, &settings()).unwrap_err();
        assert!(matches!(err, RenderError::MissingMiddleware { ref middleware, .. } if middleware == "limit"));
    }

    #[test]
    fn disabled_service_is_an_error() {
        let mut state = sample();
        state.services[0].status = ServiceStatus::Disabled;
        let err = render(&state, &settings()).unwrap_err();
        assert!(matches!(err, RenderError::DisabledService { .. }));
    }

    #[test]
    fn http_route_on_tcp_service_is_an_error() {
        let state = ConfigState {
            routes: vec![route("db", "Host(`db.example.com`)", "postgres", 0)],
            services: vec![tcp_service("postgres")],
            middlewares: vec![],
        };
        let err = render(&state, &settings()).unwrap_err();
        assert!(matches!(err, RenderError::ProtocolMismatch { .. }));
    }

    #[test]
    fn tcp_routes_render_into_tcp_section() {
        let state = ConfigState {
            routes: vec![route("db", "HostSNI(`db.example.com`)", "postgres", 0)],
            services: vec![tcp_service("postgres")],
            middlewares: vec![],
        };
        let rendered = render(&state, &settings()).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&rendered.content).unwrap();
        assert!(doc.get("http").is_none());
        assert_eq!(
            doc["tcp"]["services"]["postgres"]["loadBalancer"]["servers"][0]["address"].as_str(),
            Some("postgres:5432")
        );
        assert_eq!(rendered.routers.get("db"), Some(&Protocol::Tcp));
    }

    #[test]
    fn sni_text_inside_http_matcher_stays_http() {
        let state = ConfigState {
            routes: vec![
                route("sni-docs", "Path(`/HostSNI`)", "web", 0),
                route("sni-host", "Host(`hostsni.example.com`)", "web", 0),
            ],
            services: vec![http_service("web")],
            middlewares: vec![],
        };
        let rendered = render(&state, &settings()).unwrap();
        assert_eq!(rendered.routers.get("sni-docs"), Some(&Protocol::Http));
        assert_eq!(rendered.routers.get("sni-host"), Some(&Protocol::Http));
        let doc: serde_yaml::Value = serde_yaml::from_str(&rendered.content).unwrap();
        assert!(doc.get("tcp").is_none());
    }

    #[test]
    fn empty_state_renders_empty_document() {
        let rendered = render(&ConfigState::default(), &settings()).unwrap();
        assert_eq!(rendered.content.trim(), "{}");
    }
}
