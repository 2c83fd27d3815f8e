//! TLS certificate expiry tracking.
//!
//! The monitor reads what the proxy's ACME resolver has issued, classifies each
//! tracked domain, persists the result and announces transitions into
//! `expiring` or `expired`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchyard_rules::{HostPattern, RuleMatch};
use switchyard_telemetry::MetricsRegistry;
use tokio::sync::{broadcast, Mutex};
use x509_parser::prelude::*;

use crate::db::{Certificate, CertificateStatus, ConfigStore};
use crate::error::ControlError;

const SECONDS_PER_DAY: i64 = 86_400;

/// A certificate the resolver has issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub domain: String,
    pub sans: Vec<String>,
    pub resolver: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IssuedCertificate {
    /// Whether this certificate is valid for `domain`. A wildcard name covers
    /// exactly one extra label; wildcard domains need the same wildcard.
    pub fn covers(&self, domain: &str) -> bool {
        std::iter::once(&self.domain).chain(&self.sans).any(|name| {
            if name.eq_ignore_ascii_case(domain) {
                return true;
            }
            match HostPattern::parse(name) {
                Ok(HostPattern::Wildcard(suffix)) => domain
                    .strip_suffix(suffix.as_str())
                    .and_then(|rest| rest.strip_suffix('.'))
                    .is_some_and(|label| !label.is_empty() && !label.contains(['.', '*'])),
                _ => false,
            }
        })
    }
}

/// Where issued certificates are read from.
#[async_trait]
pub trait CertificateSource: Send + Sync {
    async fn issued(&self) -> Result<Vec<IssuedCertificate>, ControlError>;
}

/// Reads a Traefik-style `acme.json` store.
pub struct AcmeFileSource {
    path: PathBuf,
}

#[derive(Deserialize)]
struct ResolverStore {
    #[serde(rename = "Certificates", default)]
    certificates: Option<Vec<AcmeCertificate>>,
}

#[derive(Deserialize)]
struct AcmeCertificate {
    domain: AcmeDomain,
    #[serde(default)]
    certificate: Option<String>,
}

#[derive(Deserialize)]
struct AcmeDomain {
    main: String,
    #[serde(default)]
    sans: Option<Vec<String>>,
}

impl AcmeFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Parse the store document. Entries without a certificate are skipped,
    /// as are certificates that fail to decode.
    pub fn parse(content: &str) -> Result<Vec<IssuedCertificate>, ControlError> {
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let resolvers: HashMap<String, ResolverStore> = serde_json::from_str(content)
            .map_err(|e| ControlError::CertificateSource(format!("invalid acme store: {e}")))?;

        let mut issued = Vec::new();
        for (resolver, store) in resolvers {
            for entry in store.certificates.unwrap_or_default() {
                let Some(encoded) = entry.certificate else {
                    continue;
                };
                let (issued_at, expires_at) = match validity(&encoded) {
                    Ok(window) => window,
                    Err(e) => {
                        tracing::warn!(
                            domain = %entry.domain.main,
                            resolver = %resolver,
                            error = %e,
                            "skipping unreadable certificate"
                        );
                        continue;
                    }
                };
                issued.push(IssuedCertificate {
                    domain: entry.domain.main.to_ascii_lowercase(),
                    sans: entry
                        .domain
                        .sans
                        .unwrap_or_default()
                        .into_iter()
                        .map(|s| s.to_ascii_lowercase())
                        .collect(),
                    resolver: resolver.clone(),
                    issued_at,
                    expires_at,
                });
            }
        }
        Ok(issued)
    }
}

#[async_trait]
impl CertificateSource for AcmeFileSource {
    async fn issued(&self) -> Result<Vec<IssuedCertificate>, ControlError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(ControlError::CertificateSource(format!(
                "failed to read {}: {e}",
                self.path.display()
            ))),
        }
    }
}

/// Validity window of the leaf in a base64-encoded PEM chain.
fn validity(encoded: &str) -> Result<(DateTime<Utc>, DateTime<Utc>), String> {
    let pem_bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| format!("invalid base64: {e}"))?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(&pem_bytes)
        .map_err(|e| format!("failed to parse PEM: {e:?}"))?;
    let (_, cert) = X509Certificate::from_der(&pem.contents)
        .map_err(|e| format!("failed to parse certificate: {e:?}"))?;
    let validity = cert.validity();
    let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
        .ok_or("notBefore out of range")?;
    let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
        .ok_or("notAfter out of range")?;
    Ok((not_before, not_after))
}

/// Whole days left, rounded down. Negative once expired.
pub fn days_until_expiry(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (expires_at - now).num_seconds().div_euclid(SECONDS_PER_DAY)
}

pub fn classify(expires_at: DateTime<Utc>, now: DateTime<Utc>, warning_days: i64) -> CertificateStatus {
    let days = days_until_expiry(expires_at, now);
    if days < 0 {
        CertificateStatus::Expired
    } else if days < warning_days {
        CertificateStatus::Expiring
    } else {
        CertificateStatus::Valid
    }
}

/// A domain moved into a status an operator should hear about.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CertificateEvent {
    pub domain: String,
    pub previous: Option<CertificateStatus>,
    pub status: CertificateStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub days_remaining: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub warning_days: i64,
    /// Resolver recorded for domains nothing has been issued for.
    pub default_resolver: String,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            warning_days: 30,
            default_resolver: "letsencrypt".to_string(),
        }
    }
}

pub struct CertificateMonitor {
    store: Arc<dyn ConfigStore>,
    source: Arc<dyn CertificateSource>,
    lock: Arc<Mutex<()>>,
    metrics: Arc<MetricsRegistry>,
    settings: MonitorSettings,
    events: broadcast::Sender<CertificateEvent>,
}

impl CertificateMonitor {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        source: Arc<dyn CertificateSource>,
        lock: Arc<Mutex<()>>,
        metrics: Arc<MetricsRegistry>,
        settings: MonitorSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            store,
            source,
            lock,
            metrics,
            settings,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CertificateEvent> {
        self.events.subscribe()
    }

    /// One sweep over every tracked domain.
    pub async fn run_once(&self) -> Result<Vec<Certificate>, ControlError> {
        let _guard = self.lock.lock().await;
        let now = Utc::now();

        let existing: BTreeMap<String, Certificate> = self
            .store
            .list_certificates()
            .await?
            .into_iter()
            .map(|c| (c.domain.clone(), c))
            .collect();
        let state = self.store.load_state().await?;

        let mut tracked: BTreeSet<String> = existing.keys().cloned().collect();
        for route in state.active_routes().filter(|r| r.tls_enabled) {
            match RuleMatch::parse(&route.rule) {
                Ok(rule) => tracked.extend(rule.certificate_domains()),
                Err(e) => tracing::warn!(route = %route.name, error = %e, "skipping unparseable rule"),
            }
        }

        let issued = self.source.issued().await?;
        let mut sweep = Vec::with_capacity(tracked.len());
        for domain in tracked {
            let best = issued
                .iter()
                .filter(|c| c.covers(&domain))
                .max_by_key(|c| c.expires_at);
            let previous = existing.get(&domain);
            let certificate = match best {
                Some(cert) => Certificate {
                    domain: domain.clone(),
                    resolver: cert.resolver.clone(),
                    status: classify(cert.expires_at, now, self.settings.warning_days),
                    issued_at: Some(cert.issued_at),
                    expires_at: Some(cert.expires_at),
                    last_checked_at: now,
                },
                None => Certificate {
                    domain: domain.clone(),
                    resolver: previous
                        .map(|p| p.resolver.clone())
                        .unwrap_or_else(|| self.settings.default_resolver.clone()),
                    status: CertificateStatus::Pending,
                    issued_at: None,
                    expires_at: None,
                    last_checked_at: now,
                },
            };
            let previous_status = previous.map(|p| p.status);
            if certificate.status.needs_attention() && previous_status != Some(certificate.status) {
                self.announce(&certificate, previous_status, now);
            }
            sweep.push(certificate);
        }

        self.store.upsert_certificates(&sweep).await?;
        for status in [
            CertificateStatus::Valid,
            CertificateStatus::Expiring,
            CertificateStatus::Expired,
            CertificateStatus::Pending,
        ] {
            let count = sweep.iter().filter(|c| c.status == status).count();
            self.metrics.set_certificate_count(status.as_str(), count as i64);
        }
        tracing::debug!(domains = sweep.len(), "certificate sweep finished");
        Ok(sweep)
    }

    fn announce(&self, certificate: &Certificate, previous: Option<CertificateStatus>, now: DateTime<Utc>) {
        let days_remaining = certificate.expires_at.map(|at| days_until_expiry(at, now));
        switchyard_telemetry::log_certificate_transition!(
            domain = %certificate.domain,
            from = previous.map_or("untracked", |s| s.as_str()),
            to = certificate.status.as_str(),
            days_remaining = days_remaining.unwrap_or_default(),
            "certificate needs attention"
        );
        // No subscribers is fine.
        let _ = self.events.send(CertificateEvent {
            domain: certificate.domain.clone(),
            previous,
            status: certificate.status,
            expires_at: certificate.expires_at,
            days_remaining,
        });
    }

    /// Sweep on `interval` until shutdown.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!(error = %e, "certificate sweep failed");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("certificate monitor stopping");
                    break;
                }
            }
        }
    }
}
