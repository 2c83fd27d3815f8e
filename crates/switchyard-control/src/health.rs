//! Proxy health probing used to gate publishes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;

use crate::renderer::Protocol;

/// A router that must be loaded after a publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeTarget {
    pub name: String,
    pub protocol: Protocol,
}

/// Read-only view of the proxy's health and loaded routers.
#[async_trait]
pub trait ProxyProbe: Send + Sync {
    /// Overall proxy health. `Err` carries a human-readable reason.
    async fn health(&self) -> Result<(), String>;

    /// Whether the proxy reports `target` as loaded and enabled.
    async fn router_loaded(&self, target: &ProbeTarget) -> Result<(), String>;
}

/// Probe speaking to the proxy's health endpoint and router API over HTTP.
pub struct HttpProxyProbe {
    client: reqwest::Client,
    health_url: String,
    api_url: Option<String>,
    provider: String,
}

impl HttpProxyProbe {
    pub fn new(
        health_url: impl Into<String>,
        api_url: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            health_url: health_url.into(),
            api_url: api_url.map(|u| u.trim_end_matches('/').to_string()),
            provider: "file".into(),
        })
    }
}

#[async_trait]
impl ProxyProbe for HttpProxyProbe {
    async fn health(&self) -> Result<(), String> {
        let response = self
            .client
            .get(&self.health_url)
            .send()
            .await
            .map_err(|e| format!("health endpoint unreachable: {e}"))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("health endpoint returned {}", response.status()))
        }
    }

    async fn router_loaded(&self, target: &ProbeTarget) -> Result<(), String> {
        let Some(api) = &self.api_url else {
            return Ok(());
        };
        let url = format!(
            "{api}/api/{}/routers/{}@{}",
            target.protocol, target.name, self.provider
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("router API unreachable: {e}"))?;
        if !response.status().is_success() {
            return Err(format!(
                "router '{}' not loaded ({})",
                target.name,
                response.status()
            ));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("router API returned invalid JSON: {e}"))?;
        match body.get("status").and_then(|s| s.as_str()) {
            Some("enabled") | None => Ok(()),
            Some(other) => Err(format!("router '{}' is {other}", target.name)),
        }
    }
}

/// Probe that always reports healthy, for deployments without a proxy API.
pub struct NoopProbe;

#[async_trait]
impl ProxyProbe for NoopProbe {
    async fn health(&self) -> Result<(), String> {
        Ok(())
    }

    async fn router_loaded(&self, _target: &ProbeTarget) -> Result<(), String> {
        Ok(())
    }
}

/// Retry policy for post-publish health checks.
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Hard ceiling on the whole check, retries included.
    pub budget: Duration,
    /// Wait before the first attempt so the proxy can pick up the file.
    pub settle: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(4),
            budget: Duration::from_secs(10),
            settle: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HealthCheckError {
    #[error("unhealthy after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("health check exceeded its {0:?} budget")]
    Timeout(Duration),
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Exponential backoff with up to 10% jitter. `attempt` starts at 1.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow(attempt - 1);
    let delay = base.saturating_mul(factor).min(max);
    let jitter_range = saturating_millis(delay) / 10;
    let jitter = if jitter_range > 0 {
        rand::rng().random_range(0..jitter_range)
    } else {
        0
    };
    delay.saturating_add(Duration::from_millis(jitter))
}

/// Runs the probe with retries inside the policy's time budget.
#[derive(Clone)]
pub struct HealthGate {
    probe: Arc<dyn ProxyProbe>,
    policy: HealthPolicy,
}

impl HealthGate {
    pub fn new(probe: Arc<dyn ProxyProbe>, policy: HealthPolicy) -> Self {
        Self { probe, policy }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Wait until the proxy is healthy and every target is loaded.
    /// Returns the number of attempts used.
    pub async fn wait_healthy(&self, targets: &[ProbeTarget]) -> Result<u32, HealthCheckError> {
        let budget = self.policy.budget;
        tokio::time::timeout(budget, self.poll(targets))
            .await
            .map_err(|_| HealthCheckError::Timeout(budget))?
    }

    /// Single probe pass with no retries.
    pub async fn check_once(&self, targets: &[ProbeTarget]) -> Result<(), String> {
        self.probe.health().await?;
        for target in targets {
            self.probe.router_loaded(target).await?;
        }
        Ok(())
    }

    async fn poll(&self, targets: &[ProbeTarget]) -> Result<u32, HealthCheckError> {
        if !self.policy.settle.is_zero() {
            tokio::time::sleep(self.policy.settle).await;
        }
        let attempts = self.policy.attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.check_once(targets).await {
                Ok(()) => return Ok(attempt),
                Err(reason) => {
                    tracing::debug!(attempt, reason = %reason, "health check attempt failed");
                    last_error = reason;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(backoff_delay(
                    attempt,
                    self.policy.initial_backoff,
                    self.policy.max_backoff,
                ))
                .await;
            }
        }
        Err(HealthCheckError::Exhausted {
            attempts,
            last_error,
        })
    }
}
