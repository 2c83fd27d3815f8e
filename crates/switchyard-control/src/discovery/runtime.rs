//! Container runtime access. Read-only.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::ControlError;

/// A container as far as discovery cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    /// Name without the runtime's leading `/`.
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub state: String,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>, ControlError>;
}

/// Docker Engine API client (`GET /containers/json`).
pub struct DockerApiRuntime {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerSummary {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    state: String,
}

impl DockerApiRuntime {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ControlError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ControlError::ContainerRuntime(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerApiRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>, ControlError> {
        let url = format!("{}/containers/json", self.endpoint);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ControlError::ContainerRuntime(format!("GET {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(ControlError::ContainerRuntime(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        let summaries: Vec<ContainerSummary> = response
            .json()
            .await
            .map_err(|e| ControlError::ContainerRuntime(format!("invalid container list: {e}")))?;

        Ok(summaries
            .into_iter()
            .map(|c| ContainerInfo {
                name: c
                    .names
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| c.id.chars().take(12).collect()),
                id: c.id,
                labels: c.labels.unwrap_or_default(),
                state: c.state,
            })
            .collect())
    }
}
