//! Docker registry discovery against a consul-style catalog

use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::errors::StagerError;

const DOCKER_REGISTRY_SERVICE_PATH: &str = "/v1/catalog/service/docker-registry";

/// A single registered docker-registry instance
#[derive(Debug, Clone, Deserialize)]
pub struct ConsulServiceInfo {
    #[serde(rename = "Address")]
    pub address: String,
}

/// Read-only client for the docker-registry service catalog
pub struct DockerRegistryClient {
    client: Client,
    consul_cluster: String,
}

impl DockerRegistryClient {
    pub fn new(consul_cluster: &str) -> Result<Self, StagerError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            consul_cluster: consul_cluster.trim_end_matches('/').to_string(),
        })
    }

    /// List registered docker-registry instances.
    ///
    /// An empty catalog is an error: callers only consult the catalog
    /// when image caching requires a registry to exist.
    pub async fn registry_services(&self) -> Result<Vec<ConsulServiceInfo>, StagerError> {
        let url = format!("{}{}", self.consul_cluster, DOCKER_REGISTRY_SERVICE_PATH);
        debug!("GET {}", url);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(StagerError::DiscoveryError(format!(
                "consul catalog returned {}",
                response.status()
            )));
        }

        let services: Vec<ConsulServiceInfo> = response.json().await?;
        if services.is_empty() {
            return Err(StagerError::MissingDockerRegistry);
        }

        debug!("Discovered {} docker registry instance(s)", services.len());
        Ok(services)
    }
}
