//! Cloud Controller internal API client

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, error};

use crate::errors::StagerError;
use crate::models::staging::StagingResponse;

/// Options for the Cloud Controller client
#[derive(Debug, Clone)]
pub struct CcClientOptions {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub skip_cert_verify: bool,
    pub request_timeout: Duration,
}

impl Default for CcClientOptions {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            username: String::new(),
            password: String::new(),
            skip_cert_verify: false,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Client for the Cloud Controller's internal staging API
pub struct CcClient {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

impl CcClient {
    pub fn new(options: &CcClientOptions) -> Result<Self, StagerError> {
        let client = Client::builder()
            .timeout(options.request_timeout)
            .danger_accept_invalid_certs(options.skip_cert_verify)
            .build()?;

        Ok(Self {
            client,
            base_url: options.base_url.trim_end_matches('/').to_string(),
            username: options.username.clone(),
            password: options.password.clone(),
        })
    }

    /// POST a staging response for the given staging GUID.
    ///
    /// Any non-2xx answer is surfaced as an error; the caller decides
    /// whether the scheduler should redeliver the callback.
    pub async fn staging_complete(
        &self,
        staging_guid: &str,
        response: &StagingResponse,
    ) -> Result<(), StagerError> {
        let url = format!("{}/internal/staging/{}/completed", self.base_url, staging_guid);
        debug!("POST {}", url);

        let result = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(response)
            .send()
            .await?;

        if !result.status().is_success() {
            let status = result.status();
            let body = result.text().await.unwrap_or_default();
            error!("Staging completion POST failed: {} - {}", status, body);
            return Err(StagerError::ResponseDeliveryFailed(format!(
                "{}: {}",
                status, body
            )));
        }

        Ok(())
    }
}
