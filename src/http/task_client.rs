//! Downstream scheduler task API client

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::errors::StagerError;
use crate::models::recipe::TaskRequest;

/// RPC seam to the downstream task scheduler.
///
/// The scheduler is an opaque collaborator: it accepts a task request and
/// later delivers a completion callback to the outbox.
#[async_trait]
pub trait TaskClient: Send + Sync {
    /// Submit a staging task. Submitting a GUID the scheduler already
    /// knows yields `TaskAlreadyExists`.
    async fn desire_task(&self, task: &TaskRequest) -> Result<(), StagerError>;

    /// Cancel an in-flight staging task by GUID.
    async fn cancel_task(&self, task_guid: &str) -> Result<(), StagerError>;
}

/// HTTP implementation of the scheduler task API
pub struct HttpTaskClient {
    client: Client,
    base_url: String,
}

impl HttpTaskClient {
    pub fn new(base_url: &str) -> Result<Self, StagerError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TaskClient for HttpTaskClient {
    async fn desire_task(&self, task: &TaskRequest) -> Result<(), StagerError> {
        let url = format!("{}/v1/tasks", self.base_url);
        debug!("POST {} ({})", url, task.task_guid);

        let response = self.client.post(&url).json(task).send().await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(StagerError::TaskAlreadyExists),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(StagerError::TaskSubmissionFailed(format!(
                    "{}: {}",
                    status, body
                )))
            }
        }
    }

    async fn cancel_task(&self, task_guid: &str) -> Result<(), StagerError> {
        let url = format!("{}/v1/tasks/{}", self.base_url, task_guid);
        debug!("DELETE {}", url);

        let response = self.client.delete(&url).send().await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(StagerError::TaskNotFound),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(StagerError::TaskSubmissionFailed(format!(
                    "{}: {}",
                    status, body
                )))
            }
        }
    }
}
