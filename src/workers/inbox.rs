//! Staging inbox worker
//!
//! Consumes staging requests from the message bus, builds a task recipe
//! with the matching backend, and submits it to the downstream scheduler.
//! Validation and submission failures are reported straight back to the
//! Cloud Controller as sanitized staging responses; the request itself is
//! never retried here.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::backend::{sanitize_error_message, Backend};
use crate::errors::StagerError;
use crate::http::cc_client::CcClient;
use crate::http::task_client::TaskClient;
use crate::models::staging::{StagingRequest, StagingResponse};

/// Run the inbox worker.
///
/// Each inbound message is handled on its own task: backends are pure, so
/// requests stage in parallel without ordering requirements.
pub async fn run(
    mut subscription: async_nats::Subscriber,
    backends: Arc<HashMap<&'static str, Arc<dyn Backend>>>,
    task_client: Arc<dyn TaskClient>,
    cc_client: Arc<CcClient>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Inbox worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Inbox worker shutting down...");
                let _ = subscription.unsubscribe().await;
                return;
            }
            message = subscription.next() => {
                match message {
                    Some(message) => {
                        let payload = message.payload.to_vec();
                        let backends = backends.clone();
                        let task_client = task_client.clone();
                        let cc_client = cc_client.clone();
                        tokio::spawn(async move {
                            handle_staging_request(
                                &payload,
                                &backends,
                                task_client.as_ref(),
                                &cc_client,
                            )
                            .await;
                        });
                    }
                    None => {
                        warn!("Staging subscription closed, inbox worker stopping");
                        return;
                    }
                }
            }
        }
    }
}

/// Handle a single staging request message end to end.
pub async fn handle_staging_request(
    payload: &[u8],
    backends: &HashMap<&'static str, Arc<dyn Backend>>,
    task_client: &dyn TaskClient,
    cc_client: &CcClient,
) {
    // An undecodable message carries no staging GUID to answer on.
    let request: StagingRequest = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(e) => {
            error!("Dropping undecodable staging request: {}", e);
            return;
        }
    };

    if request.staging_guid.is_empty() {
        error!(
            "Dropping staging request for app {} without a staging guid",
            request.app_id
        );
        return;
    }

    let staging_guid = request.staging_guid.clone();
    debug!("Staging request received for {}", staging_guid);

    let result = match backends.get(request.lifecycle.as_str()) {
        Some(backend) => stage(backend.as_ref(), task_client, &staging_guid, &request).await,
        None => Err(StagerError::UnknownLifecycle(request.lifecycle.clone())),
    };

    if let Err(e) = result {
        warn!("Staging {} failed: {}", staging_guid, e);
        let response = StagingResponse {
            error: Some(sanitize_error_message(&e.to_string())),
            ..Default::default()
        };
        if let Err(post_err) = cc_client.staging_complete(&staging_guid, &response).await {
            error!(
                "Failed to report staging error for {}: {}",
                staging_guid, post_err
            );
        }
    }
}

async fn stage(
    backend: &dyn Backend,
    task_client: &dyn TaskClient,
    staging_guid: &str,
    request: &StagingRequest,
) -> Result<(), StagerError> {
    let task = backend.build_recipe(staging_guid, request).await?;

    match task_client.desire_task(&task).await {
        Ok(()) => {
            info!("Submitted staging task {}", staging_guid);
            Ok(())
        }
        Err(StagerError::TaskAlreadyExists) => {
            // Idempotent redelivery: the scheduler already holds this
            // task and will deliver its callback in due course.
            warn!("Staging task {} already exists, treating as submitted", staging_guid);
            Ok(())
        }
        Err(e) => Err(e),
    }
}
