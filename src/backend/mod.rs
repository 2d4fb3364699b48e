//! Recipe builders for the staging lifecycles
//!
//! A backend turns a staging request into a task recipe for the downstream
//! scheduler, and later turns the task's completion callback back into a
//! staging response for the Cloud Controller. Backends are pure with
//! respect to request state: configuration in, recipe out.

pub mod buildpack;
pub mod docker;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::errors::StagerError;
use crate::models::recipe::TaskRequest;
use crate::models::staging::{StagingError, StagingRequest, StagingResponse, TaskCallbackResponse};

/// Default ceiling on a single staging run
pub const DEFAULT_STAGING_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// CPU weight assigned to staging tasks
pub const STAGING_TASK_CPU_WEIGHT: u32 = 50;

/// Log source tag on every staging task
pub const TASK_LOG_SOURCE: &str = "STG";

/// Static-content route prefix on the file server
pub const FILE_SERVER_STATIC_ROUTE: &str = "/v1/static";

/// Failure reason emitted by the scheduler when no cell has capacity
pub const INSUFFICIENT_RESOURCES_MESSAGE: &str = "insufficient resources";

/// Failure reason emitted by the scheduler when no cell matches the stack
pub const CELL_MISMATCH_MESSAGE: &str = "found no compatible cell";

/// Error identifiers understood by the Cloud Controller
pub const STAGING_ERROR_ID: &str = "StagingError";
pub const INSUFFICIENT_RESOURCES_ID: &str = "InsufficientResources";
pub const NO_COMPATIBLE_CELL_ID: &str = "NoCompatibleCell";

/// Maps an arbitrary failure reason to a stable `{id, message}` pair
pub type Sanitizer = fn(&str) -> StagingError;

/// A staging lifecycle implementation
#[async_trait]
pub trait Backend: Send + Sync {
    /// Lifecycle tag this backend serves, as carried in requests and in
    /// the task annotation
    fn lifecycle_name(&self) -> &'static str;

    /// Convert a staging request into a task ready for submission
    async fn build_recipe(
        &self,
        staging_guid: &str,
        request: &StagingRequest,
    ) -> Result<TaskRequest, StagerError>;

    /// Convert a task completion callback into a staging response
    fn build_staging_response(
        &self,
        callback: &TaskCallbackResponse,
    ) -> Result<StagingResponse, StagerError>;
}

/// Shared backend configuration, immutable after construction
#[derive(Debug, Clone)]
pub struct Config {
    /// Task domain under which staging tasks are registered
    pub task_domain: String,

    /// Externally reachable base URL of this stager, used for the task
    /// completion callback
    pub stager_url: String,

    /// Base URL of the static file server hosting lifecycle binaries
    pub file_server_url: String,

    /// Base URL of the CC uploader fronting droplet/cache uploads
    pub cc_uploader_url: String,

    /// Lifecycle key (`buildpack/<stack>` or `docker`) to download
    /// location for the matching builder bundle
    pub lifecycles: HashMap<String, String>,

    /// Stack used for Docker staging tasks
    pub docker_staging_stack: String,

    /// `host:port` of the private Docker registry (caching mode)
    pub docker_registry_address: String,

    pub insecure_docker_registry: bool,

    /// Base URL of the consul-style catalog used for registry discovery
    pub consul_cluster: String,

    /// Tell builders to skip TLS certificate verification
    pub skip_cert_verify: bool,

    pub min_memory_mb: u32,
    pub min_disk_mb: u32,
    pub min_file_descriptors: u64,

    pub sanitizer: Sanitizer,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            task_domain: String::new(),
            stager_url: String::new(),
            file_server_url: String::new(),
            cc_uploader_url: String::new(),
            lifecycles: HashMap::new(),
            docker_staging_stack: String::new(),
            docker_registry_address: String::new(),
            insecure_docker_registry: false,
            consul_cluster: String::new(),
            skip_cert_verify: false,
            min_memory_mb: 1024,
            min_disk_mb: 3072,
            min_file_descriptors: 0,
            sanitizer: sanitize_error_message,
        }
    }
}

impl Config {
    /// Resolve the download location configured for a lifecycle key.
    ///
    /// Absolute `http`/`https` locations are returned verbatim; bare
    /// filenames are served from the file server's static route; any
    /// other scheme is rejected.
    pub fn lifecycle_download_url(&self, lifecycle_key: &str) -> Result<String, StagerError> {
        let location = match self.lifecycles.get(lifecycle_key) {
            Some(location) if !location.is_empty() => location,
            _ => return Err(StagerError::NoCompilerDefined),
        };

        match Url::parse(location) {
            Ok(parsed) => match parsed.scheme() {
                "http" | "https" => Ok(location.clone()),
                scheme => Err(StagerError::InvalidCompilerUrl(format!(
                    "unknown scheme: '{}'",
                    scheme
                ))),
            },
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let joined = format!(
                    "{}{}/{}",
                    self.file_server_url.trim_end_matches('/'),
                    FILE_SERVER_STATIC_ROUTE,
                    location
                );
                Url::parse(&joined)
                    .map_err(|e| StagerError::InvalidCompilerUrl(e.to_string()))?;
                Ok(joined)
            }
            Err(e) => Err(StagerError::InvalidCompilerUrl(e.to_string())),
        }
    }

    /// Completion callback URL handed to the scheduler for a staging task
    pub fn callback_url(&self, staging_guid: &str) -> String {
        format!(
            "{}/v1/staging/{}/completed",
            self.stager_url.trim_end_matches('/'),
            staging_guid
        )
    }
}

/// Default failure-reason sanitizer.
///
/// Known scheduler-originated reasons keep their message under a matching
/// identifier; anything else collapses to a generic staging error so raw
/// internals never reach the Cloud Controller.
pub fn sanitize_error_message(message: &str) -> StagingError {
    match message {
        INSUFFICIENT_RESOURCES_MESSAGE => StagingError {
            id: INSUFFICIENT_RESOURCES_ID.to_string(),
            message: message.to_string(),
        },
        CELL_MISMATCH_MESSAGE => StagingError {
            id: NO_COMPATIBLE_CELL_ID.to_string(),
            message: message.to_string(),
        },
        "missing docker image download url" | "missing docker registry" => StagingError {
            id: STAGING_ERROR_ID.to_string(),
            message: message.to_string(),
        },
        _ => StagingError {
            id: STAGING_ERROR_ID.to_string(),
            message: "staging failed".to_string(),
        },
    }
}

/// Effective staging timeout: the requested value when positive, the
/// default otherwise
pub fn staging_timeout(request: &StagingRequest) -> Duration {
    if request.timeout > 0 {
        Duration::from_secs(request.timeout as u64)
    } else {
        tracing::info!(
            "Overriding requested timeout {}s for app {} with default {:?}",
            request.timeout,
            request.app_id,
            DEFAULT_STAGING_TIMEOUT
        );
        DEFAULT_STAGING_TIMEOUT
    }
}

/// Resource floors applied to every staging task
pub fn enforced_memory_mb(config: &Config, request: &StagingRequest) -> u32 {
    request.memory_mb.max(config.min_memory_mb)
}

pub fn enforced_disk_mb(config: &Config, request: &StagingRequest) -> u32 {
    request.disk_mb.max(config.min_disk_mb)
}

pub fn enforced_file_descriptors(config: &Config, request: &StagingRequest) -> u64 {
    request.file_descriptors.max(config.min_file_descriptors)
}
