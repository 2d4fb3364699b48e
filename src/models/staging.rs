//! Staging messages exchanged with the Cloud Controller

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Lifecycle tag for buildpack-based staging
pub const BUILDPACK_LIFECYCLE_NAME: &str = "buildpack";

/// Lifecycle tag for Docker-based staging
pub const DOCKER_LIFECYCLE_NAME: &str = "docker";

/// Name marking a user-provided buildpack; such buildpacks are referenced
/// by URL and are not downloaded ahead of the build.
pub const CUSTOM_BUILDPACK_NAME: &str = "custom";

/// A staging request published by the Cloud Controller on the message bus
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingRequest {
    /// Application identifier
    pub app_id: String,

    /// Correlation key, globally unique per staging request
    pub staging_guid: String,

    /// GUID under which task logs are emitted
    pub log_guid: String,

    pub memory_mb: u32,
    pub disk_mb: u32,
    pub file_descriptors: u64,

    /// Requested staging timeout in seconds; zero or negative means
    /// "use the default"
    pub timeout: i64,

    /// Which staging lifecycle handles this request
    pub lifecycle: String,

    /// Lifecycle-specific payload, interpreted by the selected backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle_data: Option<serde_json::Value>,

    /// Ordered environment for the builder process
    pub environment: Vec<EnvironmentVariable>,

    pub egress_rules: Vec<EgressRule>,
}

/// A single environment variable passed through to the builder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

/// An outbound network rule attached to the staging task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressRule {
    pub protocol: String,

    pub destinations: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<u16>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range: Option<PortRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

/// Lifecycle data carried by a buildpack staging request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildpackStagingData {
    pub app_bits_download_uri: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub build_artifacts_cache_download_uri: String,

    pub build_artifacts_cache_upload_uri: String,

    pub droplet_upload_uri: String,

    pub buildpacks: Vec<Buildpack>,

    pub stack: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Buildpack {
    pub name: String,
    pub key: String,
    pub url: String,
    pub skip_detect: bool,
}

impl Buildpack {
    /// A user-provided buildpack is identified by URL rather than by an
    /// admin buildpack key, and is fetched by the builder itself.
    pub fn is_custom(&self) -> bool {
        self.name == CUSTOM_BUILDPACK_NAME
    }
}

/// Lifecycle data carried by a Docker staging request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerStagingData {
    pub docker_image_url: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub docker_login_server: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub docker_user: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub docker_password: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub docker_email: String,
}

/// Annotation embedded in the staging task and echoed back in its
/// completion callback; the only correlation between the two halves of a
/// staging request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingTaskAnnotation {
    pub lifecycle: String,
}

/// Completion callback delivered by the downstream scheduler
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskCallbackResponse {
    pub task_guid: String,

    /// Annotation string as originally embedded in the task
    pub annotation: String,

    pub failed: bool,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub failure_reason: String,

    /// JSON-encoded lifecycle result written by the builder
    #[serde(skip_serializing_if = "String::is_empty")]
    pub result: String,

    pub created_at: i64,
}

/// Staging response POSTed back to the Cloud Controller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StagingError>,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub execution_metadata: String,

    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub detected_start_command: HashMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle_data: Option<serde_json::Value>,
}

/// Sanitized error reported to the Cloud Controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingError {
    pub id: String,
    pub message: String,
}

/// Result file written by the buildpack builder
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildpackStagingResult {
    pub buildpack_key: String,
    pub detected_buildpack: String,
    pub execution_metadata: String,
    pub detected_start_command: HashMap<String, String>,
}

/// Buildpack-specific portion of a successful staging response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildpackStagingResponse {
    pub buildpack_key: String,
    pub detected_buildpack: String,
}

/// Result file written by the Docker builder
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerStagingResult {
    pub execution_metadata: String,
    pub detected_start_command: HashMap<String, String>,
    pub docker_image: String,
}

/// Docker-specific portion of a successful staging response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerStagingResponse {
    pub docker_image: String,
}
