//! Error types for the stager

use thiserror::Error;

/// Main error type for the stager
///
/// The validation and configuration variants carry stable messages: the
/// error sanitizer matches on them before a response is sent back to the
/// Cloud Controller, so their wording is part of the contract.
#[derive(Error, Debug)]
pub enum StagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("missing app id")]
    MissingAppId,

    #[error("missing app bits download uri")]
    MissingAppBitsDownloadUri,

    #[error("missing lifecycle data")]
    MissingLifecycleData,

    #[error("invalid URI: {0}")]
    InvalidBuildArtifactsCacheUri(String),

    #[error("no compiler defined for requested stack")]
    NoCompilerDefined,

    #[error("invalid compiler URL: {0}")]
    InvalidCompilerUrl(String),

    #[error("missing docker image download url")]
    MissingDockerImageUrl,

    #[error("missing docker registry")]
    MissingDockerRegistry,

    #[error("missing docker credentials")]
    MissingDockerCredentials,

    #[error("invalid docker registry address")]
    InvalidDockerRegistryAddress,

    #[error("unknown lifecycle: {0}")]
    UnknownLifecycle(String),

    #[error("task already exists")]
    TaskAlreadyExists,

    #[error("task not found")]
    TaskNotFound,

    #[error("task submission failed: {0}")]
    TaskSubmissionFailed(String),

    #[error("staging response delivery failed: {0}")]
    ResponseDeliveryFailed(String),

    #[error("discovery error: {0}")]
    DiscoveryError(String),

    #[error("NATS error: {0}")]
    NatsError(String),

    #[error("server error: {0}")]
    ServerError(String),

    #[error("shutdown error: {0}")]
    ShutdownError(String),

    #[error("configuration error: {0}")]
    ConfigError(String),
}
