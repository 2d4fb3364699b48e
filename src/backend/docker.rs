//! Docker staging backend
//!
//! Two-step recipe: download the docker lifecycle builder, then run it
//! against the requested image. When the request opts into image caching
//! the builder additionally pushes the image into the platform's private
//! registry, which requires registry discovery, extra egress rules, and a
//! root run user.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::backend::{
    enforced_disk_mb, enforced_file_descriptors, enforced_memory_mb, staging_timeout, Backend,
    Config, TASK_LOG_SOURCE,
};
use crate::errors::StagerError;
use crate::http::consul::{ConsulServiceInfo, DockerRegistryClient};
use crate::models::recipe::{
    emit_progress_for, preloaded_root_fs, serial, with_timeout, Action, DownloadAction,
    ResourceLimits, RunAction, TaskDefinition, TaskRequest,
};
use crate::models::staging::{
    DockerStagingData, DockerStagingResponse, DockerStagingResult, EgressRule, StagingRequest,
    StagingResponse, StagingTaskAnnotation, TaskCallbackResponse, DOCKER_LIFECYCLE_NAME,
};

pub const DOCKER_BUILDER_EXECUTABLE_PATH: &str = "/tmp/docker_app_lifecycle/builder";
pub const DOCKER_BUILDER_OUTPUT_PATH: &str = "/tmp/docker-result/result.json";

/// Environment variable opting a request into image caching
const DOCKER_CACHE_VAR: &str = "DIEGO_DOCKER_CACHE";

const DOCKER_REGISTRY_PORT: u16 = 8080;

pub struct DockerBackend {
    config: Config,
    registry_client: DockerRegistryClient,
}

impl DockerBackend {
    pub fn new(config: Config, registry_client: DockerRegistryClient) -> Self {
        Self {
            config,
            registry_client,
        }
    }

    fn validate_request(
        &self,
        request: &StagingRequest,
    ) -> Result<DockerStagingData, StagerError> {
        if request.app_id.is_empty() {
            return Err(StagerError::MissingAppId);
        }

        let raw = request
            .lifecycle_data
            .as_ref()
            .ok_or(StagerError::MissingLifecycleData)?;
        let data: DockerStagingData = serde_json::from_value(raw.clone())?;

        if data.docker_image_url.is_empty() {
            return Err(StagerError::MissingDockerImageUrl);
        }

        // Credentials are all-or-nothing.
        let any_credential = !data.docker_user.is_empty()
            || !data.docker_password.is_empty()
            || !data.docker_email.is_empty();
        let all_credentials = !data.docker_user.is_empty()
            && !data.docker_password.is_empty()
            && !data.docker_email.is_empty();
        if any_credential && !all_credentials {
            return Err(StagerError::MissingDockerCredentials);
        }

        Ok(data)
    }

    fn cache_requested(request: &StagingRequest) -> bool {
        request
            .environment
            .iter()
            .any(|var| var.name == DOCKER_CACHE_VAR && var.value == "true")
    }

    /// Builder arguments for caching mode, in contract order.
    fn caching_arguments(
        &self,
        data: &DockerStagingData,
        host: &str,
        port: &str,
        registries: &[ConsulServiceInfo],
    ) -> Vec<String> {
        let registry_ips: Vec<&str> = registries.iter().map(|s| s.address.as_str()).collect();

        let mut args = vec![
            "-cacheDockerImage".to_string(),
            "-dockerRegistryHost".to_string(),
            host.to_string(),
            "-dockerRegistryPort".to_string(),
            port.to_string(),
            "-dockerRegistryIPs".to_string(),
            registry_ips.join(","),
        ];

        if self.config.insecure_docker_registry {
            args.push("-insecureDockerRegistries".to_string());
            args.push(format!("{}:{}", host, port));
        }

        if !data.docker_login_server.is_empty() {
            args.push("-dockerLoginServer".to_string());
            args.push(data.docker_login_server.clone());
        }

        if !data.docker_user.is_empty() {
            args.push("-dockerUser".to_string());
            args.push(data.docker_user.clone());
            args.push("-dockerPassword".to_string());
            args.push(data.docker_password.clone());
            args.push("-dockerEmail".to_string());
            args.push(data.docker_email.clone());
        }

        args
    }
}

/// One egress rule per discovered registry instance
fn docker_registry_rules(registries: &[ConsulServiceInfo]) -> Vec<EgressRule> {
    registries
        .iter()
        .map(|registry| EgressRule {
            protocol: "tcp".to_string(),
            destinations: vec![registry.address.clone()],
            ports: Some(vec![DOCKER_REGISTRY_PORT]),
            port_range: None,
        })
        .collect()
}

fn split_registry_address(address: &str) -> Result<(&str, &str), StagerError> {
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !port.is_empty() => Ok((host, port)),
        _ => Err(StagerError::InvalidDockerRegistryAddress),
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn lifecycle_name(&self) -> &'static str {
        DOCKER_LIFECYCLE_NAME
    }

    async fn build_recipe(
        &self,
        staging_guid: &str,
        request: &StagingRequest,
    ) -> Result<TaskRequest, StagerError> {
        info!(
            "Building docker staging recipe for app {} ({})",
            request.app_id, staging_guid
        );

        let data = self.validate_request(request)?;

        let builder_url = self.config.lifecycle_download_url(DOCKER_LIFECYCLE_NAME)?;

        let download_builder = emit_progress_for(
            Action::Download(DownloadAction {
                from: builder_url,
                to: "/tmp/docker_app_lifecycle".to_string(),
                cache_key: "docker-lifecycle".to_string(),
                user: "vcap".to_string(),
                ..Default::default()
            }),
            "",
            "",
            "Failed to set up docker environment",
        );

        let mut run_args = vec![
            "-outputMetadataJSONFilename".to_string(),
            DOCKER_BUILDER_OUTPUT_PATH.to_string(),
            "-dockerRef".to_string(),
            data.docker_image_url.clone(),
        ];
        let mut run_user = "vcap";
        let mut egress_rules = request.egress_rules.clone();

        if Self::cache_requested(request) {
            run_user = "root";

            // The registry address must be well-formed before the
            // catalog is consulted.
            let (host, port) = split_registry_address(&self.config.docker_registry_address)?;

            let registries = self.registry_client.registry_services().await?;
            egress_rules.extend(docker_registry_rules(&registries));
            run_args.extend(self.caching_arguments(&data, host, port, &registries));
        }

        let run_builder = emit_progress_for(
            Action::Run(RunAction {
                path: DOCKER_BUILDER_EXECUTABLE_PATH.to_string(),
                args: run_args,
                env: request.environment.clone(),
                resource_limits: ResourceLimits {
                    nofile: Some(enforced_file_descriptors(&self.config, request)),
                },
                user: run_user.to_string(),
            }),
            "Staging...",
            "Staging Complete",
            "Staging Failed",
        );

        let annotation = serde_json::to_string(&StagingTaskAnnotation {
            lifecycle: DOCKER_LIFECYCLE_NAME.to_string(),
        })?;

        let timeout = staging_timeout(request);

        let definition = TaskDefinition {
            root_fs: preloaded_root_fs(&self.config.docker_staging_stack),
            memory_mb: enforced_memory_mb(&self.config, request),
            disk_mb: enforced_disk_mb(&self.config, request),
            privileged: true,
            log_source: TASK_LOG_SOURCE.to_string(),
            log_guid: request.log_guid.clone(),
            metrics_guid: String::new(),
            result_file: DOCKER_BUILDER_OUTPUT_PATH.to_string(),
            completion_callback_url: self.config.callback_url(staging_guid),
            annotation,
            egress_rules,
            action: Some(with_timeout(
                serial(vec![download_builder, run_builder]),
                timeout,
            )),
            ..Default::default()
        };

        debug!("Docker staging recipe assembled for {}", staging_guid);

        Ok(TaskRequest {
            task_guid: staging_guid.to_string(),
            domain: self.config.task_domain.clone(),
            definition,
        })
    }

    fn build_staging_response(
        &self,
        callback: &TaskCallbackResponse,
    ) -> Result<StagingResponse, StagerError> {
        let _: StagingTaskAnnotation = serde_json::from_str(&callback.annotation)?;

        if callback.failed {
            return Ok(StagingResponse {
                error: Some((self.config.sanitizer)(&callback.failure_reason)),
                ..Default::default()
            });
        }

        let result: DockerStagingResult = serde_json::from_str(&callback.result)?;
        let lifecycle_data = serde_json::to_value(DockerStagingResponse {
            docker_image: result.docker_image,
        })?;

        Ok(StagingResponse {
            execution_metadata: result.execution_metadata,
            detected_start_command: result.detected_start_command,
            lifecycle_data: Some(lifecycle_data),
            ..Default::default()
        })
    }
}
