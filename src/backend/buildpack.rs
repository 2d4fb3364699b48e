//! Buildpack staging backend
//!
//! Builds the four-step recipe for a traditional buildpack staging run:
//! download the app bits, fetch the builder + buildpacks (+ cached build
//! artifacts) in parallel, run the builder, then upload the droplet and
//! the refreshed artifacts cache in parallel.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};
use url::Url;

use crate::backend::{
    enforced_disk_mb, enforced_file_descriptors, enforced_memory_mb, staging_timeout, Backend,
    Config, STAGING_TASK_CPU_WEIGHT, TASK_LOG_SOURCE,
};
use crate::errors::StagerError;
use crate::models::recipe::{
    emit_progress_for, parallel, preloaded_root_fs, serial, try_action, with_timeout, Action,
    DownloadAction, ResourceLimits, RunAction, TaskDefinition, TaskRequest, UploadAction,
};
use crate::models::staging::{
    BuildpackStagingData, BuildpackStagingResponse, BuildpackStagingResult, StagingRequest,
    StagingResponse, StagingTaskAnnotation, TaskCallbackResponse, BUILDPACK_LIFECYCLE_NAME,
};

pub const BUILDPACK_BUILDER_EXECUTABLE_PATH: &str = "/tmp/lifecycle/builder";
pub const BUILDPACK_BUILDER_OUTPUT_PATH: &str = "/tmp/result.json";

const BUILD_DIR: &str = "/tmp/app";
const BUILDPACKS_DIR: &str = "/tmp/buildpacks";
const BUILD_ARTIFACTS_CACHE_DIR: &str = "/tmp/cache";
const OUTPUT_BUILD_ARTIFACTS_CACHE: &str = "/tmp/output-cache";
const OUTPUT_DROPLET: &str = "/tmp/droplet";

const DROPLET_UPLOAD_URI_KEY: &str = "droplet_upload_uri";
const BUILD_ARTIFACTS_UPLOAD_URI_KEY: &str = "build_artifacts_upload_uri";
const UPLOAD_TIMEOUT_KEY: &str = "timeout";

const STAGING_USER: &str = "vcap";

const DETECT_NOTICE: &str =
    "No buildpack specified; fetching standard buildpacks to detect and build your application.\n";

pub struct BuildpackBackend {
    config: Config,
}

impl BuildpackBackend {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn validate_request(
        &self,
        request: &StagingRequest,
    ) -> Result<BuildpackStagingData, StagerError> {
        if request.app_id.is_empty() {
            return Err(StagerError::MissingAppId);
        }

        let raw = request
            .lifecycle_data
            .as_ref()
            .ok_or(StagerError::MissingLifecycleData)?;
        let data: BuildpackStagingData = serde_json::from_value(raw.clone())?;

        if data.app_bits_download_uri.is_empty() {
            return Err(StagerError::MissingAppBitsDownloadUri);
        }

        if !data.build_artifacts_cache_download_uri.is_empty() {
            Url::parse(&data.build_artifacts_cache_download_uri)
                .map_err(|e| StagerError::InvalidBuildArtifactsCacheUri(e.to_string()))?;
        }

        Ok(data)
    }

    /// Parallel fetch of the builder, the admin buildpacks, and (best
    /// effort) the build artifacts cache, wrapped in one progress banner.
    fn download_actions(
        &self,
        data: &BuildpackStagingData,
        builder_url: String,
    ) -> Action {
        let mut downloads = vec![emit_progress_for(
            Action::Download(DownloadAction {
                from: builder_url,
                to: "/tmp/lifecycle".to_string(),
                cache_key: format!("buildpack-{}-lifecycle", data.stack),
                user: STAGING_USER.to_string(),
                ..Default::default()
            }),
            "",
            "",
            "Failed to set up staging environment",
        )];

        let mut buildpack_names = Vec::with_capacity(data.buildpacks.len());
        for buildpack in &data.buildpacks {
            if buildpack.is_custom() {
                buildpack_names.push(buildpack.url.clone());
                continue;
            }
            buildpack_names.push(buildpack.name.clone());
            downloads.push(Action::Download(DownloadAction {
                artifact: buildpack.name.clone(),
                from: buildpack.url.clone(),
                to: format!("{}/{:x}", BUILDPACKS_DIR, md5::compute(&buildpack.key)),
                cache_key: buildpack.key.clone(),
                user: STAGING_USER.to_string(),
            }));
        }

        let mut start_message = format!("Downloading buildpacks ({})", buildpack_names.join(", "));

        if !data.build_artifacts_cache_download_uri.is_empty() {
            downloads.push(try_action(Action::Download(DownloadAction {
                artifact: "build artifacts cache".to_string(),
                from: data.build_artifacts_cache_download_uri.clone(),
                to: BUILD_ARTIFACTS_CACHE_DIR.to_string(),
                user: STAGING_USER.to_string(),
                ..Default::default()
            })));
            start_message.push_str(", build artifacts cache");
        }
        start_message.push_str("...");

        if !data.buildpacks.iter().any(|b| b.skip_detect) {
            start_message = format!("{}{}", DETECT_NOTICE, start_message);
        }

        emit_progress_for(
            parallel(downloads),
            &start_message,
            "Downloaded buildpacks",
            "Downloading buildpacks failed",
        )
    }

    /// The builder invocation. The argument list is ordered and
    /// byte-stable: the downstream builder parses it positionally in
    /// tests and caches on it.
    fn run_action(&self, request: &StagingRequest, data: &BuildpackStagingData) -> Action {
        let buildpack_order: Vec<&str> = data.buildpacks.iter().map(|b| b.key.as_str()).collect();

        let skip_detect = data
            .buildpacks
            .first()
            .map(|b| b.skip_detect)
            .unwrap_or(false)
            || (data.buildpacks.len() == 1 && data.buildpacks[0].is_custom());

        let args = vec![
            format!("-buildArtifactsCacheDir={}", BUILD_ARTIFACTS_CACHE_DIR),
            format!("-buildDir={}", BUILD_DIR),
            format!("-buildpackOrder={}", buildpack_order.join(",")),
            format!("-buildpacksDir={}", BUILDPACKS_DIR),
            format!("-outputBuildArtifactsCache={}", OUTPUT_BUILD_ARTIFACTS_CACHE),
            format!("-outputDroplet={}", OUTPUT_DROPLET),
            format!("-outputMetadata={}", BUILDPACK_BUILDER_OUTPUT_PATH),
            format!("-skipCertVerify={}", self.config.skip_cert_verify),
            format!("-skipDetect={}", skip_detect),
        ];

        emit_progress_for(
            Action::Run(RunAction {
                path: BUILDPACK_BUILDER_EXECUTABLE_PATH.to_string(),
                args,
                env: request.environment.clone(),
                resource_limits: ResourceLimits {
                    nofile: Some(enforced_file_descriptors(&self.config, request)),
                },
                user: STAGING_USER.to_string(),
            }),
            "Staging...",
            "Staging complete",
            "Staging failed",
        )
    }

    fn upload_actions(
        &self,
        request: &StagingRequest,
        data: &BuildpackStagingData,
        timeout: Duration,
    ) -> Result<Action, StagerError> {
        let droplet_upload = Action::Upload(UploadAction {
            artifact: "droplet".to_string(),
            from: OUTPUT_DROPLET.to_string(),
            to: self.upload_url(
                &format!("/v1/droplet/{}", request.app_id),
                DROPLET_UPLOAD_URI_KEY,
                &data.droplet_upload_uri,
                timeout,
            )?,
            user: STAGING_USER.to_string(),
        });

        let cache_upload = try_action(Action::Upload(UploadAction {
            artifact: "build artifacts cache".to_string(),
            from: OUTPUT_BUILD_ARTIFACTS_CACHE.to_string(),
            to: self.upload_url(
                &format!("/v1/build_artifacts/{}", request.app_id),
                BUILD_ARTIFACTS_UPLOAD_URI_KEY,
                &data.build_artifacts_cache_upload_uri,
                timeout,
            )?,
            user: STAGING_USER.to_string(),
        }));

        Ok(emit_progress_for(
            parallel(vec![droplet_upload, cache_upload]),
            "Uploading droplet, build artifacts cache...",
            "Uploading complete",
            "Uploading failed",
        ))
    }

    /// CC-uploader URL carrying the original CC-supplied upload URI as a
    /// percent-encoded query parameter.
    fn upload_url(
        &self,
        path: &str,
        uri_key: &str,
        upload_uri: &str,
        timeout: Duration,
    ) -> Result<String, StagerError> {
        let base = format!(
            "{}{}",
            self.config.cc_uploader_url.trim_end_matches('/'),
            path
        );
        let mut url =
            Url::parse(&base).map_err(|e| StagerError::ConfigError(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair(uri_key, upload_uri)
            .append_pair(UPLOAD_TIMEOUT_KEY, &timeout.as_secs().to_string());
        Ok(url.to_string())
    }
}

#[async_trait]
impl Backend for BuildpackBackend {
    fn lifecycle_name(&self) -> &'static str {
        BUILDPACK_LIFECYCLE_NAME
    }

    async fn build_recipe(
        &self,
        staging_guid: &str,
        request: &StagingRequest,
    ) -> Result<TaskRequest, StagerError> {
        info!(
            "Building buildpack staging recipe for app {} ({})",
            request.app_id, staging_guid
        );

        let data = self.validate_request(request)?;

        let builder_url = self
            .config
            .lifecycle_download_url(&format!("buildpack/{}", data.stack))?;

        let timeout = staging_timeout(request);

        let actions = vec![
            Action::Download(DownloadAction {
                artifact: "app package".to_string(),
                from: data.app_bits_download_uri.clone(),
                to: BUILD_DIR.to_string(),
                user: STAGING_USER.to_string(),
                ..Default::default()
            }),
            self.download_actions(&data, builder_url),
            self.run_action(request, &data),
            self.upload_actions(request, &data, timeout)?,
        ];

        let annotation = serde_json::to_string(&StagingTaskAnnotation {
            lifecycle: BUILDPACK_LIFECYCLE_NAME.to_string(),
        })?;

        let definition = TaskDefinition {
            root_fs: preloaded_root_fs(&data.stack),
            memory_mb: enforced_memory_mb(&self.config, request),
            disk_mb: enforced_disk_mb(&self.config, request),
            cpu_weight: STAGING_TASK_CPU_WEIGHT,
            privileged: true,
            log_source: TASK_LOG_SOURCE.to_string(),
            log_guid: request.log_guid.clone(),
            metrics_guid: String::new(),
            result_file: BUILDPACK_BUILDER_OUTPUT_PATH.to_string(),
            completion_callback_url: self.config.callback_url(staging_guid),
            annotation,
            egress_rules: request.egress_rules.clone(),
            action: Some(with_timeout(serial(actions), timeout)),
        };

        debug!("Buildpack staging recipe assembled for {}", staging_guid);

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

        let result: BuildpackStagingResult = serde_json::from_str(&callback.result)?;
        let lifecycle_data = serde_json::to_value(BuildpackStagingResponse {
            buildpack_key: result.buildpack_key,
            detected_buildpack: result.detected_buildpack,
        })?;

        Ok(StagingResponse {
            execution_metadata: result.execution_metadata,
            detected_start_command: result.detected_start_command,
            lifecycle_data: Some(lifecycle_data),
            ..Default::default()
        })
    }
}
