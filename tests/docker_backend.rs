//! Docker backend unit tests

use std::collections::HashMap;

use axum::{routing::get, Router};
use tokio::net::TcpListener;

use stager::backend::docker::DockerBackend;
use stager::backend::{Backend, Config};
use stager::errors::StagerError;
use stager::http::consul::DockerRegistryClient;
use stager::models::recipe::{emit_progress_for, Action, DownloadAction};
use stager::models::staging::{
    DockerStagingData, EnvironmentVariable, StagingRequest, StagingTaskAnnotation,
    TaskCallbackResponse,
};

const STAGING_GUID: &str = "staging-guid";
const DOCKER_REGISTRY_HOST: &str = "docker-registry.service.cf.internal";

/// Serve a fixed payload from the consul catalog route.
async fn spawn_consul(payload: &'static str) -> String {
    let app = Router::new().route(
        "/v1/catalog/service/docker-registry",
        get(move || async move { payload }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}", addr)
}

fn test_config(consul_cluster: &str, insecure_docker_registry: bool) -> Config {
    Config {
        file_server_url: "http://file-server.com".to_string(),
        cc_uploader_url: "http://cc-uploader.com".to_string(),
        stager_url: "http://the-stager.example.com".to_string(),
        task_domain: "config-task-domain".to_string(),
        consul_cluster: consul_cluster.to_string(),
        docker_registry_address: format!("{}:8080", DOCKER_REGISTRY_HOST),
        docker_staging_stack: "penguin".to_string(),
        insecure_docker_registry,
        min_memory_mb: 0,
        min_disk_mb: 0,
        lifecycles: HashMap::from([(
            "docker".to_string(),
            "docker_lifecycle/docker_app_lifecycle.tgz".to_string(),
        )]),
        ..Default::default()
    }
}

fn docker_backend(config: Config) -> DockerBackend {
    let registry_client = DockerRegistryClient::new(&config.consul_cluster).unwrap();
    DockerBackend::new(config, registry_client)
}

fn staging_request(data: DockerStagingData, cache: bool) -> StagingRequest {
    let mut environment = Vec::new();
    if cache {
        environment.push(EnvironmentVariable {
            name: "DIEGO_DOCKER_CACHE".to_string(),
            value: "true".to_string(),
        });
    }

    StagingRequest {
        app_id: "bunny".to_string(),
        staging_guid: STAGING_GUID.to_string(),
        log_guid: "bunny".to_string(),
        memory_mb: 512,
        disk_mb: 512,
        file_descriptors: 512,
        timeout: 512,
        lifecycle: "docker".to_string(),
        lifecycle_data: Some(serde_json::to_value(data).unwrap()),
        environment,
        ..Default::default()
    }
}

fn busybox_data() -> DockerStagingData {
    DockerStagingData {
        docker_image_url: "busybox".to_string(),
        ..Default::default()
    }
}

fn download_builder_action() -> Action {
    emit_progress_for(
        Action::Download(DownloadAction {
            from: "http://file-server.com/v1/static/docker_lifecycle/docker_app_lifecycle.tgz"
                .to_string(),
            to: "/tmp/docker_app_lifecycle".to_string(),
            cache_key: "docker-lifecycle".to_string(),
            user: "vcap".to_string(),
            ..Default::default()
        }),
        "",
        "",
        "Failed to set up docker environment",
    )
}

fn run_action(task: &stager::models::recipe::TaskRequest) -> &stager::models::recipe::RunAction {
    match &task.serial_actions()[1] {
        Action::EmitProgress(progress) => match progress.action.as_ref() {
            Action::Run(run) => run,
            other => panic!("expected run action, got {:?}", other),
        },
        other => panic!("expected emit progress action, got {:?}", other),
    }
}

#[tokio::test]
async fn test_recipe_without_caching_runs_as_vcap() {
    // The consul cluster must not be consulted: point it at nothing.
    let backend = docker_backend(test_config("http://127.0.0.1:1", false));
    let request = staging_request(busybox_data(), false);

    let task = backend.build_recipe(STAGING_GUID, &request).await.unwrap();

    assert_eq!(task.task_guid, STAGING_GUID);
    assert_eq!(task.domain, "config-task-domain");
    assert!(task.definition.privileged);
    assert_eq!(task.definition.root_fs, "preloaded:penguin");
    assert_eq!(task.definition.result_file, "/tmp/docker-result/result.json");
    assert!(task.definition.egress_rules.is_empty());

    let annotation: StagingTaskAnnotation =
        serde_json::from_str(&task.definition.annotation).unwrap();
    assert_eq!(annotation.lifecycle, "docker");

    let actions = task.serial_actions();
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[0], download_builder_action());

    let run = run_action(&task);
    assert_eq!(run.path, "/tmp/docker_app_lifecycle/builder");
    assert_eq!(run.user, "vcap");
    assert_eq!(
        run.args,
        vec![
            "-outputMetadataJSONFilename",
            "/tmp/docker-result/result.json",
            "-dockerRef",
            "busybox",
        ]
    );
}

#[tokio::test]
async fn test_caching_discovers_registries_and_runs_as_root() {
    let consul =
        spawn_consul(r#"[{"Address": "10.244.2.6"}, {"Address": "10.244.2.7"}]"#).await;
    let backend = docker_backend(test_config(&consul, false));
    let request = staging_request(busybox_data(), true);

    let task = backend.build_recipe(STAGING_GUID, &request).await.unwrap();

    let run = run_action(&task);
    assert_eq!(run.user, "root");
    assert_eq!(
        run.args,
        vec![
            "-outputMetadataJSONFilename",
            "/tmp/docker-result/result.json",
            "-dockerRef",
            "busybox",
            "-cacheDockerImage",
            "-dockerRegistryHost",
            DOCKER_REGISTRY_HOST,
            "-dockerRegistryPort",
            "8080",
            "-dockerRegistryIPs",
            "10.244.2.6,10.244.2.7",
        ]
    );

    // One extra egress rule per discovered registry instance.
    assert_eq!(task.definition.egress_rules.len(), 2);
    for (rule, ip) in task
        .definition
        .egress_rules
        .iter()
        .zip(["10.244.2.6", "10.244.2.7"])
    {
        assert_eq!(rule.protocol, "tcp");
        assert_eq!(rule.destinations, vec![ip.to_string()]);
        assert_eq!(rule.ports, Some(vec![8080]));
    }
}

#[tokio::test]
async fn test_caching_preserves_request_egress_rules() {
    let consul = spawn_consul(r#"[{"Address": "10.244.2.6"}]"#).await;
    let backend = docker_backend(test_config(&consul, false));
    let mut request = staging_request(busybox_data(), true);
    request.egress_rules = vec![stager::models::staging::EgressRule {
        protocol: "udp".to_string(),
        destinations: vec!["0.0.0.0/0".to_string()],
        ports: Some(vec![53]),
        port_range: None,
    }];

    let task = backend.build_recipe(STAGING_GUID, &request).await.unwrap();

    assert_eq!(task.definition.egress_rules.len(), 2);
    assert_eq!(task.definition.egress_rules[0], request.egress_rules[0]);
    assert_eq!(
        task.definition.egress_rules[1].destinations,
        vec!["10.244.2.6"]
    );
}

#[tokio::test]
async fn test_caching_with_insecure_registry_appends_the_registry_address() {
    let consul =
        spawn_consul(r#"[{"Address": "10.244.2.6"}, {"Address": "10.244.2.7"}]"#).await;
    let backend = docker_backend(test_config(&consul, true));
    let request = staging_request(busybox_data(), true);

    let task = backend.build_recipe(STAGING_GUID, &request).await.unwrap();

    let run = run_action(&task);
    let tail: Vec<&str> = run.args.iter().rev().take(2).rev().map(String::as_str).collect();
    assert_eq!(
        tail,
        vec![
            "-insecureDockerRegistries",
            "docker-registry.service.cf.internal:8080",
        ]
    );
}

#[tokio::test]
async fn test_caching_with_credentials_appends_login_arguments() {
    let consul =
        spawn_consul(r#"[{"Address": "10.244.2.6"}, {"Address": "10.244.2.7"}]"#).await;
    let backend = docker_backend(test_config(&consul, true));
    let data = DockerStagingData {
        docker_image_url: "busybox".to_string(),
        docker_login_server: "http://loginServer.com".to_string(),
        docker_user: "user".to_string(),
        docker_password: "password".to_string(),
        docker_email: "email@example.com".to_string(),
    };
    let request = staging_request(data, true);

    let task = backend.build_recipe(STAGING_GUID, &request).await.unwrap();

    let run = run_action(&task);
    assert_eq!(run.user, "root");
    let tail: Vec<&str> = run.args.iter().rev().take(10).rev().map(String::as_str).collect();
    assert_eq!(
        tail,
        vec![
            "-insecureDockerRegistries",
            "docker-registry.service.cf.internal:8080",
            "-dockerLoginServer",
            "http://loginServer.com",
            "-dockerUser",
            "user",
            "-dockerPassword",
            "password",
            "-dockerEmail",
            "email@example.com",
        ]
    );
}

#[tokio::test]
async fn test_empty_registry_catalog_is_an_error_when_caching() {
    let consul = spawn_consul("[]").await;
    let backend = docker_backend(test_config(&consul, true));
    let request = staging_request(busybox_data(), true);

    let err = backend.build_recipe(STAGING_GUID, &request).await.unwrap_err();
    assert!(matches!(err, StagerError::MissingDockerRegistry));
}

#[tokio::test]
async fn test_empty_registry_catalog_is_fine_without_caching() {
    let consul = spawn_consul("[]").await;
    let backend = docker_backend(test_config(&consul, true));
    let request = staging_request(busybox_data(), false);

    assert!(backend.build_recipe(STAGING_GUID, &request).await.is_ok());
}

#[tokio::test]
async fn test_invalid_registry_address_is_rejected_when_caching() {
    let consul = spawn_consul(r#"[{"Address": "10.244.2.6"}]"#).await;
    let mut config = test_config(&consul, false);
    config.docker_registry_address = "no-port-here".to_string();
    let backend = docker_backend(config);
    let request = staging_request(busybox_data(), true);

    let err = backend.build_recipe(STAGING_GUID, &request).await.unwrap_err();
    assert!(matches!(err, StagerError::InvalidDockerRegistryAddress));
}

#[tokio::test]
async fn test_invalid_registry_address_is_rejected_before_discovery() {
    // A malformed address must be reported even when discovery would
    // also fail: the address check comes first.
    let consul = spawn_consul("[]").await;
    let mut config = test_config(&consul, false);
    config.docker_registry_address = "no-port-here".to_string();
    let backend = docker_backend(config);
    let request = staging_request(busybox_data(), true);

    let err = backend.build_recipe(STAGING_GUID, &request).await.unwrap_err();
    assert!(matches!(err, StagerError::InvalidDockerRegistryAddress));

    // Same outcome with no catalog listening at all: the address is
    // rejected without a discovery round-trip.
    let mut config = test_config("http://127.0.0.1:1", false);
    config.docker_registry_address = "no-port-here".to_string();
    let backend = docker_backend(config);

    let err = backend.build_recipe(STAGING_GUID, &request).await.unwrap_err();
    assert!(matches!(err, StagerError::InvalidDockerRegistryAddress));
}

#[tokio::test]
async fn test_missing_docker_image_url_is_rejected() {
    let backend = docker_backend(test_config("http://127.0.0.1:1", false));
    let request = staging_request(DockerStagingData::default(), false);

    let err = backend.build_recipe(STAGING_GUID, &request).await.unwrap_err();
    assert!(matches!(err, StagerError::MissingDockerImageUrl));
}

#[tokio::test]
async fn test_partial_docker_credentials_are_rejected() {
    let backend = docker_backend(test_config("http://127.0.0.1:1", false));
    let data = DockerStagingData {
        docker_image_url: "busybox".to_string(),
        docker_user: "user".to_string(),
        ..Default::default()
    };
    let request = staging_request(data, false);

    let err = backend.build_recipe(STAGING_GUID, &request).await.unwrap_err();
    assert!(matches!(err, StagerError::MissingDockerCredentials));
}

#[tokio::test]
async fn test_missing_app_id_is_rejected() {
    let backend = docker_backend(test_config("http://127.0.0.1:1", false));
    let mut request = staging_request(busybox_data(), false);
    request.app_id = String::new();

    let err = backend.build_recipe(STAGING_GUID, &request).await.unwrap_err();
    assert!(matches!(err, StagerError::MissingAppId));
}

#[test]
fn test_successful_callback_builds_a_staging_response() {
    let backend = docker_backend(test_config("http://127.0.0.1:1", false));
    let result = serde_json::json!({
        "execution_metadata": "metadata",
        "detected_start_command": {"web": "/bin/sh"},
        "docker_image": "cached/busybox",
    });

    let response = backend
        .build_staging_response(&TaskCallbackResponse {
            task_guid: STAGING_GUID.to_string(),
            annotation: r#"{"lifecycle":"docker"}"#.to_string(),
            failed: false,
            result: result.to_string(),
            ..Default::default()
        })
        .unwrap();

    assert_eq!(response.execution_metadata, "metadata");
    assert_eq!(
        response.lifecycle_data,
        Some(serde_json::json!({"docker_image": "cached/busybox"}))
    );
}

#[test]
fn test_failed_callback_is_sanitized() {
    let backend = docker_backend(test_config("http://127.0.0.1:1", false));

    let response = backend
        .build_staging_response(&TaskCallbackResponse {
            task_guid: STAGING_GUID.to_string(),
            annotation: r#"{"lifecycle":"docker"}"#.to_string(),
            failed: true,
            failure_reason: "missing docker registry".to_string(),
            ..Default::default()
        })
        .unwrap();

    let error = response.error.unwrap();
    assert_eq!(error.id, "StagingError");
    assert_eq!(error.message, "missing docker registry");
}
