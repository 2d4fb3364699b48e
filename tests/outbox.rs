//! Outbox HTTP round-trip tests
//!
//! Runs the real callback router against fake Cloud Controller and
//! scheduler endpoints.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, post},
    Json, Router,
};
use tokio::net::TcpListener;

use stager::app::run::build_backends;
use stager::backend::{Backend, Config};
use stager::http::cc_client::{CcClient, CcClientOptions};
use stager::http::task_client::{HttpTaskClient, TaskClient};
use stager::models::staging::{DockerStagingData, StagingRequest, TaskCallbackResponse};
use stager::server::serve::router;
use stager::server::state::ServerState;

#[derive(Clone, Default)]
struct Recorded {
    staging_responses: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
}

async fn spawn_cc(recorded: Recorded, status: StatusCode) -> String {
    async fn handler(
        State((recorded, status)): State<(Recorded, StatusCode)>,
        Path(staging_guid): Path<String>,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        recorded
            .staging_responses
            .lock()
            .unwrap()
            .push((staging_guid, body));
        status
    }

    let app = Router::new()
        .route("/internal/staging/:staging_guid/completed", post(handler))
        .with_state((recorded, status));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Fake scheduler accepting task cancellations for one known GUID.
async fn spawn_scheduler(known_guid: &'static str) -> String {
    async fn handler(Path(task_guid): Path<String>, State(known): State<&'static str>) -> StatusCode {
        if task_guid == known {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::NOT_FOUND
        }
    }

    let app = Router::new()
        .route("/v1/tasks/:task_guid", delete(handler))
        .with_state(known_guid);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn test_config() -> Config {
    Config {
        task_domain: "config-task-domain".to_string(),
        stager_url: "http://the-stager.example.com".to_string(),
        file_server_url: "http://file-server.com".to_string(),
        cc_uploader_url: "http://cc-uploader.com".to_string(),
        consul_cluster: "http://127.0.0.1:1".to_string(),
        docker_staging_stack: "penguin".to_string(),
        docker_registry_address: "registry.internal:8080".to_string(),
        lifecycles: HashMap::from([
            (
                "buildpack/rabbit_hole".to_string(),
                "rabbit-hole-compiler".to_string(),
            ),
            ("docker".to_string(), "docker-lifecycle.tgz".to_string()),
        ]),
        ..Default::default()
    }
}

struct Fixture {
    recorded: Recorded,
    base_url: String,
    client: reqwest::Client,
}

async fn fixture(cc_status: StatusCode) -> Fixture {
    let recorded = Recorded::default();
    let cc_url = spawn_cc(recorded.clone(), cc_status).await;
    let scheduler_url = spawn_scheduler("known-task-guid").await;

    let config = test_config();
    let backends = build_backends(&config).unwrap();

    let cc_client = Arc::new(
        CcClient::new(&CcClientOptions {
            base_url: cc_url,
            username: "internal_user".to_string(),
            password: "internal_password".to_string(),
            skip_cert_verify: false,
            request_timeout: Duration::from_secs(5),
        })
        .unwrap(),
    );
    let task_client: Arc<dyn TaskClient> =
        Arc::new(HttpTaskClient::new(&scheduler_url).unwrap());

    let state = Arc::new(ServerState::new(backends, cc_client, task_client, 4));
    let app = router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Fixture {
        recorded,
        base_url: format!("http://{}", addr),
        client: reqwest::Client::new(),
    }
}

fn buildpack_callback(failed: bool) -> TaskCallbackResponse {
    let result = serde_json::json!({
        "buildpack_key": "ruby-buildpack",
        "detected_buildpack": "Ruby",
        "execution_metadata": "metadata",
        "detected_start_command": {"web": "bundle exec rackup"},
    });

    TaskCallbackResponse {
        task_guid: "a-staging-guid".to_string(),
        annotation: r#"{"lifecycle":"buildpack"}"#.to_string(),
        failed,
        failure_reason: if failed {
            "insufficient resources".to_string()
        } else {
            String::new()
        },
        result: if failed { String::new() } else { result.to_string() },
        created_at: 0,
    }
}

#[tokio::test]
async fn test_successful_callback_is_forwarded_to_cc() {
    let fixture = fixture(StatusCode::OK).await;

    let response = fixture
        .client
        .post(format!("{}/v1/staging/a-staging-guid/completed", fixture.base_url))
        .json(&buildpack_callback(false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let responses = fixture.recorded.staging_responses.lock().unwrap();
    assert_eq!(responses.len(), 1);
    let (guid, body) = &responses[0];
    assert_eq!(guid, "a-staging-guid");
    assert_eq!(body["execution_metadata"], "metadata");
    assert_eq!(body["detected_start_command"]["web"], "bundle exec rackup");
    assert_eq!(body["lifecycle_data"]["buildpack_key"], "ruby-buildpack");
}

#[tokio::test]
async fn test_failed_callback_is_sanitized_and_forwarded() {
    let fixture = fixture(StatusCode::OK).await;

    let response = fixture
        .client
        .post(format!("{}/v1/staging/a-staging-guid/completed", fixture.base_url))
        .json(&buildpack_callback(true))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let responses = fixture.recorded.staging_responses.lock().unwrap();
    assert_eq!(responses[0].1["error"]["id"], "InsufficientResources");
    assert_eq!(responses[0].1["error"]["message"], "insufficient resources");
}

#[tokio::test]
async fn test_malformed_annotation_is_a_bad_request() {
    let fixture = fixture(StatusCode::OK).await;

    let mut callback = buildpack_callback(false);
    callback.annotation = "invalid-json".to_string();

    let response = fixture
        .client
        .post(format!("{}/v1/staging/a-staging-guid/completed", fixture.base_url))
        .json(&callback)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    assert!(fixture.recorded.staging_responses.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_lifecycle_is_a_bad_request() {
    let fixture = fixture(StatusCode::OK).await;

    let mut callback = buildpack_callback(false);
    callback.annotation = r#"{"lifecycle":"condenser"}"#.to_string();

    let response = fixture
        .client
        .post(format!("{}/v1/staging/a-staging-guid/completed", fixture.base_url))
        .json(&callback)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_result_is_a_bad_request() {
    let fixture = fixture(StatusCode::OK).await;

    let mut callback = buildpack_callback(false);
    callback.result = "invalid-json".to_string();

    let response = fixture
        .client
        .post(format!("{}/v1/staging/a-staging-guid/completed", fixture.base_url))
        .json(&callback)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_undeliverable_response_asks_for_redelivery() {
    let fixture = fixture(StatusCode::SERVICE_UNAVAILABLE).await;

    let response = fixture
        .client
        .post(format!("{}/v1/staging/a-staging-guid/completed", fixture.base_url))
        .json(&buildpack_callback(false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_duplicate_callbacks_are_idempotent() {
    let fixture = fixture(StatusCode::OK).await;

    for _ in 0..2 {
        let response = fixture
            .client
            .post(format!("{}/v1/staging/a-staging-guid/completed", fixture.base_url))
            .json(&buildpack_callback(false))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
    }

    // The same response is re-dispatched both times.
    let responses = fixture.recorded.staging_responses.lock().unwrap();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].1, responses[1].1);
}

#[tokio::test]
async fn test_stop_request_cancels_a_known_task() {
    let fixture = fixture(StatusCode::OK).await;

    let response = fixture
        .client
        .delete(format!("{}/v1/staging/known-task-guid", fixture.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_stop_request_for_an_unknown_task_is_not_found() {
    let fixture = fixture(StatusCode::OK).await;

    let response = fixture
        .client
        .delete(format!("{}/v1/staging/unknown-task-guid", fixture.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_route_answers() {
    let fixture = fixture(StatusCode::OK).await;

    let response = fixture
        .client
        .get(format!("{}/health", fixture.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["service"], "stager");
}

#[tokio::test]
async fn test_annotation_round_trips_from_recipe_to_response_builder() {
    let fixture = fixture(StatusCode::OK).await;

    // Build a docker recipe and feed its annotation back through the
    // outbox: the docker response builder must be the one that answers.
    let config = test_config();
    let backends = build_backends(&config).unwrap();
    let docker = backends.get("docker").unwrap();

    let request = StagingRequest {
        app_id: "bunny".to_string(),
        staging_guid: "docker-staging-guid".to_string(),
        lifecycle: "docker".to_string(),
        timeout: 60,
        lifecycle_data: Some(
            serde_json::to_value(DockerStagingData {
                docker_image_url: "busybox".to_string(),
                ..Default::default()
            })
            .unwrap(),
        ),
        ..Default::default()
    };
    let task = docker
        .build_recipe("docker-staging-guid", &request)
        .await
        .unwrap();

    let callback = TaskCallbackResponse {
        task_guid: "docker-staging-guid".to_string(),
        annotation: task.definition.annotation.clone(),
        failed: false,
        result: serde_json::json!({
            "execution_metadata": "metadata",
            "detected_start_command": {"web": "/bin/sh"},
            "docker_image": "cached/busybox",
        })
        .to_string(),
        ..Default::default()
    };

    let response = fixture
        .client
        .post(format!(
            "{}/v1/staging/docker-staging-guid/completed",
            fixture.base_url
        ))
        .json(&callback)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let responses = fixture.recorded.staging_responses.lock().unwrap();
    assert_eq!(
        responses[0].1["lifecycle_data"]["docker_image"],
        "cached/busybox"
    );
}
