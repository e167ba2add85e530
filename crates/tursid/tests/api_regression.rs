//! Control API regression tests.
//!
//! Drives the router with `oneshot` requests and, for the lifecycle tests,
//! a live supervisor running `sh` as the worker program.

use std::collections::HashMap;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;
use tursi_api::build_router;
use tursi_state::*;
use tursi_supervisor::{ProcessWorkerFactory, Supervisor, SupervisorConfig, WorkerCommand};

fn test_store() -> StateStore {
    StateStore::open_in_memory().unwrap()
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn wait_for_status(store: &StateStore, id: DeploymentId, want: DeploymentStatus) -> bool {
    for _ in 0..200 {
        if store.get(id).unwrap().map(|d| d.status) == Some(want) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn health_reports_status_and_version() {
    let router = build_router(test_store());
    let (status, body) = send(&router, "GET", "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn create_list_and_get() {
    let router = build_router(test_store());

    let payload = json!({
        "model_name": "test-model",
        "host": "localhost",
        "port": 5000,
        "config": {"quantization": "dynamic", "bits": 8, "rate_limit": "100/minute"}
    });
    let (status, body) = send(&router, "POST", "/api/v1/models", Some(payload)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");
    let id = body["deployment_id"].as_u64().unwrap();
    assert!(id > 0);

    let (status, body) = send(&router, "GET", "/api/v1/models", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deployments"].as_array().unwrap().len(), 1);
    assert_eq!(body["deployments"][0]["id"], id);

    let (status, body) = send(&router, "GET", &format!("/api/v1/models/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model_name"], "test-model");
    assert_eq!(body["config"]["rate_limit"], "100/minute");
    assert!(body["process_id"].is_null());
}

#[tokio::test]
async fn ids_increase_across_creates() {
    let router = build_router(test_store());
    let mut last = 0;
    for port in 6000..6005 {
        let payload = json!({"model_name": "gpt2", "host": "localhost", "port": port});
        let (_, body) = send(&router, "POST", "/api/v1/models", Some(payload)).await;
        let id = body["deployment_id"].as_u64().unwrap();
        assert!(id > last);
        last = id;
    }
}

#[tokio::test]
async fn create_with_missing_fields() {
    let router = build_router(test_store());
    let (status, body) =
        send(&router, "POST", "/api/v1/models", Some(json!({"model_name": "test-model"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Missing required fields: host, port");
    assert_eq!(body["kind"], "bad_request");
}

#[tokio::test]
async fn create_with_malformed_json() {
    let router = build_router(test_store());
    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/models")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn duplicate_endpoint_conflicts_until_terminal() {
    let store = test_store();
    let router = build_router(store.clone());
    let payload = json!({"model_name": "a", "host": "localhost", "port": 5000});

    let (_, body) = send(&router, "POST", "/api/v1/models", Some(payload.clone())).await;
    let first = body["deployment_id"].as_u64().unwrap();

    let (status, body) = send(&router, "POST", "/api/v1/models", Some(payload.clone())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "constraint");

    store.set_status(first, DeploymentStatus::Failed).unwrap();
    let (status, _) = send(&router, "POST", "/api/v1/models", Some(payload)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn stop_and_missing_ids() {
    let store = test_store();
    let router = build_router(store.clone());
    let id = store
        .create(&NewDeployment::new("test-model", "localhost", 5000, json!({})))
        .unwrap();

    let (status, body) = send(&router, "DELETE", &format!("/api/v1/models/{id}"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["deployment_id"], id);
    assert_eq!(body["status"], "stopping");

    let (status, body) = send(&router, "DELETE", "/api/v1/models/999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");

    let (status, _) = send(&router, "GET", "/api/v1/models/999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&router, "GET", "/api/v1/models/abc", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn logs_and_metrics_newest_first_with_limit() {
    let store = test_store();
    let router = build_router(store.clone());
    let id = store
        .create(&NewDeployment::new("test-model", "localhost", 5000, json!({})))
        .unwrap();
    store.append_log(id, level::INFO, "Test message 1").unwrap();
    store.append_log(id, level::ERROR, "Test message 2").unwrap();
    for i in 0..5 {
        store.append_metric(id, 50.0 + f64::from(i), 1024.0).unwrap();
    }

    let (status, body) = send(&router, "GET", &format!("/api/v1/models/{id}/logs"), None).await;
    assert_eq!(status, StatusCode::OK);
    let logs = body["logs"].as_array().unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0]["message"], "Test message 2");
    assert_eq!(logs[1]["message"], "Test message 1");

    let (_, body) = send(&router, "GET", &format!("/api/v1/models/{id}/logs?limit=1"), None).await;
    assert_eq!(body["logs"].as_array().unwrap().len(), 1);

    let (status, body) =
        send(&router, "GET", &format!("/api/v1/models/{id}/metrics?limit=3"), None).await;
    assert_eq!(status, StatusCode::OK);
    let metrics = body["metrics"].as_array().unwrap();
    assert_eq!(metrics.len(), 3);
    assert_eq!(metrics[0]["cpu_percent"], 54.0);

    let (status, _) =
        send(&router, "GET", &format!("/api/v1/models/{id}/metrics?limit=lots"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[cfg(unix)]
#[tokio::test]
async fn deployment_lifecycle_with_live_supervisor() {
    let store = test_store();
    let router = build_router(store.clone());
    let command = WorkerCommand {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), "sleep 30".to_string(), "worker".to_string()],
        env: HashMap::new(),
    };
    let config = SupervisorConfig {
        reconcile_interval: Duration::from_millis(50),
        health_interval: Duration::from_millis(50),
        stop_grace: Duration::from_secs(2),
        ..SupervisorConfig::default()
    };
    let (supervisor, handle) =
        Supervisor::new(store.clone(), ProcessWorkerFactory::new(command), config);
    let task = tokio::spawn(supervisor.run());

    let payload = json!({"model_name": "gpt2", "host": "127.0.0.1", "port": 8123});
    let (_, body) = send(&router, "POST", "/api/v1/models", Some(payload)).await;
    let id = body["deployment_id"].as_u64().unwrap();

    assert!(wait_for_status(&store, id, DeploymentStatus::Running).await);
    let (_, body) = send(&router, "GET", &format!("/api/v1/models/{id}"), None).await;
    assert_eq!(body["status"], "running");
    assert!(body["process_id"].as_u64().unwrap() > 0);

    let (status, body) = send(&router, "DELETE", &format!("/api/v1/models/{id}"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "stopping");

    assert!(wait_for_status(&store, id, DeploymentStatus::Stopped).await);
    let (_, body) = send(&router, "GET", &format!("/api/v1/models/{id}/logs"), None).await;
    let messages: Vec<_> = body["logs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["message"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(messages[0], "Stopped model process");
    assert!(messages.last().unwrap().starts_with("Started model process with PID"));

    let (status, _) = send(&router, "DELETE", &format!("/api/v1/models/{id}"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    handle.shutdown();
    task.await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn crashed_worker_is_marked_failed() {
    let store = test_store();
    let router = build_router(store.clone());
    let command = WorkerCommand {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), "sleep 0.2; exit 4".to_string(), "worker".to_string()],
        env: HashMap::new(),
    };
    let config = SupervisorConfig {
        reconcile_interval: Duration::from_millis(50),
        health_interval: Duration::from_millis(50),
        ..SupervisorConfig::default()
    };
    let (supervisor, handle) =
        Supervisor::new(store.clone(), ProcessWorkerFactory::new(command), config);
    let task = tokio::spawn(supervisor.run());

    let payload = json!({"model_name": "gpt2", "host": "127.0.0.1", "port": 8124});
    let (_, body) = send(&router, "POST", "/api/v1/models", Some(payload)).await;
    let id = body["deployment_id"].as_u64().unwrap();

    assert!(wait_for_status(&store, id, DeploymentStatus::Failed).await);
    let logs = store.list_logs(id, 10).unwrap();
    assert_eq!(logs[0].level, level::ERROR);
    assert!(logs[0].message.starts_with("Model process exited unexpectedly"));

    // Failed deployments drop out of the active listing.
    let (_, body) = send(&router, "GET", "/api/v1/models", None).await;
    assert!(body["deployments"].as_array().unwrap().is_empty());

    handle.shutdown();
    task.await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn missing_worker_program_fails_deployment() {
    let store = test_store();
    let command = WorkerCommand {
        program: "/nonexistent/tursi-engine".to_string(),
        ..WorkerCommand::default()
    };
    let config = SupervisorConfig {
        reconcile_interval: Duration::from_millis(50),
        ..SupervisorConfig::default()
    };
    let (supervisor, handle) =
        Supervisor::new(store.clone(), ProcessWorkerFactory::new(command), config);
    let task = tokio::spawn(supervisor.run());

    let id = store
        .create(&NewDeployment::new("gpt2", "127.0.0.1", 8125, json!({})))
        .unwrap();
    assert!(wait_for_status(&store, id, DeploymentStatus::Failed).await);
    let logs = store.list_logs(id, 10).unwrap();
    assert!(logs[0].message.starts_with("Failed to start model process:"));

    handle.shutdown();
    task.await.unwrap();
}
