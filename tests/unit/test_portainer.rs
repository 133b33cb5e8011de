//! Portainer client tests against a mock API

use std::time::Duration;

use httpmock::MockServer;
use serde_json::json;
use stackwatch::config::PortainerSettings;
use stackwatch::errors::{AgentError, ErrorKind};
use stackwatch::portainer::{DeployOutcome, PortainerClient};
use stackwatch::shutdown::shutdown_channel;

const STACK_YAML: &str = "services:\n  stg_web:\n    image: web:1.0\n";
const DIGEST: &str = "0123456789abcdef0123456789abcdef";

fn settings(server: &MockServer, endpoint_id: i64) -> PortainerSettings {
    PortainerSettings {
        url: server.base_url(),
        endpoint_id,
        username: "admin".to_string(),
        password: "adminpass".to_string(),
        stack_name: "deployment-agent".to_string(),
    }
}

fn client(server: &MockServer, endpoint_id: i64) -> PortainerClient {
    PortainerClient::new(
        settings(server, endpoint_id),
        Duration::from_secs(5),
        Duration::from_secs(10),
    )
    .unwrap()
}

async fn mock_auth(server: &MockServer) -> httpmock::Mock<'_> {
    server
        .mock_async(|when, then| {
            when.method("POST").path("/api/auth");
            then.status(200).json_body(json!({ "jwt": "tok123" }));
        })
        .await
}

#[tokio::test]
async fn test_authenticate_returns_bearer_token() {
    let server = MockServer::start_async().await;
    let auth = mock_auth(&server).await;

    let client = client(&server, 2);
    let token = client.authenticate().await.unwrap();
    assert_eq!(token, "tok123");
    auth.assert_async().await;
}

#[tokio::test]
async fn test_first_deploy_creates_stack() {
    let server = MockServer::start_async().await;
    mock_auth(&server).await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/api/endpoints");
            then.status(200).json_body(json!([{ "Id": 2 }]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method("GET")
                .path("/api/endpoints/2/docker/swarm")
                .header("authorization", "Bearer tok123");
            then.status(200).json_body(json!({ "ID": "swarm-1" }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/api/stacks");
            then.status(200).json_body(json!([]));
        })
        .await;
    let create = server
        .mock_async(|when, then| {
            when.method("POST")
                .path("/api/stacks")
                .query_param("type", "1")
                .query_param("method", "string")
                .query_param("endpointId", "2");
            then.status(200).json_body(json!({
                "Id": 7,
                "Name": "deployment-agent",
                "Status": 1
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/api/stacks/7");
            then.status(200).json_body(json!({
                "Id": 7,
                "Name": "deployment-agent",
                "Status": 1
            }));
        })
        .await;

    let client = client(&server, -1);
    let (_handle, token) = shutdown_channel();
    let outcome = client
        .publish(STACK_YAML, DIGEST, None, &token)
        .await
        .unwrap();

    assert_eq!(outcome, DeployOutcome::Created);
    create.assert_async().await;
}

#[tokio::test]
async fn test_existing_stack_is_updated() {
    let server = MockServer::start_async().await;
    mock_auth(&server).await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/api/endpoints/2/docker/swarm");
            then.status(200).json_body(json!({ "ID": "swarm-1" }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/api/stacks");
            then.status(200).json_body(json!([{
                "Id": 7,
                "Name": "deployment-agent",
                "Status": 1
            }]));
        })
        .await;
    let update = server
        .mock_async(|when, then| {
            when.method("PUT")
                .path("/api/stacks/7")
                .query_param("endpointId", "2");
            then.status(200).json_body(json!({ "Id": 7 }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/api/stacks/7");
            then.status(200).json_body(json!({
                "Id": 7,
                "Name": "deployment-agent",
                "Status": 1
            }));
        })
        .await;

    let client = client(&server, 2);
    let (_handle, token) = shutdown_channel();
    let outcome = client
        .publish(STACK_YAML, DIGEST, Some("different-digest"), &token)
        .await
        .unwrap();

    assert_eq!(outcome, DeployOutcome::Updated);
    update.assert_async().await;
}

#[tokio::test]
async fn test_equal_digest_with_active_stack_is_a_noop() {
    let server = MockServer::start_async().await;
    mock_auth(&server).await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/api/endpoints/2/docker/swarm");
            then.status(200).json_body(json!({ "ID": "swarm-1" }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/api/stacks");
            then.status(200).json_body(json!([{
                "Id": 7,
                "Name": "deployment-agent",
                "Status": 1
            }]));
        })
        .await;
    let update = server
        .mock_async(|when, then| {
            when.method("PUT").path("/api/stacks/7");
            then.status(200).json_body(json!({ "Id": 7 }));
        })
        .await;

    let client = client(&server, 2);
    let (_handle, token) = shutdown_channel();
    let outcome = client
        .publish(STACK_YAML, DIGEST, Some(DIGEST), &token)
        .await
        .unwrap();

    assert_eq!(outcome, DeployOutcome::Unchanged);
    assert_eq!(update.hits_async().await, 0);
}

#[tokio::test]
async fn test_stack_name_matching_is_case_sensitive() {
    let server = MockServer::start_async().await;
    mock_auth(&server).await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/api/endpoints/2/docker/swarm");
            then.status(200).json_body(json!({ "ID": "swarm-1" }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/api/stacks");
            then.status(200).json_body(json!([{
                "Id": 7,
                "Name": "Deployment-Agent",
                "Status": 1
            }]));
        })
        .await;

    let client = client(&server, 2);
    let found = client.find_stack("swarm-1").await.unwrap();
    assert!(found.is_none());
}

#[tokio::test]
async fn test_rejected_create_is_classified() {
    let server = MockServer::start_async().await;
    mock_auth(&server).await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/api/endpoints/2/docker/swarm");
            then.status(200).json_body(json!({ "ID": "swarm-1" }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/api/stacks");
            then.status(200).json_body(json!([]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method("POST").path("/api/stacks");
            then.status(400).body("invalid stack file");
        })
        .await;

    let client = client(&server, 2);
    let (_handle, token) = shutdown_channel();
    let err = client
        .publish(STACK_YAML, DIGEST, None, &token)
        .await
        .expect_err("must fail");

    assert_eq!(err.kind(), ErrorKind::OrchestratorRejected);
}

#[tokio::test]
async fn test_endpoint_discovery_requires_exactly_one() {
    let server = MockServer::start_async().await;
    mock_auth(&server).await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/api/endpoints");
            then.status(200)
                .json_body(json!([{ "Id": 1 }, { "Id": 2 }]));
        })
        .await;

    let client = client(&server, -1);
    let err = client.resolve_endpoint_id().await.expect_err("must fail");
    assert!(matches!(err, AgentError::OrchestratorRejected(_)));
}

#[test]
fn test_uppercase_stack_name_rejected_at_construction() {
    let settings = PortainerSettings {
        url: "https://portainer.example.com".to_string(),
        endpoint_id: 1,
        username: "admin".to_string(),
        password: "pass".to_string(),
        stack_name: "Deployment-Agent".to_string(),
    };
    let err = PortainerClient::new(settings, Duration::from_secs(5), Duration::from_secs(5))
        .expect_err("must fail");
    assert!(matches!(err, AgentError::ConfigInvalid(_)));
}
