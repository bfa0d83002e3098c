//! Hosted-API client against a wiremock server.

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use letsping::poller::BackoffConfig;
use letsping::{
    ApiFlavor, AskRequest, ClientOptions, DecisionChannel, LetsPing, LetsPingError, Status,
};

fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        initial_delay_ms: 10,
        multiplier: 1.5,
        max_delay_ms: 40,
        jitter_ms: 5,
    }
}

fn client(server: &MockServer, flavor: ApiFlavor) -> LetsPing {
    LetsPing::with_options(
        "lp_test",
        ClientOptions::default()
            .with_base_url(server.uri())
            .with_flavor(flavor)
            .with_backoff(fast_backoff()),
    )
    .unwrap()
}

async fn accept_as(server: &MockServer, submit_path: &str, id: &str) {
    Mock::given(method("POST"))
        .and(path(submit_path))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": id })))
        .mount(server)
        .await;
}

fn refund() -> AskRequest {
    AskRequest::new("stripe", "refund", json!({"amount": 120}))
}

#[tokio::test]
async fn test_ask_polls_until_approved() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/ingest"))
        .and(header("authorization", "Bearer lp_test"))
        .and(header("user-agent", concat!("letsping-rust/", env!("CARGO_PKG_VERSION"))))
        .and(body_partial_json(json!({"service": "stripe", "metadata": {"sdk": "rust"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "req_srv"})))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/status/req_srv"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "PENDING"})))
        .up_to_n_times(2)
        .with_priority(1)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/status/req_srv"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "APPROVED"})))
        .expect(1)
        .mount(&server)
        .await;

    let decision = client(&server, ApiFlavor::Ingest).ask(refund()).await.unwrap();
    assert_eq!(decision.request_id, "req_srv");
    assert_eq!(decision.status, Status::Approved);
    assert_eq!(decision.payload, Some(json!({"amount": 120})));
}

#[tokio::test]
async fn test_patched_payload_and_nested_metadata() {
    let server = MockServer::start().await;
    accept_as(&server, "/ingest", "req_patch").await;
    Mock::given(method("GET"))
        .and(path("/status/req_patch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "APPROVED",
            "patched_payload": {"amount": 50},
            "metadata": {"actor_id": "user_42", "resolved_at": "2026-03-01T12:00:00Z", "method": "dashboard"}
        })))
        .mount(&server)
        .await;

    let decision = client(&server, ApiFlavor::Ingest).ask(refund()).await.unwrap();
    assert_eq!(decision.payload, Some(json!({"amount": 50})));
    assert_eq!(decision.actor_id.as_deref(), Some("user_42"));
    assert_eq!(decision.method.as_deref(), Some("dashboard"));
    assert!(decision.resolved_at.is_some());
}

#[tokio::test]
async fn test_not_found_and_rate_limit_are_retried() {
    let server = MockServer::start().await;
    accept_as(&server, "/ingest", "req_flaky").await;
    Mock::given(method("GET"))
        .and(path("/status/req_flaky"))
        .respond_with(ResponseTemplate::new(404))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/status/req_flaky"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .with_priority(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/status/req_flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "REJECTED",
            "reason": "not today"
        })))
        .mount(&server)
        .await;

    let decision = client(&server, ApiFlavor::Ingest).ask(refund()).await.unwrap();
    assert_eq!(decision.status, Status::Rejected);
    assert_eq!(decision.reason.as_deref(), Some("not today"));
}

#[tokio::test]
async fn test_server_error_during_poll_is_fatal() {
    let server = MockServer::start().await;
    accept_as(&server, "/ingest", "req_500").await;
    Mock::given(method("GET"))
        .and(path("/status/req_500"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": "db down"})))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server, ApiFlavor::Ingest).ask(refund()).await.unwrap_err();
    match err {
        LetsPingError::Api { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "db down");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_unauthorized_submit_maps_to_authentication() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = client(&server, ApiFlavor::Ingest).defer(&refund()).await.unwrap_err();
    assert!(matches!(err, LetsPingError::Authentication));
}

#[tokio::test]
async fn test_wait_times_out_naming_the_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status/req_stuck"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "PENDING"})))
        .mount(&server)
        .await;

    let err = client(&server, ApiFlavor::Ingest)
        .wait("req_stuck", Some(Duration::from_millis(150)))
        .await
        .unwrap_err();
    assert!(matches!(err, LetsPingError::Timeout { ref id } if id == "req_stuck"));
}

#[tokio::test]
async fn test_ask_flavor_endpoints() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ask"))
        .and(body_partial_json(json!({
            "channel": "stripe",
            "description": "Incoming AI Agent Request"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "req_ask"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/requests/req_ask"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "APPROVED"})))
        .mount(&server)
        .await;

    let decision = client(&server, ApiFlavor::Ask).ask(refund()).await.unwrap();
    assert!(decision.is_approved());
}

#[tokio::test]
async fn test_nonblocking_ask_returns_pending() {
    let server = MockServer::start().await;
    accept_as(&server, "/ingest", "req_later").await;

    let decision = client(&server, ApiFlavor::Ingest)
        .ask_nonblocking(&refund())
        .await
        .unwrap();
    assert_eq!(decision.status, Status::Pending);
    assert_eq!(decision.request_id, "req_later");
}

#[tokio::test]
async fn test_invalid_ask_never_reaches_the_server() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut ask = refund();
    ask.service = None;
    let err = client(&server, ApiFlavor::Ingest).defer(&ask).await.unwrap_err();
    assert!(matches!(err, LetsPingError::Validation(_)));
}

#[tokio::test]
async fn test_caller_supplied_id_is_sent_verbatim() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ingest"))
        .and(body_partial_json(json!({"id": "req_mine"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let id = client(&server, ApiFlavor::Ingest)
        .defer(&refund().with_id("req_mine"))
        .await
        .unwrap();
    assert_eq!(id, "req_mine");
}

#[tokio::test]
async fn test_approval_tool_renders_outcomes() {
    let server = MockServer::start().await;
    accept_as(&server, "/ingest", "req_tool").await;
    Mock::given(method("GET"))
        .and(path("/status/req_tool"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "REJECTED",
            "reason": "wrong customer"
        })))
        .mount(&server)
        .await;

    let tool = client(&server, ApiFlavor::Ingest).tool("stripe", "refund");
    assert_eq!(tool.call("refund order 7").await, "ACTION_REJECTED: wrong customer");

    let approving = MockServer::start().await;
    accept_as(&approving, "/ingest", "req_ok").await;
    Mock::given(method("GET"))
        .and(path("/status/req_ok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "APPROVED"})))
        .mount(&approving)
        .await;

    let tool = client(&approving, ApiFlavor::Ingest).tool("stripe", "refund");
    let out = tool.call(r#"{"order": 7}"#).await;
    assert_eq!(serde_json::from_str::<serde_json::Value>(&out).unwrap(), json!({"order": 7}));

    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&broken)
        .await;
    let tool = client(&broken, ApiFlavor::Ingest).tool("stripe", "refund");
    assert!(tool.call("anything").await.starts_with("ERROR:"));
}
