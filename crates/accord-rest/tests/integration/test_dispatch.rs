//! Basic dispatch behavior: request construction, auth, learning, and the
//! untracked bypass for foreign hosts.

use reqwest::Method;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use accord_rest::{DispatchOptions, Route};

use crate::common::{bot_auth, setup, with_ratelimit};

#[tokio::test]
async fn test_dispatch_success_returns_json_body() {
    let (server, client) = setup(bot_auth()).await;

    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .and(header("Authorization", "Bot test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "user-001",
            "username": "tester"
        })))
        .mount(&server)
        .await;

    let response = client
        .dispatch(Route::new(Method::GET, "/users/@me"), DispatchOptions::new())
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["id"], "user-001");
}

#[tokio::test]
async fn test_dispatch_applies_body_query_and_reason() {
    let (server, client) = setup(bot_auth()).await;

    Mock::given(method("POST"))
        .and(path("/channels/42/messages"))
        .and(query_param("wait", "true"))
        .and(body_json(serde_json::json!({"content": "hello"})))
        .and(header("X-Audit-Log-Reason", "integration test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "1"})))
        .mount(&server)
        .await;

    let route = Route::new(Method::POST, "/channels/{channel_id}/messages")
        .param("channel_id", "42");
    let options = DispatchOptions::new()
        .json_body(serde_json::json!({"content": "hello"}))
        .query("wait", "true")
        .audit_log_reason("integration test");

    let response = client.dispatch(route, options).await.unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_dispatch_learns_bucket_hash_from_response() {
    let (server, client) = setup(bot_auth()).await;

    Mock::given(method("GET"))
        .and(path("/channels/7"))
        .respond_with(with_ratelimit(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({})),
            "abcd1234",
            5,
            4,
            2.0,
        ))
        .mount(&server)
        .await;

    let route = Route::new(Method::GET, "/channels/{channel_id}").param("channel_id", "7");
    assert!(client.learned_hash(&route.bucket_path()).is_none());

    client.dispatch(route.clone(), DispatchOptions::new()).await.unwrap();

    assert_eq!(
        client.learned_hash(&route.bucket_path()).as_deref(),
        Some("abcd1234")
    );
    // The bucket was lazily created under the learned hash + major params.
    assert!(client.registry().get("abcd1234.7").is_some());
}

#[tokio::test]
async fn test_untracked_route_bypasses_governor_and_auth() {
    let (_server, client) = setup(bot_auth()).await;
    let foreign = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/asset.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1, 2, 3]))
        .mount(&foreign)
        .await;

    let route = Route::absolute(Method::GET, format!("{}/asset.bin", foreign.uri()));
    let response = client.dispatch(route, DispatchOptions::new()).await.unwrap();
    assert_eq!(response.bytes(), &[1, 2, 3]);

    // Credentials must never leak to a foreign host, and no bucket state
    // is tracked for the call.
    let requests = foreign.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].headers.get("authorization").is_none());
    assert_eq!(client.registry().len(), 0);
}

#[tokio::test]
async fn test_response_without_bucket_info_creates_no_bucket() {
    let (server, client) = setup(bot_auth()).await;

    Mock::given(method("GET"))
        .and(path("/gateway"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"url": "wss://x"})))
        .mount(&server)
        .await;

    client
        .dispatch(Route::new(Method::GET, "/gateway"), DispatchOptions::new())
        .await
        .unwrap();

    assert_eq!(client.registry().len(), 0);
    assert!(client.learned_hash("GET-/gateway").is_none());
}
