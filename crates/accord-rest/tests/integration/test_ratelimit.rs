//! Rate-limit governance end to end: per-bucket serialization, automatic 429
//! retries, the global limit, pre-emptive locking, and idle eviction.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Method;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use accord_rest::{DispatchOptions, RestError, Route};

use crate::common::{bearer_auth, bot_auth, setup, setup_with, too_many_requests, with_ratelimit};

fn channel_route(id: &str) -> Route {
    Route::new(Method::GET, "/channels/{channel_id}").param("channel_id", id)
}

#[tokio::test]
async fn test_dispatches_serialize_within_one_bucket() {
    let (server, client) = setup(bot_auth()).await;

    Mock::given(method("GET"))
        .and(path("/channels/1"))
        .respond_with(
            with_ratelimit(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({})),
                "cb",
                10,
                9,
                2.0,
            )
            .set_delay(Duration::from_millis(100)),
        )
        .mount(&server)
        .await;

    // First dispatch learns the bucket hash.
    client
        .dispatch(channel_route("1"), DispatchOptions::new())
        .await
        .unwrap();

    // Two concurrent dispatches against the learned bucket must go one at a
    // time: combined wall time is at least two full server delays.
    let start = Instant::now();
    let (a, b) = futures_util::future::join(
        client.dispatch(channel_route("1"), DispatchOptions::new()),
        client.dispatch(channel_route("1"), DispatchOptions::new()),
    )
    .await;
    a.unwrap();
    b.unwrap();

    assert!(
        start.elapsed() >= Duration::from_millis(180),
        "concurrent dispatches overlapped on one bucket: {:?}",
        start.elapsed()
    );
}

#[tokio::test]
async fn test_429_is_retried_transparently() {
    let (server, client) = setup(bot_auth()).await;

    Mock::given(method("GET"))
        .and(path("/channels/1"))
        .respond_with(too_many_requests("cb", 0.3))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/channels/1"))
        .respond_with(with_ratelimit(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "1"})),
            "cb",
            5,
            4,
            2.0,
        ))
        .mount(&server)
        .await;

    let start = Instant::now();
    let response = client
        .dispatch(channel_route("1"), DispatchOptions::new())
        .await
        .unwrap();

    // The caller observes only the eventual success, after the lock window.
    assert_eq!(response.status(), 200);
    assert!(
        start.elapsed() >= Duration::from_millis(280),
        "retry did not wait out the lock: {:?}",
        start.elapsed()
    );
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_429_with_error_on_ratelimit_rejects_immediately() {
    let (server, client) = setup(bot_auth()).await;

    Mock::given(method("GET"))
        .and(path("/channels/1"))
        .respond_with(too_many_requests("cb", 0.3))
        .mount(&server)
        .await;

    let start = Instant::now();
    let err = client
        .dispatch(
            channel_route("1"),
            DispatchOptions::new().error_on_ratelimit(),
        )
        .await
        .unwrap_err();

    match err {
        RestError::Ratelimited {
            retry_after,
            global,
            ..
        } => {
            assert_eq!(retry_after, Duration::from_millis(300));
            assert!(!global);
        }
        other => panic!("expected Ratelimited, got {:?}", other),
    }
    assert!(
        start.elapsed() < Duration::from_millis(200),
        "error_on_ratelimit must not retry"
    );
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_429_with_unusable_retry_delay_backs_off() {
    let (server, client) = setup(bot_auth()).await;

    // An HTTP-date Retry-After already in the past yields no usable delay;
    // the dispatcher must fall back to a real backoff instead of resending
    // in a hot loop.
    Mock::given(method("GET"))
        .and(path("/channels/1"))
        .respond_with(
            ResponseTemplate::new(429)
                .append_header("X-RateLimit-Bucket", "cb")
                .append_header("Retry-After", "Fri, 31 Dec 1999 23:59:59 GMT")
                .set_body_json(serde_json::json!({"message": "rate limited"})),
        )
        .mount(&server)
        .await;

    let result = tokio::time::timeout(
        Duration::from_millis(400),
        client.dispatch(channel_route("1"), DispatchOptions::new()),
    )
    .await;

    assert!(result.is_err(), "dispatch should be waiting out the backoff");
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_429_without_resolvable_bucket_is_a_hard_failure() {
    let (server, client) = setup(bot_auth()).await;

    // A 429 with no bucket hash header: in learned-hash mode there is
    // nothing to requeue against, so silent retry is not acceptable.
    Mock::given(method("GET"))
        .and(path("/channels/1"))
        .respond_with(
            ResponseTemplate::new(429)
                .append_header("Retry-After", "1")
                .set_body_json(serde_json::json!({"message": "rate limited"})),
        )
        .mount(&server)
        .await;

    let err = client
        .dispatch(channel_route("1"), DispatchOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RestError::BucketDesync { .. }));
}

#[tokio::test]
async fn test_global_429_holds_unrelated_routes() {
    let (server, client) = setup(bot_auth()).await;
    let client = Arc::new(client);

    Mock::given(method("GET"))
        .and(path("/guilds/9"))
        .respond_with(
            too_many_requests("gb", 0.5).append_header("X-RateLimit-Global", "true"),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/guilds/9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&server)
        .await;

    let guild_route = Route::new(Method::GET, "/guilds/{guild_id}").param("guild_id", "9");
    let first = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client.dispatch(guild_route, DispatchOptions::new()).await
        })
    };

    // Give the first dispatch time to hit the global 429 and lock.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(client.registry().global().is_locked());

    // An unrelated route is held until the global bucket unlocks.
    let start = Instant::now();
    client
        .dispatch(Route::new(Method::GET, "/users/@me"), DispatchOptions::new())
        .await
        .unwrap();
    assert!(
        start.elapsed() >= Duration::from_millis(200),
        "unrelated route was not held by the global lock: {:?}",
        start.elapsed()
    );

    first.await.unwrap().unwrap();
    assert!(!client.registry().global().is_locked());
}

#[tokio::test]
async fn test_final_permit_preemptively_locks_bucket() {
    let (server, client) = setup(bearer_auth()).await;

    Mock::given(method("GET"))
        .and(path("/channels/5"))
        .respond_with(with_ratelimit(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({})),
            "cb",
            5,
            1,
            0.5,
        ))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/channels/5"))
        .respond_with(with_ratelimit(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({})),
            "cb",
            5,
            4,
            0.5,
        ))
        .mount(&server)
        .await;

    // First response reports remaining=1.
    client
        .dispatch(channel_route("5"), DispatchOptions::new())
        .await
        .unwrap();

    // The second dispatch consumes the final permit and proceeds, locking
    // the bucket behind itself.
    let start = Instant::now();
    client
        .dispatch(channel_route("5"), DispatchOptions::new())
        .await
        .unwrap();
    assert!(start.elapsed() < Duration::from_millis(200));

    // The third waits out the window.
    let start = Instant::now();
    client
        .dispatch(channel_route("5"), DispatchOptions::new())
        .await
        .unwrap();
    assert!(
        start.elapsed() >= Duration::from_millis(250),
        "burst slipped through the final permit: {:?}",
        start.elapsed()
    );
}

#[tokio::test]
async fn test_exhausted_window_prelocks_before_429() {
    let (server, client) = setup(bearer_auth()).await;

    Mock::given(method("GET"))
        .and(path("/channels/5"))
        .respond_with(with_ratelimit(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({})),
            "cb",
            5,
            0,
            0.4,
        ))
        .mount(&server)
        .await;

    client
        .dispatch(channel_route("5"), DispatchOptions::new())
        .await
        .unwrap();

    // remaining=0 on a non-429 locks the bucket for the reported reset, so
    // the next dispatch waits instead of collecting a near-certain 429.
    let start = Instant::now();
    client
        .dispatch(channel_route("5"), DispatchOptions::new())
        .await
        .unwrap();
    assert!(
        start.elapsed() >= Duration::from_millis(300),
        "dispatch did not wait for the exhausted window: {:?}",
        start.elapsed()
    );
}

#[tokio::test]
async fn test_idle_bucket_is_evicted() {
    let (server, client) = setup_with(bearer_auth(), |config| {
        config
            .with_bucket_expiry(Duration::from_millis(100))
            .with_sweep_interval(Duration::from_millis(50))
    })
    .await;

    Mock::given(method("GET"))
        .and(path("/channels/5"))
        .respond_with(with_ratelimit(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({})),
            "cb",
            5,
            4,
            2.0,
        ))
        .mount(&server)
        .await;

    client
        .dispatch(channel_route("5"), DispatchOptions::new())
        .await
        .unwrap();
    assert_eq!(client.registry().len(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(client.registry().len(), 0);
}
