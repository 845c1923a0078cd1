//! Throttle handling through the shared pacer

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pandrive_api::ErrorKind;

use crate::common::{api_client, failed, fast_pacer, ok};

#[derive(Debug, serde::Deserialize)]
struct Info {
    name: String,
}

async fn mount_throttled_then_ok(server: &MockServer, route: &str, throttled: u64) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_json(failed(770004, "too many requests")))
        .up_to_n_times(throttled)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok(serde_json::json!({"name": "ok"}))))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_throttle_code_waits_for_cooldown_then_succeeds() {
    let server = MockServer::start().await;
    mount_throttled_then_ok(&server, "/open/user/info", 1).await;
    let client = api_client(&server, fast_pacer(Duration::from_millis(200)));

    let url = client.api_url("/open/user/info");
    let started = Instant::now();
    let info: Info = client
        .call("user info", &CancellationToken::new(), |http| http.get(&url))
        .await
        .expect("call after throttle failed");

    assert_eq!(info.name, "ok");
    assert!(started.elapsed() >= Duration::from_millis(190), "{:?}", started.elapsed());
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
    assert!(client.pacer().blocked_for().is_none());
}

#[tokio::test]
async fn test_throttle_outlasting_max_attempts_still_succeeds() {
    let server = MockServer::start().await;
    // One more throttled answer than the retry policy has attempts
    mount_throttled_then_ok(&server, "/open/user/info", 4).await;
    let client = api_client(&server, fast_pacer(Duration::from_millis(50)));

    let url = client.api_url("/open/user/info");
    let started = Instant::now();
    let info: Info = client
        .call("user info", &CancellationToken::new(), |http| http.get(&url))
        .await
        .expect("call failed although the throttle cleared");

    assert_eq!(info.name, "ok");
    assert_eq!(server.received_requests().await.unwrap().len(), 5);
    assert!(started.elapsed() >= Duration::from_millis(190), "{:?}", started.elapsed());
}

#[tokio::test]
async fn test_persistent_throttle_ends_on_cancel() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/open/user/info"))
        .respond_with(ResponseTemplate::new(200).set_body_json(failed(770004, "too many requests")))
        .mount(&server)
        .await;
    let client = api_client(&server, fast_pacer(Duration::from_millis(20)));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let url = client.api_url("/open/user/info");
    let err = client
        .call::<Info, _>("user info", &cancel, |http| http.get(&url))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(server.received_requests().await.unwrap().len() > 3);
}

#[tokio::test]
async fn test_retry_after_header_extends_wait() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/open/user/info"))
        .respond_with(ResponseTemplate::new(429).append_header("Retry-After", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/open/user/info"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok(serde_json::json!({"name": "ok"}))))
        .mount(&server)
        .await;
    let client = api_client(&server, fast_pacer(Duration::from_millis(20)));

    let url = client.api_url("/open/user/info");
    let started = Instant::now();
    let info: Info = client
        .call("user info", &CancellationToken::new(), |http| http.get(&url))
        .await
        .expect("call after 429 failed");

    assert_eq!(info.name, "ok");
    assert!(started.elapsed() >= Duration::from_millis(950), "{:?}", started.elapsed());
}

#[tokio::test]
async fn test_cooldown_applies_to_every_client_sharing_the_pacer() {
    let server = MockServer::start().await;
    mount_throttled_then_ok(&server, "/open/a", 1).await;
    Mock::given(method("GET"))
        .and(path("/open/b"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok(serde_json::json!({"name": "ok"}))))
        .mount(&server)
        .await;

    let pacer = fast_pacer(Duration::from_millis(300));
    let first = api_client(&server, pacer.clone());
    let second = api_client(&server, pacer);
    let cancel = CancellationToken::new();

    let throttled = {
        let client = first.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let url = client.api_url("/open/a");
            client
                .call::<Info, _>("a", &cancel, |http| http.get(&url))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let url = second.api_url("/open/b");
    let info: Info = second
        .call("b", &cancel, |http| http.get(&url))
        .await
        .expect("second client call failed");

    assert_eq!(info.name, "ok");
    assert!(started.elapsed() >= Duration::from_millis(150), "{:?}", started.elapsed());
    throttled.await.unwrap().expect("throttled call failed");
}
