//! Download URL caching and content pulls

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures_util::future::join_all;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pandrive_api::ApiError;
use pandrive_core::{
    config::UploadMode,
    domain::{ByteRange, RemoteObject},
    ports::{IRemoteStorage, RemoteReader},
};

use crate::common::{ok, FlatResolver, Harness, PARENT_ID};

const PICK_CODE: &str = "pc-download";
const CONTENT: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

fn cdn_url(server: &MockServer, expiring: bool) -> String {
    if expiring {
        let t = (Utc::now() + chrono::Duration::hours(1)).timestamp();
        format!("{}/cdn/a.bin?t={}&sign=x", server.uri(), t)
    } else {
        format!("{}/cdn/a.bin", server.uri())
    }
}

async fn mount_downurl(server: &MockServer, url: String, delay: Duration, times: u64) {
    Mock::given(method("POST"))
        .and(path("/open/ufile/downurl"))
        .and(body_string_contains(format!("pick_code={}", PICK_CODE)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(ok(serde_json::json!({
                    "2593093001609739968": {
                        "file_name": "a.bin",
                        "file_size": CONTENT.len(),
                        "pick_code": PICK_CODE,
                        "url": {"url": url}
                    }
                })))
                .set_delay(delay),
        )
        .expect(times)
        .mount(server)
        .await;
}

async fn mount_cdn(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/cdn/a.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(CONTENT.to_vec()))
        .mount(server)
        .await;
}

async fn read_all(mut reader: RemoteReader) -> Vec<u8> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.expect("read failed");
    buf
}

#[tokio::test]
async fn test_download_url_is_cached_until_expiry() {
    let harness = Harness::logged_in().await;
    mount_downurl(&harness.server, cdn_url(&harness.server, true), Duration::ZERO, 1).await;
    mount_cdn(&harness.server).await;

    let downloads = harness.downloads();
    let cancel = CancellationToken::new();
    for _ in 0..2 {
        let reader = downloads.open(PICK_CODE, None, &cancel).await.unwrap();
        assert_eq!(read_all(reader).await, CONTENT);
    }

    let url = downloads.url(PICK_CODE, &cancel).await.unwrap();
    assert_eq!(url.file_name, "a.bin");
    assert_eq!(url.file_size, CONTENT.len() as u64);
    assert!(url.expires_at.is_some());
    harness.server.verify().await;
}

#[tokio::test]
async fn test_concurrent_resolves_share_one_call() {
    let harness = Harness::logged_in().await;
    mount_downurl(
        &harness.server,
        cdn_url(&harness.server, true),
        Duration::from_millis(100),
        1,
    )
    .await;

    let downloads = Arc::new(harness.downloads());
    let cancel = CancellationToken::new();
    let lookups = (0..6).map(|_| {
        let downloads = downloads.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { downloads.url(PICK_CODE, &cancel).await })
    });
    let urls: Vec<String> = join_all(lookups)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().expect("resolve failed").url)
        .collect();

    assert!(urls.windows(2).all(|w| w[0] == w[1]));
    harness.server.verify().await;
}

#[tokio::test]
async fn test_url_without_expiry_is_not_reused() {
    let harness = Harness::logged_in().await;
    mount_downurl(&harness.server, cdn_url(&harness.server, false), Duration::ZERO, 2).await;

    let downloads = harness.downloads();
    let cancel = CancellationToken::new();
    downloads.url(PICK_CODE, &cancel).await.unwrap();
    downloads.url(PICK_CODE, &cancel).await.unwrap();

    harness.server.verify().await;
}

#[tokio::test]
async fn test_expired_slots_are_dropped_on_resolve() {
    let harness = Harness::logged_in().await;
    mount_downurl(&harness.server, cdn_url(&harness.server, false), Duration::ZERO, 2).await;
    Mock::given(method("POST"))
        .and(path("/open/ufile/downurl"))
        .and(body_string_contains("pick_code=pc-other"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok(serde_json::json!([{
            "file_name": "b.bin",
            "file_size": 3,
            "pick_code": "pc-other",
            "url": cdn_url(&harness.server, true)
        }]))))
        .expect(1)
        .mount(&harness.server)
        .await;

    let downloads = harness.downloads();
    let cancel = CancellationToken::new();
    downloads.url(PICK_CODE, &cancel).await.unwrap();
    assert_eq!(downloads.cached(), 1);

    downloads.url("pc-other", &cancel).await.unwrap();
    assert_eq!(downloads.cached(), 1);

    downloads.url(PICK_CODE, &cancel).await.unwrap();
    downloads.url("pc-other", &cancel).await.unwrap();
    assert_eq!(downloads.cached(), 2);
    harness.server.verify().await;
}

#[tokio::test]
async fn test_range_request_returns_partial_content() {
    let harness = Harness::logged_in().await;
    mount_downurl(&harness.server, cdn_url(&harness.server, true), Duration::ZERO, 1).await;
    Mock::given(method("GET"))
        .and(path("/cdn/a.bin"))
        .and(header("range", "bytes=2-5"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(CONTENT[2..=5].to_vec()))
        .mount(&harness.server)
        .await;

    let downloads = harness.downloads();
    let range = ByteRange::new(2, 5).unwrap();
    let reader = downloads
        .open(PICK_CODE, Some(range), &CancellationToken::new())
        .await
        .expect("range open failed");

    assert_eq!(read_all(reader).await, b"cdef");
}

#[tokio::test]
async fn test_range_ignored_by_server_is_an_error() {
    let harness = Harness::logged_in().await;
    mount_downurl(&harness.server, cdn_url(&harness.server, true), Duration::ZERO, 1).await;
    mount_cdn(&harness.server).await;

    let downloads = harness.downloads();
    let range = ByteRange::new(2, 5).unwrap();
    let result = downloads
        .open(PICK_CODE, Some(range), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(ApiError::InvalidResponse(_))));
}

#[tokio::test]
async fn test_refused_url_is_resolved_again() {
    let harness = Harness::logged_in().await;
    mount_downurl(&harness.server, cdn_url(&harness.server, true), Duration::ZERO, 2).await;
    Mock::given(method("GET"))
        .and(path("/cdn/a.bin"))
        .respond_with(ResponseTemplate::new(403).set_body_string("expired"))
        .up_to_n_times(1)
        .mount(&harness.server)
        .await;
    mount_cdn(&harness.server).await;

    let downloads = harness.downloads();
    let reader = downloads
        .open(PICK_CODE, None, &CancellationToken::new())
        .await
        .expect("open after refusal failed");

    assert_eq!(read_all(reader).await, CONTENT);
    harness.server.verify().await;
}

#[tokio::test]
async fn test_pull_reads_known_file() {
    let harness = Harness::logged_in().await;
    mount_downurl(&harness.server, cdn_url(&harness.server, true), Duration::ZERO, 1).await;
    mount_cdn(&harness.server).await;

    let resolver = Arc::new(FlatResolver::default());
    resolver.files.lock().unwrap().insert(
        "docs/a.bin".to_string(),
        RemoteObject {
            file_id: "2593093001609739968".into(),
            pick_code: PICK_CODE.into(),
            sha1: None,
            name: "a.bin".into(),
            size: CONTENT.len() as u64,
            parent_id: Some(PARENT_ID.into()),
        },
    );
    let remote = harness.remote(Harness::small_settings(UploadMode::Auto), resolver);
    let cancel = CancellationToken::new();

    let reader = remote.pull("docs/a.bin", None, &cancel).await.unwrap();
    assert_eq!(read_all(reader).await, CONTENT);

    let missing = remote.pull("docs/missing.bin", None, &cancel).await;
    assert!(missing.is_err());
}
