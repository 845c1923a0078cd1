//! Upload paths: instant upload, multipart, single-shot, streamed, fallback

use std::sync::{atomic::Ordering, Arc};

use bytes::Bytes;
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use pandrive_api::{
    hash::{sha1_hex, MemorySource},
    orchestrator::{UploadInput, UploadRequest},
    ApiError, ErrorKind,
};
use pandrive_core::{
    config::UploadMode,
    domain::{UploadTarget, KIB},
    ports::{IRemoteStorage, ITransferObserver, PushOptions, PushSource},
};

use crate::common::{
    self, content, must_upload, object_path, ok, FlatResolver, Harness, RecordingObserver,
    PARENT_ID,
};

fn target(len: usize) -> UploadTarget {
    UploadTarget::new("docs/report.bin", Some(len as u64), "report.bin", PARENT_ID).unwrap()
}

fn memory(data: &[u8]) -> UploadInput {
    UploadInput::Reopenable(Box::new(MemorySource(Bytes::copy_from_slice(data))))
}

fn observed(observer: &Arc<RecordingObserver>) -> UploadRequest {
    let observer: Arc<dyn ITransferObserver> = observer.clone();
    UploadRequest {
        observer: Some(observer),
        ..UploadRequest::default()
    }
}

async fn count(harness: &Harness, verb: &str, prefix: &str) -> usize {
    harness
        .requests_to(prefix)
        .await
        .iter()
        .filter(|r| r.method.as_str() == verb)
        .count()
}

async fn part_requests(harness: &Harness, part: u64) -> usize {
    harness
        .requests_to(&object_path())
        .await
        .iter()
        .filter(|r| {
            r.method.as_str() == "PUT"
                && r.url
                    .query_pairs()
                    .any(|(k, v)| k == "partNumber" && v == part.to_string())
        })
        .count()
}

#[tokio::test]
async fn test_instant_upload_sends_no_bytes() {
    let harness = Harness::logged_in().await;
    let data = content(20 * KIB as usize);
    common::mount_init(
        &harness.server,
        serde_json::json!({"status": 2, "file_id": "file-dedup", "pick_code": "pc-dedup"}),
    )
    .await;

    let observer = Arc::new(RecordingObserver::default());
    let uploads = harness.orchestrator(Harness::small_settings(UploadMode::Auto));
    let object = uploads
        .upload(&target(data.len()), memory(&data), observed(&observer))
        .await
        .expect("instant upload failed");

    assert_eq!(object.file_id, "file-dedup");
    assert_eq!(object.pick_code, "pc-dedup");
    assert_eq!(object.sha1.as_deref(), Some(sha1_hex(&data).as_str()));
    assert_eq!(object.size, data.len() as u64);
    assert_eq!(observer.copies.load(Ordering::SeqCst), 1);
    assert_eq!(observer.copied.load(Ordering::SeqCst), data.len() as u64);
    assert_eq!(observer.transferred.load(Ordering::SeqCst), 0);

    assert!(harness.requests_to("/fhnfile").await.is_empty());
    assert!(harness.requests_to("/open/upload/get_token").await.is_empty());

    let init = harness.requests_to("/open/upload/init").await;
    assert_eq!(init.len(), 1);
    let form = String::from_utf8_lossy(&init[0].body).to_string();
    assert!(form.contains(&format!("fileid={}", sha1_hex(&data))));
    assert!(form.contains(&format!("target=U_1_{}", PARENT_ID)));
}

#[tokio::test]
async fn test_multipart_upload_sends_parts_in_order() {
    let harness = Harness::logged_in().await;
    let data = content(10 * KIB as usize);
    let sha1 = sha1_hex(&data);
    common::mount_init(&harness.server, must_upload()).await;
    common::mount_storage_token(&harness.server).await;
    common::mount_multipart(&harness.server, 3, &sha1, data.len() as u64).await;

    let observer = Arc::new(RecordingObserver::default());
    let uploads = harness.orchestrator(Harness::small_settings(UploadMode::Auto));
    let object = uploads
        .upload(&target(data.len()), memory(&data), observed(&observer))
        .await
        .expect("multipart upload failed");

    assert_eq!(object.file_id, "file-new");
    assert_eq!(object.pick_code, "pc-upload");
    assert_eq!(object.sha1.as_deref(), Some(sha1.as_str()));
    assert_eq!(observer.transferred.load(Ordering::SeqCst), data.len() as u64);

    let storage = harness.requests_to(&object_path()).await;
    let parts: Vec<usize> = storage
        .iter()
        .filter(|r| r.method.as_str() == "PUT")
        .map(|r| r.body.len())
        .collect();
    assert_eq!(parts, vec![4096, 4096, 2048]);

    let initiate = &storage[0];
    assert_eq!(initiate.method.as_str(), "POST");
    assert!(initiate.url.query_pairs().any(|(k, _)| k == "sequential"));

    let complete = storage.last().unwrap();
    let xml = String::from_utf8_lossy(&complete.body).to_string();
    assert!(xml.contains(
        "<Part><PartNumber>1</PartNumber><ETag>\"etag-1\"</ETag></Part>\
         <Part><PartNumber>2</PartNumber><ETag>\"etag-2\"</ETag></Part>\
         <Part><PartNumber>3</PartNumber><ETag>\"etag-3\"</ETag></Part>"
    ));
    assert!(complete.headers.get("x-oss-callback").is_some());

    for request in &storage {
        let auth = request
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=STS.test/"), "{}", auth);
        assert_eq!(
            request.headers.get("x-amz-security-token").unwrap(),
            "test-session-token"
        );
    }
    assert_eq!(count(&harness, "DELETE", "/fhnfile").await, 0);
}

#[tokio::test]
async fn test_failed_part_retried_without_resending_earlier_parts() {
    let harness = Harness::logged_in().await;
    let data = content(10 * KIB as usize);
    let sha1 = sha1_hex(&data);
    common::mount_init(&harness.server, must_upload()).await;
    common::mount_storage_token(&harness.server).await;
    Mock::given(method("PUT"))
        .and(path(object_path()))
        .and(query_param("partNumber", "3"))
        .respond_with(ResponseTemplate::new(500).set_body_string(
            "<Error><Code>InternalError</Code><Message>try again</Message></Error>",
        ))
        .up_to_n_times(2)
        .mount(&harness.server)
        .await;
    common::mount_multipart(&harness.server, 3, &sha1, data.len() as u64).await;

    let observer = Arc::new(RecordingObserver::default());
    let uploads = harness.orchestrator(Harness::small_settings(UploadMode::Auto));
    let object = uploads
        .upload(&target(data.len()), memory(&data), observed(&observer))
        .await
        .expect("upload with transient part failure failed");

    assert_eq!(object.file_id, "file-new");
    assert_eq!(part_requests(&harness, 1).await, 1);
    assert_eq!(part_requests(&harness, 2).await, 1);
    assert_eq!(part_requests(&harness, 3).await, 3);
    assert_eq!(observer.transferred.load(Ordering::SeqCst), data.len() as u64);
}

#[tokio::test]
async fn test_permanent_part_failure_aborts_session() {
    let harness = Harness::logged_in().await;
    let data = content(10 * KIB as usize);
    let sha1 = sha1_hex(&data);
    common::mount_init(&harness.server, must_upload()).await;
    common::mount_storage_token(&harness.server).await;
    Mock::given(method("PUT"))
        .and(path(object_path()))
        .and(query_param("partNumber", "2"))
        .respond_with(ResponseTemplate::new(403).set_body_string(
            "<Error><Code>AccessDenied</Code><Message>denied</Message></Error>",
        ))
        .mount(&harness.server)
        .await;
    common::mount_multipart(&harness.server, 3, &sha1, data.len() as u64).await;

    let uploads = harness.orchestrator(Harness::small_settings(UploadMode::Auto));
    let err = uploads
        .upload(&target(data.len()), memory(&data), UploadRequest::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Permanent);
    assert!(matches!(err.root(), ApiError::Storage { status: 403, .. }));
    assert_eq!(part_requests(&harness, 2).await, 1);
    assert_eq!(part_requests(&harness, 3).await, 0);
    assert_eq!(count(&harness, "DELETE", "/fhnfile").await, 1);

    let completes = harness
        .requests_to(&object_path())
        .await
        .iter()
        .filter(|r| {
            r.method.as_str() == "POST" && r.url.query_pairs().any(|(k, _)| k == "uploadId")
        })
        .count();
    assert_eq!(completes, 0);
}

#[tokio::test]
async fn test_range_challenge_answered_with_range_hash() {
    let harness = Harness::logged_in().await;
    let data = content(6 * KIB as usize);
    let expected = sha1_hex(&data[100..=199]);

    Mock::given(method("POST"))
        .and(path("/open/upload/init"))
        .and(body_string_contains("sign_key=sk-1"))
        .and(body_string_contains(format!("sign_val={}", expected)))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok(serde_json::json!({
            "status": 2, "file_id": "file-signed", "pick_code": "pc-signed"
        }))))
        .expect(1)
        .mount(&harness.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/open/upload/init"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok(serde_json::json!({
            "status": 7, "pick_code": "pc-signed", "sign_key": "sk-1", "sign_check": "100-199"
        }))))
        .up_to_n_times(1)
        .mount(&harness.server)
        .await;

    let uploads = harness.orchestrator(Harness::small_settings(UploadMode::Auto));
    let object = uploads
        .upload(&target(data.len()), memory(&data), UploadRequest::default())
        .await
        .expect("signed instant upload failed");

    assert_eq!(object.file_id, "file-signed");
    assert_eq!(harness.requests_to("/open/upload/init").await.len(), 2);
    assert!(harness.requests_to("/fhnfile").await.is_empty());
    harness.server.verify().await;
}

#[tokio::test]
async fn test_endless_challenges_are_bounded() {
    let harness = Harness::logged_in().await;
    let data = content(6 * KIB as usize);
    common::mount_init(
        &harness.server,
        serde_json::json!({"status": 7, "sign_key": "sk", "sign_check": "0-9"}),
    )
    .await;

    let uploads = harness.orchestrator(Harness::small_settings(UploadMode::Auto));
    let err = uploads
        .upload(&target(data.len()), memory(&data), UploadRequest::default())
        .await
        .unwrap_err();

    assert_eq!(err.provider_code(), Some(7));
    // First submission plus one per allowed round
    assert_eq!(harness.requests_to("/open/upload/init").await.len(), 4);
}

#[tokio::test]
async fn test_failed_negotiation_falls_back_to_plain_upload() {
    let harness = Harness::logged_in().await;
    let data = content(6 * KIB as usize);
    let sha1 = sha1_hex(&data);
    Mock::given(method("POST"))
        .and(path("/open/upload/init"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&harness.server)
        .await;
    common::mount_sample_init(&harness.server).await;
    common::mount_storage_token(&harness.server).await;
    common::mount_single_put(&harness.server, &sha1, data.len() as u64).await;

    let uploads = harness.orchestrator(Harness::small_settings(UploadMode::Auto));
    let object = uploads
        .upload(&target(data.len()), memory(&data), UploadRequest::default())
        .await
        .expect("fallback upload failed");

    assert_eq!(object.file_id, "file-new");
    assert_eq!(harness.requests_to("/open/upload/init").await.len(), 3);
    assert_eq!(harness.requests_to("/open/upload/sample_init").await.len(), 1);

    let puts = harness.requests_to(&object_path()).await;
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].body, data);
}

#[tokio::test]
async fn test_rejected_content_is_rehashed_and_retried() {
    let harness = Harness::logged_in().await;
    let data = content(6 * KIB as usize);
    let sha1 = sha1_hex(&data);
    common::mount_init(&harness.server, must_upload()).await;
    common::mount_storage_token(&harness.server).await;
    Mock::given(method("PUT"))
        .and(path(object_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "state": false, "code": 10002, "message": "content check failed"
        })))
        .up_to_n_times(1)
        .mount(&harness.server)
        .await;
    common::mount_single_put(&harness.server, &sha1, data.len() as u64).await;

    let uploads = harness.orchestrator(Harness::small_settings(UploadMode::Auto));
    let request = UploadRequest {
        known_sha1: Some("0000000000000000000000000000000000000000".into()),
        ..UploadRequest::default()
    };
    let object = uploads
        .upload(&target(data.len()), memory(&data), request)
        .await
        .expect("upload after validation retry failed");

    assert_eq!(object.sha1.as_deref(), Some(sha1.as_str()));
    let init = harness.requests_to("/open/upload/init").await;
    assert_eq!(init.len(), 2);
    // The second attempt uses the locally computed hash, not the upstream one.
    let second = String::from_utf8_lossy(&init[1].body).to_string();
    assert!(second.contains(&format!("fileid={}", sha1)));
    assert_eq!(harness.requests_to(&object_path()).await.len(), 2);
}

#[tokio::test]
async fn test_hash_only_mode_refuses_to_upload() {
    let harness = Harness::logged_in().await;
    let data = content(6 * KIB as usize);
    common::mount_init(&harness.server, must_upload()).await;

    let uploads = harness.orchestrator(Harness::small_settings(UploadMode::HashOnly));
    let err = uploads
        .upload(&target(data.len()), memory(&data), UploadRequest::default())
        .await
        .unwrap_err();

    assert!(matches!(err.root(), ApiError::DedupRequired(_)));
    assert!(harness.requests_to("/fhnfile").await.is_empty());
}

#[tokio::test]
async fn test_push_stream_of_unknown_size() {
    let harness = Harness::logged_in().await;
    let data = content(3 * KIB as usize);
    let sha1 = sha1_hex(&data);
    common::mount_sample_init(&harness.server).await;
    common::mount_storage_token(&harness.server).await;
    common::mount_single_put(&harness.server, &sha1, data.len() as u64).await;

    let resolver = Arc::new(FlatResolver::default());
    let remote = harness.remote(Harness::small_settings(UploadMode::Stream), resolver.clone());
    let observer = Arc::new(RecordingObserver::default());
    let object = remote
        .push(
            "inbox/report.bin",
            PushSource::Stream(Box::new(std::io::Cursor::new(data.clone()))),
            PushOptions::default().with_observer(observer.clone()),
        )
        .await
        .expect("streamed push failed");

    assert_eq!(object.file_id, "file-new");
    assert_eq!(object.parent_id.as_deref(), Some(PARENT_ID));
    assert!(harness.requests_to("/open/upload/init").await.is_empty());

    let puts = harness.requests_to(&object_path()).await;
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].body, data);
    assert_eq!(
        puts[0].headers.get("x-amz-content-sha256").unwrap(),
        "UNSIGNED-PAYLOAD"
    );
    assert_eq!(observer.transferred.load(Ordering::SeqCst), data.len() as u64);
    assert!(resolver.files.lock().unwrap().contains_key("inbox/report.bin"));
}

#[tokio::test]
async fn test_push_rejects_size_mismatch() {
    let harness = Harness::logged_in().await;
    let data = content(2 * KIB as usize);

    let remote = harness.remote(
        Harness::small_settings(UploadMode::Auto),
        Arc::new(FlatResolver::default()),
    );
    let err = remote
        .push(
            "inbox/short.bin",
            PushSource::Stream(Box::new(std::io::Cursor::new(data))),
            PushOptions::default().with_size(4 * KIB),
        )
        .await
        .unwrap_err();

    assert!(format!("{:#}", err).contains("announced"), "{:#}", err);
    assert!(harness.requests_to("/open").await.is_empty());
}
