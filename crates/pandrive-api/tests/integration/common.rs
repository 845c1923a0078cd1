//! Shared helpers for the provider integration tests
//!
//! Every host (API, passport, QR status, storage, CDN) is the same wiremock
//! server. Pacing and retries are shrunk to milliseconds.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pandrive_api::{
    auth::{DeviceCodeFlow, TokenManager},
    client::ApiClient,
    credentials::MemoryCredentialStore,
    download::DownloadCache,
    negotiate::Negotiator,
    orchestrator::{UploadOrchestrator, UploadSettings},
    pacer::{Pacer, PacerSettings},
    provider::PanRemoteStorage,
    retry::RetryPolicy,
    storage::{ProviderStorageCredentials, StorageClient, StorageSettings},
    upload::{ChunkUploader, PartBufferPool},
};
use pandrive_core::{
    config::{ApiConfig, AuthConfig, DownloadConfig, UploadMode},
    domain::{ChunkSizing, Credential, RemoteObject, KIB},
    ports::{
        ILoginPresenter, IPathResolver, ITransferObserver, LoginProgress, LoginPrompt,
        ResolvedParent,
    },
};

pub const BUCKET: &str = "fhnfile";
pub const OBJECT: &str = "tmp/upload-obj";
pub const PARENT_ID: &str = "2593093001609739968";

/// Storage path of the test object in path-style addressing
pub fn object_path() -> String {
    format!("/{}/{}", BUCKET, OBJECT)
}

/// Wraps `data` in a successful provider envelope.
pub fn ok(data: serde_json::Value) -> serde_json::Value {
    serde_json::json!({"state": true, "code": 0, "message": "", "data": data})
}

/// A failed provider envelope carrying `code`.
pub fn failed(code: i64, message: &str) -> serde_json::Value {
    serde_json::json!({"state": false, "code": code, "message": message, "data": []})
}

pub fn fast_pacer(cooldown: Duration) -> Arc<Pacer> {
    Arc::new(Pacer::new(PacerSettings {
        min_sleep: Duration::ZERO,
        max_sleep: Duration::from_millis(5),
        decay_constant: 2,
        attack_constant: 1,
        throttle_cooldown: cooldown,
    }))
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        elapsed_ceiling: Duration::from_secs(10),
    }
}

pub fn api_client(server: &MockServer, pacer: Arc<Pacer>) -> ApiClient {
    let config = ApiConfig {
        base_url: server.uri(),
        passport_url: server.uri(),
        qrcode_url: server.uri(),
        ..ApiConfig::default()
    };
    ApiClient::new(&config, pacer, fast_retry()).expect("api client")
}

pub fn auth_config() -> AuthConfig {
    AuthConfig {
        client_id: Some("test-client".into()),
        refresh_window_secs: 300,
        refresh_wait_secs: 5,
        ..AuthConfig::default()
    }
}

/// A credential well outside the refresh window
pub fn live_credential(access: &str) -> Credential {
    Credential::issued_now(access, "refresh-1", 7200)
}

// ============================================================================
// Host-side stubs
// ============================================================================

/// Records what the login UI was asked to show
#[derive(Default)]
pub struct RecordingPresenter {
    pub prompts: Mutex<Vec<LoginPrompt>>,
    pub progress: Mutex<Vec<LoginProgress>>,
}

impl ILoginPresenter for RecordingPresenter {
    fn present(&self, prompt: &LoginPrompt) {
        self.prompts.lock().unwrap().push(prompt.clone());
    }

    fn progress(&self, progress: LoginProgress) {
        self.progress.lock().unwrap().push(progress);
    }
}

/// Counts transferred and server-side-copied bytes
#[derive(Default)]
pub struct RecordingObserver {
    pub transferred: AtomicU64,
    pub copied: AtomicU64,
    pub copies: AtomicUsize,
}

impl ITransferObserver for RecordingObserver {
    fn on_bytes(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::SeqCst);
    }

    fn on_server_side_copy(&self, size: u64) {
        self.copied.fetch_add(size, Ordering::SeqCst);
        self.copies.fetch_add(1, Ordering::SeqCst);
    }
}

/// Every path lives in one folder; uploads are remembered for pulls
#[derive(Default)]
pub struct FlatResolver {
    pub files: Mutex<HashMap<String, RemoteObject>>,
}

#[async_trait]
impl IPathResolver for FlatResolver {
    async fn resolve_parent(&self, logical_path: &str) -> Result<ResolvedParent> {
        let leaf = logical_path.rsplit('/').next().unwrap_or(logical_path);
        Ok(ResolvedParent {
            parent_id: PARENT_ID.to_string(),
            leaf_name: leaf.to_string(),
        })
    }

    async fn lookup_file(&self, logical_path: &str) -> Result<Option<RemoteObject>> {
        Ok(self.files.lock().unwrap().get(logical_path).cloned())
    }

    async fn record_upload(&self, logical_path: &str, object: &RemoteObject) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(logical_path.to_string(), object.clone());
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

/// One adapter wired against a mock server
pub struct Harness {
    pub server: MockServer,
    pub store: Arc<MemoryCredentialStore>,
    pub presenter: Arc<RecordingPresenter>,
    pub tokens: Arc<TokenManager>,
}

impl Harness {
    /// Adapter with a live credential already stored.
    pub async fn logged_in() -> Self {
        Self::with_credential(Some(live_credential("access-1"))).await
    }

    pub async fn with_credential(credential: Option<Credential>) -> Self {
        let server = MockServer::start().await;
        Self::on_server(server, credential, Duration::from_millis(20))
    }

    pub fn on_server(server: MockServer, credential: Option<Credential>, cooldown: Duration) -> Self {
        let store = Arc::new(MemoryCredentialStore::new(credential));
        let presenter = Arc::new(RecordingPresenter::default());
        let flow = DeviceCodeFlow::new(api_client(&server, fast_pacer(cooldown)), &auth_config())
            .with_timing(Duration::from_millis(10), Duration::from_secs(5));
        let tokens = Arc::new(TokenManager::new(
            flow,
            &auth_config(),
            store.clone(),
            presenter.clone(),
        ));
        Self {
            server,
            store,
            presenter,
            tokens,
        }
    }

    /// Upload thresholds scaled down to kilobytes
    pub fn small_settings(mode: UploadMode) -> UploadSettings {
        UploadSettings {
            mode,
            multipart_threshold: 8 * KIB,
            stream_limit: 0,
            spool_memory_limit: 4 * KIB,
            validation_retries: 2,
            max_sign_rounds: 3,
            sizing: ChunkSizing {
                min_part_size: KIB,
                max_part_size: 4 * KIB,
                max_parts: 100,
            },
        }
    }

    pub fn orchestrator(&self, settings: UploadSettings) -> UploadOrchestrator {
        let storage = Arc::new(StorageClient::new(
            self.tokens.api().http().clone(),
            Arc::new(ProviderStorageCredentials::new(self.tokens.clone())),
            StorageSettings {
                region: "cn-shenzhen".into(),
                path_style: true,
                credential_margin: Duration::from_secs(60),
                transfer_timeout: Duration::from_secs(10),
            },
        ));
        let uploader = ChunkUploader::new(
            storage,
            Arc::new(PartBufferPool::new(2)),
            fast_retry(),
            settings.sizing,
        );
        let negotiator = Negotiator::new(self.tokens.clone(), settings.max_sign_rounds);
        UploadOrchestrator::new(negotiator, uploader, settings)
    }

    pub fn downloads(&self) -> DownloadCache {
        DownloadCache::new(self.tokens.clone(), &DownloadConfig::default())
    }

    pub fn remote(&self, settings: UploadSettings, resolver: Arc<FlatResolver>) -> PanRemoteStorage {
        PanRemoteStorage::new(
            self.tokens.clone(),
            resolver,
            self.orchestrator(settings),
            self.downloads(),
        )
    }

    /// Requests whose path starts with `prefix`
    pub async fn requests_to(&self, prefix: &str) -> Vec<wiremock::Request> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.url.path().starts_with(prefix))
            .collect()
    }
}

// ============================================================================
// Mounts
// ============================================================================

/// GET /open/upload/get_token answering with the mock server as endpoint.
pub async fn mount_storage_token(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/open/upload/get_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok(serde_json::json!({
            "endpoint": server.uri(),
            "AccessKeyId": "STS.test",
            "AccessKeySecret": "test-secret",
            "SecurityToken": "test-session-token",
            "Expiration": "2099-01-01T00:00:00Z"
        }))))
        .mount(server)
        .await;
}

/// `init`/`sample_init` data demanding an upload to the test object
pub fn must_upload() -> serde_json::Value {
    serde_json::json!({
        "status": 1,
        "pick_code": "pc-upload",
        "bucket": BUCKET,
        "object": OBJECT,
        "callback": {
            "callback": "{\"callbackUrl\":\"https://cb.example.test/\"}",
            "callback_var": "{\"x:pick_code\":\"pc-upload\"}"
        }
    })
}

pub async fn mount_init(server: &MockServer, data: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path("/open/upload/init"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok(data)))
        .mount(server)
        .await;
}

pub async fn mount_sample_init(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/open/upload/sample_init"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok(must_upload())))
        .mount(server)
        .await;
}

/// The callback answer relayed by the store on completion.
pub fn callback_ok(sha1: &str, size: u64) -> serde_json::Value {
    serde_json::json!({
        "state": true,
        "code": 0,
        "message": "",
        "data": {
            "file_id": "file-new",
            "pick_code": "pc-upload",
            "sha1": sha1,
            "file_name": "report.bin",
            "file_size": size.to_string()
        }
    })
}

/// Multipart endpoints: initiate, one PUT per part, complete, abort.
pub async fn mount_multipart(server: &MockServer, parts: u64, sha1: &str, size: u64) {
    Mock::given(method("POST"))
        .and(path(object_path()))
        .and(query_param("uploads", ""))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<InitiateMultipartUploadResult><Bucket>fhnfile</Bucket>\
             <UploadId>upload-1</UploadId></InitiateMultipartUploadResult>",
        ))
        .mount(server)
        .await;

    for part in 1..=parts {
        Mock::given(method("PUT"))
            .and(path(object_path()))
            .and(query_param("partNumber", part.to_string()))
            .and(query_param("uploadId", "upload-1"))
            .respond_with(
                ResponseTemplate::new(200).append_header("ETag", format!("\"etag-{}\"", part)),
            )
            .mount(server)
            .await;
    }

    Mock::given(method("POST"))
        .and(path(object_path()))
        .and(query_param("uploadId", "upload-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(callback_ok(sha1, size)))
        .mount(server)
        .await;

    Mock::given(method("DELETE"))
        .and(path(object_path()))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;
}

/// Single-shot PUT answering with the completion callback.
pub async fn mount_single_put(server: &MockServer, sha1: &str, size: u64) {
    Mock::given(method("PUT"))
        .and(path(object_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(callback_ok(sha1, size)))
        .mount(server)
        .await;
}

/// Deterministic test content
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
