//! Device login, refresh and token-invalid recovery

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pandrive_api::{
    auth::{DeviceCodeFlow, TokenManager, TokenState},
    storage::{ProviderStorageCredentials, StorageCredentialSource},
    ApiError, ErrorKind,
};
use pandrive_core::{
    domain::Credential,
    ports::{ICredentialStore, LoginProgress},
};

use crate::common::{api_client, auth_config, failed, fast_pacer, ok, Harness, RecordingPresenter};

/// A store whose disk is full
struct ReadOnlyStore;

#[async_trait]
impl ICredentialStore for ReadOnlyStore {
    async fn load(&self) -> anyhow::Result<Option<Credential>> {
        Ok(None)
    }

    async fn save(&self, _credential: &Credential) -> anyhow::Result<()> {
        anyhow::bail!("no space left on device")
    }

    async fn clear(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Device code, one status answer per entry of `statuses`, then the exchange.
async fn mount_device_login(server: &MockServer, statuses: &[i64]) {
    Mock::given(method("POST"))
        .and(path("/open/authDeviceCode"))
        .and(body_string_contains("client_id=test-client"))
        .and(body_string_contains("code_challenge_method=sha256"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok(serde_json::json!({
            "uid": "device-uid-1",
            "time": 1700000000,
            "qrcode": "https://qr.example.test/device-uid-1",
            "sign": "sig-1"
        }))))
        .mount(server)
        .await;

    for status in statuses {
        Mock::given(method("GET"))
            .and(path("/get/status/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(ok(serde_json::json!({"status": status, "msg": ""}))),
            )
            .up_to_n_times(1)
            .mount(server)
            .await;
    }

    Mock::given(method("POST"))
        .and(path("/open/deviceCodeToToken"))
        .and(body_string_contains("uid=device-uid-1"))
        .and(body_string_contains("code_verifier="))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok(serde_json::json!({
            "access_token": "access-new",
            "refresh_token": "refresh-new",
            "expires_in": 7200
        }))))
        .mount(server)
        .await;
}

async fn mount_refresh(server: &MockServer, delay: Duration) {
    Mock::given(method("POST"))
        .and(path("/open/refreshToken"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(ok(serde_json::json!({
                    "access_token": "access-2",
                    "refresh_token": "refresh-2",
                    "expires_in": "7200"
                })))
                .set_delay(delay),
        )
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_device_login_persists_credential() {
    let harness = Harness::with_credential(None).await;
    mount_device_login(&harness.server, &[0, 1, 2]).await;

    let credential = harness
        .tokens
        .login(&CancellationToken::new())
        .await
        .expect("login failed");

    assert_eq!(credential.access_token, "access-new");
    assert_eq!(credential.refresh_token, "refresh-new");
    assert_eq!(harness.store.current().await, Some(credential));
    assert_eq!(harness.tokens.state(), TokenState::Active);

    let prompts = harness.presenter.prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].device_uid, "device-uid-1");
    assert_eq!(prompts[0].qr_payload, "https://qr.example.test/device-uid-1");

    let progress = harness.presenter.progress.lock().unwrap().clone();
    assert_eq!(
        progress,
        vec![LoginProgress::Waiting, LoginProgress::Scanned, LoginProgress::Approved]
    );
}

#[tokio::test]
async fn test_expired_device_code_fails_login() {
    let harness = Harness::with_credential(None).await;
    mount_device_login(&harness.server, &[-2]).await;

    let err = harness
        .tokens
        .login(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("expired"), "unexpected error: {}", err);
    assert!(harness.store.current().await.is_none());
    assert_eq!(harness.tokens.state(), TokenState::NoCredential);
}

#[tokio::test]
async fn test_stored_credential_used_without_network() {
    let harness = Harness::logged_in().await;

    let token = harness
        .tokens
        .access_token(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(token, "access-1");
    assert!(harness.requests_to("/").await.is_empty());
    assert_eq!(harness.tokens.state(), TokenState::Active);
}

#[tokio::test]
async fn test_concurrent_refresh_is_single_flight() {
    let stale = Credential::issued_now("access-1", "refresh-1", 10);
    let harness = Harness::with_credential(Some(stale)).await;
    mount_refresh(&harness.server, Duration::from_millis(100)).await;

    let cancel = CancellationToken::new();
    let calls = (0..8).map(|_| {
        let tokens = harness.tokens.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { tokens.access_token(&cancel).await })
    });
    let tokens: Vec<String> = join_all(calls)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked").expect("access_token failed"))
        .collect();

    assert!(tokens.iter().all(|t| t == "access-2"), "tokens: {:?}", tokens);
    assert_eq!(harness.store.save_count(), 1);
    harness.server.verify().await;
}

#[tokio::test]
async fn test_token_invalid_refreshes_and_retries_once() {
    let harness = Harness::logged_in().await;
    let server = &harness.server;

    Mock::given(method("GET"))
        .and(path("/open/upload/get_token"))
        .and(header("authorization", "Bearer access-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(failed(40140125, "access token expired")),
        )
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/open/upload/get_token"))
        .and(header("authorization", "Bearer access-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok(serde_json::json!({
            "endpoint": "https://oss-cn-shenzhen.example.test",
            "AccessKeyId": "STS.refreshed",
            "AccessKeySecret": "secret",
            "SecurityToken": "token",
            "Expiration": "2099-01-01T00:00:00Z"
        }))))
        .expect(1)
        .mount(server)
        .await;
    mount_refresh(server, Duration::ZERO).await;

    let source = ProviderStorageCredentials::new(harness.tokens.clone());
    let credential = source
        .fetch(&CancellationToken::new())
        .await
        .expect("storage token fetch failed");

    assert_eq!(credential.access_key_id, "STS.refreshed");
    let stored = harness.store.current().await.expect("credential stored");
    assert_eq!(stored.access_token, "access-2");
    assert_eq!(stored.refresh_token, "refresh-2");
    server.verify().await;
}

#[tokio::test]
async fn test_revoked_refresh_token_falls_back_to_login() {
    let stale = Credential::issued_now("access-1", "refresh-1", 10);
    let harness = Harness::with_credential(Some(stale)).await;
    Mock::given(method("POST"))
        .and(path("/open/refreshToken"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(failed(40140116, "refresh token expired")),
        )
        .expect(1)
        .mount(&harness.server)
        .await;
    mount_device_login(&harness.server, &[2]).await;

    let token = harness
        .tokens
        .access_token(&CancellationToken::new())
        .await
        .expect("re-login failed");

    assert_eq!(token, "access-new");
    assert_eq!(harness.presenter.prompts.lock().unwrap().len(), 1);
    assert_eq!(harness.tokens.state(), TokenState::Active);
}

#[tokio::test]
async fn test_revoked_access_and_refresh_tokens_start_device_login() {
    // access-1 is fresh by clock but the server has revoked it
    let harness = Harness::logged_in().await;
    let server = &harness.server;

    Mock::given(method("GET"))
        .and(path("/open/upload/get_token"))
        .and(header("authorization", "Bearer access-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(failed(40140125, "access token revoked")),
        )
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/open/refreshToken"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(failed(40140116, "refresh token revoked")),
        )
        .expect(1)
        .mount(server)
        .await;
    mount_device_login(server, &[2]).await;
    Mock::given(method("GET"))
        .and(path("/open/upload/get_token"))
        .and(header("authorization", "Bearer access-new"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok(serde_json::json!({
            "endpoint": "https://oss-cn-shenzhen.example.test",
            "AccessKeyId": "STS.relogged",
            "AccessKeySecret": "secret",
            "SecurityToken": "token",
            "Expiration": "2099-01-01T00:00:00Z"
        }))))
        .expect(1)
        .mount(server)
        .await;

    let credential = ProviderStorageCredentials::new(harness.tokens.clone())
        .fetch(&CancellationToken::new())
        .await
        .expect("storage token fetch after re-login failed");

    assert_eq!(credential.access_key_id, "STS.relogged");
    assert_eq!(harness.requests_to("/open/authDeviceCode").await.len(), 1);
    assert_eq!(harness.presenter.prompts.lock().unwrap().len(), 1);
    let stored = harness.store.current().await.expect("credential stored");
    assert_eq!(stored.access_token, "access-new");
    assert_eq!(harness.tokens.state(), TokenState::Active);
    server.verify().await;
}

#[tokio::test]
async fn test_unsaved_credential_is_not_published() {
    let server = MockServer::start().await;
    mount_device_login(&server, &[2]).await;
    let flow = DeviceCodeFlow::new(api_client(&server, fast_pacer(Duration::ZERO)), &auth_config())
        .with_timing(Duration::from_millis(10), Duration::from_secs(5));
    let tokens = TokenManager::new(
        flow,
        &auth_config(),
        Arc::new(ReadOnlyStore),
        Arc::new(RecordingPresenter::default()),
    );

    let err = tokens.login(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err.root(), ApiError::CredentialStore(_)), "{:?}", err);
    assert!(tokens.credential().await.unwrap().is_none());
    assert_eq!(tokens.state(), TokenState::NoCredential);
}

#[tokio::test]
async fn test_refresh_failure_is_classified() {
    let stale = Credential::issued_now("access-1", "refresh-1", 10);
    let harness = Harness::with_credential(Some(stale)).await;
    Mock::given(method("POST"))
        .and(path("/open/refreshToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(failed(990001, "unexpected")))
        .mount(&harness.server)
        .await;

    let err = harness
        .tokens
        .access_token(&CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Permanent);
    assert_eq!(err.provider_code(), Some(990001));
    assert_eq!(harness.tokens.state(), TokenState::Active);
}

#[tokio::test]
async fn test_logout_clears_store() {
    let harness = Harness::logged_in().await;

    harness.tokens.logout().await.unwrap();

    assert!(harness.store.current().await.is_none());
    assert_eq!(harness.tokens.state(), TokenState::NoCredential);
    assert!(harness.tokens.credential().await.unwrap().is_none());
}
