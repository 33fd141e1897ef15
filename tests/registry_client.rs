//! Integration tests driving [`containerize::registry`] against a mock
//! registry, exercising the HTTP surface `RegistryClient` actually speaks
//! rather than its internals.

use containerize::digest::{BlobDescriptor, BytesBlob, Sha256Digest};
use containerize::registry::{CredentialChain, RegistryClient, RegistryClientConfig};
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> RegistryClient {
    let registry = server.uri().trim_start_matches("http://").to_string();
    let config = RegistryClientConfig {
        allow_insecure_registries: true,
        ..RegistryClientConfig::default()
    };
    RegistryClient::new(registry, config, CredentialChain::new(Vec::new())).unwrap()
}

#[tokio::test]
async fn check_blob_reports_presence_via_head() {
    let server = MockServer::start().await;
    let digest = Sha256Digest::of_bytes(b"layer-bytes");

    Mock::given(method("HEAD"))
        .and(path(format!("/v2/my/app/blobs/{digest}")))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = client_for(&server);
    assert!(client.check_blob("my/app", &digest).await.unwrap());
}

#[tokio::test]
async fn check_blob_returns_false_on_404() {
    let server = MockServer::start().await;
    let digest = Sha256Digest::of_bytes(b"missing");

    Mock::given(method("HEAD"))
        .and(path(format!("/v2/my/app/blobs/{digest}")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client_for(&server);
    assert!(!client.check_blob("my/app", &digest).await.unwrap());
}

#[tokio::test]
async fn pull_blob_streams_body_into_the_sink_and_verifies_digest() {
    let server = MockServer::start().await;
    let content = b"hello layer".to_vec();
    let digest = Sha256Digest::of_bytes(&content);

    Mock::given(method("GET"))
        .and(path(format!("/v2/my/app/blobs/{digest}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let mut out = Vec::new();
    client.pull_blob("my/app", &digest, &mut out).await.unwrap();
    assert_eq!(out, content);

    let observed = Sha256Digest::of_bytes(&out);
    RegistryClient::verify_pulled_digest(&digest, &observed).unwrap();
}

#[tokio::test]
async fn push_blob_mounts_when_the_registry_returns_201_on_initiate() {
    let server = MockServer::start().await;
    let content = b"already present".to_vec();
    let digest = Sha256Digest::of_bytes(&content);
    let descriptor = BlobDescriptor::new(digest, content.len() as u64);

    Mock::given(method("POST"))
        .and(path("/v2/my/app/blobs/uploads/"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let blob: Arc<dyn containerize::digest::Blob> = Arc::new(BytesBlob(content));
    let outcome = client.push_blob("my/app", blob, &descriptor, None).await.unwrap();
    assert_eq!(outcome, containerize::registry::PushOutcome::Mounted);
}

#[tokio::test]
async fn push_blob_runs_the_three_phase_upload_when_not_already_present() {
    let server = MockServer::start().await;
    let content = b"new layer bytes".to_vec();
    let digest = Sha256Digest::of_bytes(&content);
    let descriptor = BlobDescriptor::new(digest, content.len() as u64);
    let upload_location = format!("{}/v2/my/app/blobs/uploads/abc123", server.uri());

    Mock::given(method("POST"))
        .and(path("/v2/my/app/blobs/uploads/"))
        .respond_with(ResponseTemplate::new(202).append_header("Location", upload_location.as_str()))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/v2/my/app/blobs/uploads/abc123"))
        .respond_with(ResponseTemplate::new(202).append_header("Location", upload_location.as_str()))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v2/my/app/blobs/uploads/abc123"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let blob: Arc<dyn containerize::digest::Blob> = Arc::new(BytesBlob(content));
    let outcome = client.push_blob("my/app", blob, &descriptor, None).await.unwrap();
    assert_eq!(outcome, containerize::registry::PushOutcome::Uploaded);
}

#[tokio::test]
async fn send_authed_retries_once_after_a_bearer_challenge() {
    let server = MockServer::start().await;
    let digest = Sha256Digest::of_bytes(b"needs-auth");

    let token_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "sometoken"})))
        .mount(&token_server)
        .await;

    let challenge = format!(
        "Bearer realm=\"{}/token\",service=\"registry\",scope=\"repository:my/app:pull\"",
        token_server.uri()
    );
    Mock::given(method("HEAD"))
        .and(path(format!("/v2/my/app/blobs/{digest}")))
        .respond_with(ResponseTemplate::new(401).append_header("WWW-Authenticate", challenge.as_str()))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path(format!("/v2/my/app/blobs/{digest}")))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = client_for(&server);
    assert!(client.check_blob("my/app", &digest).await.unwrap());
}

#[tokio::test]
async fn push_manifest_returns_the_pushed_digest() {
    use containerize::manifest::Translator;
    use containerize::model::{Image, Platform};

    let server = MockServer::start().await;
    let image = Image::default();
    let config = Translator::build_container_config(&image, &Platform::default()).unwrap();
    let (_config_bytes, config_descriptor) = Translator::config_blob(&config).unwrap();
    let manifest = Translator::build_manifest(&image, config_descriptor, false).unwrap();
    let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
    let expected_digest = Sha256Digest::of_bytes(&manifest_bytes);

    Mock::given(method("PUT"))
        .and(path("/v2/my/app/manifests/latest"))
        .respond_with(ResponseTemplate::new(201).append_header("Docker-Content-Digest", expected_digest.to_string().as_str()))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let digest = client.push_manifest("my/app", "latest", &manifest).await.unwrap();
    assert_eq!(digest, expected_digest);
}
