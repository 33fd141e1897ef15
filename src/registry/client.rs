//! The OCI/Docker Registry HTTP API v2 client: manifest GET/PUT, blob
//! HEAD/GET/POST/PATCH/PUT, and cross-repository mount.
//!
//! Every endpoint goes through [`Transport::send_with_retry`] for
//! `5xx`/connection-error retries, and through [`RegistryClient::send_authed`]
//! for the 401 → challenge → refresh → retry-once flow.
//! No endpoint here buffers a full layer in memory: [`RegistryClient::pull_blob`]
//! streams into the caller's sink and [`RegistryClient::push_blob`] streams
//! out of a [`crate::digest::Blob`] via [`super::streaming::stream_blob`].

use super::auth::{AuthChallenge, Authenticator};
use super::credential::CredentialChain;
use super::streaming::stream_blob;
use super::transport::{backoff_sleep, is_retryable_reqwest_error, is_retryable_status, RegistryClientConfig, Transport};
use crate::digest::{Blob, BlobDescriptor, Sha256Digest};
use crate::error::{handlers, BuildError, Result};
use crate::manifest::media_types::all_accept_types;
use crate::manifest::schema::ManifestV2;
use crate::model::Authorization;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use std::io::Write;
use std::sync::{Arc, RwLock};

pub struct RegistryClient {
    transport: Transport,
    authenticator: Authenticator,
    registry: String,
    scheme: &'static str,
    authorization: RwLock<Option<Authorization>>,
}

/// The outcome of the three-phase blob push state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// `201 Created` on initiate: the blob already existed or was mounted
    /// cross-repository; nothing was uploaded.
    Mounted,
    /// The write/commit phases ran and the blob is now present.
    Uploaded,
}

impl RegistryClient {
    pub fn new(
        registry: impl Into<String>,
        config: RegistryClientConfig,
        credentials: CredentialChain,
    ) -> Result<Self> {
        let registry = registry.into();
        let scheme = if config.allow_insecure_registries && is_plain_http_registry(&registry) {
            "http"
        } else {
            "https"
        };
        let transport = Transport::new(config)?;
        let authenticator = Authenticator::new(transport.http().clone(), credentials);
        Ok(Self {
            transport,
            authenticator,
            registry,
            scheme,
            authorization: RwLock::new(None),
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    fn blob_url(&self, repository: &str, digest: &Sha256Digest) -> String {
        format!("{}://{}/v2/{repository}/blobs/{digest}", self.scheme, self.registry)
    }

    fn manifest_url(&self, repository: &str, reference: &str) -> String {
        format!("{}://{}/v2/{repository}/manifests/{reference}", self.scheme, self.registry)
    }

    fn uploads_url(&self, repository: &str) -> String {
        format!("{}://{}/v2/{repository}/blobs/uploads/", self.scheme, self.registry)
    }

    /// Pulls a manifest, following a manifest list/index down to the entry
    /// for `platform` by re-issuing the GET.
    pub async fn pull_manifest(
        &self,
        repository: &str,
        reference: &str,
        platform: &crate::model::Platform,
    ) -> Result<(crate::manifest::ParsedManifest, Sha256Digest)> {
        let (parsed, digest) = self.pull_manifest_raw(repository, reference).await?;
        match parsed {
            crate::manifest::ParsedManifest::Index(index) => {
                let entry = crate::manifest::Translator::select_platform(&index, platform)?;
                self.pull_manifest_raw(repository, entry.digest.as_str()).await
            }
            other => Ok((other, digest)),
        }
    }

    async fn pull_manifest_raw(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<(crate::manifest::ParsedManifest, Sha256Digest)> {
        let url = self.manifest_url(repository, reference);
        let accept = all_accept_types().join(", ");
        let scope = format!("repository:{repository}:pull");

        let response = self
            .send_authed(repository, &scope, Method::GET, &url, |req| req.header("Accept", accept.clone()))
            .await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.bytes().await.map_err(BuildError::from)?;
        let digest = Sha256Digest::of_bytes(&body);
        let parsed = crate::manifest::Translator::parse(&content_type, &body)?;
        Ok((parsed, digest))
    }

    /// `HEAD /v2/<repo>/manifests/<ref>` — `Some(digest)` if present.
    pub async fn check_manifest(&self, repository: &str, reference: &str) -> Result<Option<Sha256Digest>> {
        let url = self.manifest_url(repository, reference);
        let scope = format!("repository:{repository}:pull");
        let response = self
            .send_authed_allow_404(repository, &scope, Method::HEAD, &url, |req| req)
            .await?;
        match response {
            None => Ok(None),
            Some(response) => Ok(response
                .headers()
                .get("Docker-Content-Digest")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| Sha256Digest::parse(s).ok())),
        }
    }

    /// `HEAD /v2/<repo>/blobs/<digest>` → whether the blob exists.
    pub async fn check_blob(&self, repository: &str, digest: &Sha256Digest) -> Result<bool> {
        let url = self.blob_url(repository, digest);
        let scope = format!("repository:{repository}:pull");
        let response = self
            .send_authed_allow_404(repository, &scope, Method::HEAD, &url, |req| req)
            .await?;
        Ok(response.is_some())
    }

    /// Streams a blob into `sink` and verifies the observed digest matches
    /// `digest`. Callers wrap `sink` in a [`crate::digest::HashingSink`] so
    /// the observed digest is available from `sink` once this returns.
    pub async fn pull_blob(&self, repository: &str, digest: &Sha256Digest, sink: &mut dyn Write) -> Result<()> {
        let url = self.blob_url(repository, digest);
        let scope = format!("repository:{repository}:pull");
        let mut response = self
            .send_authed(repository, &scope, Method::GET, &url, |req| req)
            .await?;

        while let Some(chunk) = response.chunk().await.map_err(BuildError::from)? {
            sink.write_all(&chunk)?;
        }
        sink.flush()?;
        Ok(())
    }

    /// Verifies a just-pulled blob's observed digest against what was
    /// requested; `UnexpectedBlobDigest` on mismatch.
    pub fn verify_pulled_digest(requested: &Sha256Digest, observed: &Sha256Digest) -> Result<()> {
        if requested != observed {
            return Err(BuildError::UnexpectedBlobDigest {
                expected: requested.to_string(),
                actual: observed.to_string(),
            });
        }
        Ok(())
    }

    /// The three-phase blob push. `mount_from`, when given, attempts a
    /// cross-repository mount before falling back to a full upload.
    pub async fn push_blob(
        &self,
        repository: &str,
        blob: Arc<dyn Blob>,
        descriptor: &BlobDescriptor,
        mount_from: Option<&str>,
    ) -> Result<PushOutcome> {
        let scope = match mount_from {
            Some(source) => format!("repository:{repository}:pull,push repository:{source}:pull"),
            None => format!("repository:{repository}:push,pull"),
        };

        let mut url = self.uploads_url(repository);
        if let Some(source) = mount_from {
            url = format!("{url}?mount={}&from={source}", descriptor.digest);
        }

        let response = self
            .send_authed(repository, &scope, Method::POST, &url, |req| req)
            .await?;

        if response.status() == StatusCode::CREATED {
            return Ok(PushOutcome::Mounted);
        }
        if response.status() != StatusCode::ACCEPTED {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(handlers::registry_error("initiate blob upload", status, &body));
        }

        let mut location = single_location_header(&response)?;

        // Write phase: PATCH the blob bytes as a streaming body. Re-streamed
        // from the start against the most recently reported `Location` on
        // each attempt, since a monolithic PATCH leaves no partial offset to
        // resume from; only retried when the blob itself is replayable.
        let upload_client = self.transport.upload_client()?;
        let authorization = self.current_authorization();
        let max_retries = self.transport.config().max_retries;
        let mut attempt = 0u32;
        let written_descriptor = loop {
            let (body, descriptor_handle) = stream_blob(blob.clone()).into_parts();
            let mut request = upload_client
                .patch(&location)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(body);
            if let Some(auth) = &authorization {
                request = request.header(reqwest::header::AUTHORIZATION, auth.header_value());
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    location = response
                        .headers()
                        .get(reqwest::header::LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string())
                        .unwrap_or(location);
                    let written = descriptor_handle
                        .await
                        .map_err(|e| BuildError::Io(format!("blob producer task panicked: {e}")))??;
                    break written;
                }
                Ok(response) if blob.is_retryable() && is_retryable_status(response.status()) && attempt < max_retries => {
                    let _ = descriptor_handle.await;
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(handlers::registry_error("upload blob chunk", status, &body));
                }
                Err(err) if blob.is_retryable() && is_retryable_reqwest_error(&err) && attempt < max_retries => {
                    let _ = descriptor_handle.await;
                }
                Err(err) => return Err(BuildError::from(err)),
            }

            backoff_sleep(attempt).await;
            attempt += 1;
        };
        if written_descriptor.digest != descriptor.digest {
            return Err(BuildError::UnexpectedBlobDigest {
                expected: descriptor.digest.to_string(),
                actual: written_descriptor.digest.to_string(),
            });
        }

        // Commit phase: PUT with the digest query param, empty body.
        let commit_url = append_query(&location, &format!("digest={}", descriptor.digest));
        let mut request = upload_client.put(&commit_url).body(Vec::new());
        if let Some(auth) = &authorization {
            request = request.header(reqwest::header::AUTHORIZATION, auth.header_value());
        }
        let response = request.send().await.map_err(BuildError::from)?;
        if response.status() != StatusCode::CREATED && !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(handlers::registry_error("commit blob upload", status, &body));
        }

        Ok(PushOutcome::Uploaded)
    }

    /// `PUT /v2/<repo>/manifests/<tag-or-digest>`.
    pub async fn push_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &ManifestV2,
    ) -> Result<Sha256Digest> {
        let url = self.manifest_url(repository, reference);
        let scope = format!("repository:{repository}:push,pull");
        let body = serde_json::to_vec(manifest)?;
        let media_type = manifest.media_type.clone();

        let response = self
            .send_authed(repository, &scope, Method::PUT, &url, move |req| {
                req.header(reqwest::header::CONTENT_TYPE, media_type.clone())
                    .body(body.clone())
            })
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(handlers::registry_error("push manifest", status, &body));
        }

        Ok(response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Sha256Digest::parse(s).ok())
            .unwrap_or_else(|| Sha256Digest::of_bytes(&serde_json::to_vec(manifest).unwrap_or_default())))
    }

    fn current_authorization(&self) -> Option<Authorization> {
        self.authorization.read().unwrap().clone()
    }

    /// Sends a request, attaching the cached authorization if any. On a
    /// `401` with a `WWW-Authenticate` challenge, refreshes the token and
    /// retries exactly once; a second `401` surfaces
    /// [`BuildError::RegistryUnauthorized`].
    async fn send_authed<F>(
        &self,
        repository: &str,
        scope: &str,
        method: Method,
        url: &str,
        build: F,
    ) -> Result<Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let response = self.send_once(method.clone(), url, &build, self.current_authorization()).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = www_authenticate_challenge(&response)?.with_scope(scope);
        let authorization = self.authenticator.authenticate(&self.registry, &challenge).await?;
        *self.authorization.write().unwrap() = Some(authorization.clone());

        let retried = self.send_once(method, url, &build, Some(authorization)).await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            return Err(BuildError::RegistryUnauthorized {
                registry: self.registry.clone(),
                repository: repository.to_string(),
            });
        }
        Ok(retried)
    }

    /// Like [`Self::send_authed`] but treats a final `404` as `Ok(None)`
    /// instead of an error, for `HEAD` existence checks.
    async fn send_authed_allow_404<F>(
        &self,
        repository: &str,
        scope: &str,
        method: Method,
        url: &str,
        build: F,
    ) -> Result<Option<Response>>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        match self.send_authed(repository, scope, method, url, build).await {
            Ok(response) if response.status() == StatusCode::NOT_FOUND => Ok(None),
            Ok(response) if !response.status().is_success() => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                Err(handlers::registry_error("check", status, &body))
            }
            Ok(response) => Ok(Some(response)),
            Err(e) => Err(e),
        }
    }

    async fn send_once<F>(
        &self,
        method: Method,
        url: &str,
        build: &F,
        authorization: Option<Authorization>,
    ) -> Result<Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let http = self.transport.http().clone();
        self.transport
            .send_with_retry("registry request", || {
                let mut req = http.request(method.clone(), url);
                req = build(req);
                if let Some(auth) = &authorization {
                    req = req.header(reqwest::header::AUTHORIZATION, auth.header_value());
                }
                req
            })
            .await
    }
}

fn www_authenticate_challenge(response: &Response) -> Result<AuthChallenge> {
    let header = response
        .headers()
        .get(reqwest::header::WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            BuildError::RegistryAuthenticationFailed("401 response missing WWW-Authenticate".to_string())
        })?;
    AuthChallenge::parse(header)
}

fn single_location_header(response: &Response) -> Result<String> {
    let mut locations = response.headers().get_all(reqwest::header::LOCATION).iter();
    let first = locations
        .next()
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| BuildError::RegistryAuthenticationFailed("upload response missing Location".to_string()))?;
    if locations.next().is_some() {
        return Err(BuildError::RegistryError {
            operation: "initiate blob upload".to_string(),
            status: 202,
            entries: vec![crate::error::RegistryErrorEntry {
                code: "MULTIPLE_LOCATIONS".to_string(),
                message: "more than one Location header in upload response".to_string(),
                detail: None,
            }],
        });
    }
    Ok(first.to_string())
}

fn append_query(url: &str, query: &str) -> String {
    if url.contains('?') {
        format!("{url}&{query}")
    } else {
        format!("{url}?{query}")
    }
}

/// Matches the registries `--allow-insecure-registries` is documented to
/// cover: `localhost`/`127.0.0.1`, with or without a port, and a bare
/// hostname with no TLD (e.g. a single-label registry name on a private
/// network, as opposed to `registry.example.com`).
fn is_plain_http_registry(registry: &str) -> bool {
    let host = registry.split(':').next().unwrap_or(registry);
    host == "localhost" || host == "127.0.0.1" || !host.contains('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_query_handles_existing_query_string() {
        assert_eq!(append_query("http://x/y", "a=1"), "http://x/y?a=1");
        assert_eq!(append_query("http://x/y?z=2", "a=1"), "http://x/y?z=2&a=1");
    }

    #[test]
    fn is_plain_http_registry_matches_local_and_bare_hostnames() {
        assert!(is_plain_http_registry("localhost:5000"));
        assert!(is_plain_http_registry("127.0.0.1:5000"));
        assert!(is_plain_http_registry("my-registry"));
        assert!(is_plain_http_registry("my-registry:5000"));
        assert!(!is_plain_http_registry("registry.example.com"));
        assert!(!is_plain_http_registry("registry.example.com:5000"));
    }
}
