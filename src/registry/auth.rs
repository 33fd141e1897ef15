//! Bearer challenge parsing and token acquisition.

use crate::error::handlers::auth_error;
use crate::error::{BuildError, Result};
use crate::model::{Authorization, Credential};
use crate::registry::credential::CredentialChain;
use reqwest::Client;

/// A parsed `WWW-Authenticate: Bearer realm="...",service="...",scope="..."`
/// challenge. `scope` is optional — some registries omit it on the initial
/// anonymous probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub realm: String,
    pub service: String,
    pub scope: Option<String>,
}

impl AuthChallenge {
    /// Parses the header value, missing `Bearer`/`realm`/`service` all fail
    /// with [`BuildError::RegistryAuthenticationFailed`].
    pub fn parse(header: &str) -> Result<Self> {
        let params = header.strip_prefix("Bearer ").ok_or_else(|| {
            BuildError::RegistryAuthenticationFailed(
                "WWW-Authenticate header is not a Bearer challenge".to_string(),
            )
        })?;

        let mut realm = None;
        let mut service = None;
        let mut scope = None;

        for param in split_challenge_params(params) {
            let (key, value) = match param.split_once('=') {
                Some(kv) => kv,
                None => continue,
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }

        let realm = realm.ok_or_else(|| {
            BuildError::RegistryAuthenticationFailed("challenge is missing realm".to_string())
        })?;
        let service = service.ok_or_else(|| {
            BuildError::RegistryAuthenticationFailed("challenge is missing service".to_string())
        })?;

        Ok(Self { realm, service, scope })
    }

    pub fn with_scope(&self, scope: impl Into<String>) -> Self {
        Self {
            scope: Some(scope.into()),
            ..self.clone()
        }
    }
}

/// Splits `a="b,c",d=e` on top-level commas only, so a comma inside a
/// quoted value (rare, but the grammar allows it) doesn't split a param.
fn split_challenge_params(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, ch) in input.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(input[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(input[start..].trim());
    parts
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

impl TokenResponse {
    fn into_token(self) -> Option<String> {
        self.token.or(self.access_token)
    }
}

/// Resolves credentials and exchanges them for bearer tokens. One
/// `Authenticator` is shared by a [`crate::registry::client::RegistryClient`]
/// and its base/target registries may each get their own instance.
pub struct Authenticator {
    http: Client,
    credentials: CredentialChain,
}

impl Authenticator {
    pub fn new(http: Client, credentials: CredentialChain) -> Self {
        Self { http, credentials }
    }

    /// Runs the challenge → credential → token exchange for `challenge`.
    /// Callers (namely [`crate::registry::client::RegistryClient`]) own
    /// caching the result; this always performs the exchange.
    pub async fn authenticate(
        &self,
        server: &str,
        challenge: &AuthChallenge,
    ) -> Result<Authorization> {
        let credential = self.credentials.resolve(server).await?;
        self.request_token(challenge, credential.as_ref()).await
    }

    async fn request_token(
        &self,
        challenge: &AuthChallenge,
        credential: Option<&Credential>,
    ) -> Result<Authorization> {
        let response = match credential {
            Some(cred) if cred.is_refresh_token() => {
                let mut form = vec![
                    ("grant_type", "refresh_token"),
                    ("service", &challenge.service),
                    ("refresh_token", &cred.password),
                ];
                if let Some(scope) = &challenge.scope {
                    form.push(("scope", scope));
                }
                self.http
                    .post(&challenge.realm)
                    .form(&form)
                    .send()
                    .await
                    .map_err(BuildError::from)?
            }
            Some(cred) => {
                let mut request = self
                    .http
                    .get(&challenge.realm)
                    .query(&[("service", &challenge.service)])
                    .basic_auth(&cred.username, Some(&cred.password));
                if let Some(scope) = &challenge.scope {
                    request = request.query(&[("scope", scope)]);
                }
                request.send().await.map_err(BuildError::from)?
            }
            None => {
                let mut request = self.http.get(&challenge.realm).query(&[("service", &challenge.service)]);
                if let Some(scope) = &challenge.scope {
                    request = request.query(&[("scope", scope)]);
                }
                request.send().await.map_err(BuildError::from)?
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(auth_error(status, &body));
        }

        let parsed: TokenResponse = response.json().await.map_err(BuildError::from)?;
        let token = parsed
            .into_token()
            .ok_or_else(|| BuildError::RegistryAuthenticationFailed("no token in response".to_string()))?;

        Ok(Authorization::bearer(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_challenge() {
        let challenge = AuthChallenge::parse(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:app:pull,push""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.example.com/token");
        assert_eq!(challenge.service, "registry.example.com");
        assert_eq!(challenge.scope.as_deref(), Some("repository:app:pull,push"));
    }

    #[test]
    fn missing_realm_is_an_error() {
        let err = AuthChallenge::parse(r#"Bearer service="registry.example.com""#).unwrap_err();
        assert!(matches!(err, BuildError::RegistryAuthenticationFailed(_)));
    }

    #[test]
    fn non_bearer_header_is_an_error() {
        assert!(AuthChallenge::parse(r#"Basic realm="x""#).is_err());
    }

    #[test]
    fn with_scope_overrides_scope_only() {
        let challenge = AuthChallenge::parse(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com""#,
        )
        .unwrap();
        let scoped = challenge.with_scope("repository:app:pull");
        assert_eq!(scoped.realm, challenge.realm);
        assert_eq!(scoped.scope.as_deref(), Some("repository:app:pull"));
    }
}
