//! Credential resolution chain: explicit config, credential helper
//! subprocess, Docker `config.json`, then unauthenticated.

use crate::error::{BuildError, Result};
use crate::model::Credential;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One entry in the resolution order. Tried top-to-bottom; the first source
/// that produces a credential wins.
pub enum CredentialSource {
    Explicit(Credential),
    Helper(String),
    DockerConfig(PathBuf),
}

pub struct CredentialChain {
    sources: Vec<CredentialSource>,
}

impl CredentialChain {
    pub fn new(sources: Vec<CredentialSource>) -> Self {
        Self { sources }
    }

    /// The chain the CLI builds by default: explicit credentials if given,
    /// then `~/.docker/config.json`, no credential helper (none configured
    /// without a `--credential-helper` flag).
    pub fn default_for_server(explicit: Option<Credential>) -> Self {
        let mut sources = Vec::new();
        if let Some(c) = explicit {
            sources.push(CredentialSource::Explicit(c));
        }
        if let Some(home) = home_dir() {
            sources.push(CredentialSource::DockerConfig(
                home.join(".docker").join("config.json"),
            ));
        }
        Self { sources }
    }

    pub async fn resolve(&self, server: &str) -> Result<Option<Credential>> {
        for source in &self.sources {
            let found = match source {
                CredentialSource::Explicit(c) => Some(c.clone()),
                CredentialSource::Helper(name) => run_credential_helper(name, server).await?,
                CredentialSource::DockerConfig(path) => read_docker_config(path, server)?,
            };
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }
}

#[derive(serde::Deserialize)]
struct HelperResponse {
    #[serde(rename = "ServerURL")]
    #[allow(dead_code)]
    server_url: Option<String>,
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

/// Invokes `docker-credential-<name> get`, writing the server URL to stdin
/// per the credential-helper protocol. A non-zero exit or an empty stdout
/// is treated as "no credential available", not a hard error — only a
/// missing binary is surfaced as [`BuildError::CredentialHelperNotFound`].
async fn run_credential_helper(name: &str, server: &str) -> Result<Option<Credential>> {
    use tokio::io::AsyncWriteExt;
    use tokio::process::Command;

    let program = format!("docker-credential-{name}");
    let mut child = Command::new(&program)
        .arg("get")
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BuildError::CredentialHelperNotFound(program.clone()),
            _ => BuildError::Io(format!("spawning {program}: {e}")),
        })?;

    if let Some(stdin) = child.stdin.as_mut() {
        stdin.write_all(server.as_bytes()).await?;
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Ok(None);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    if stdout.trim().is_empty() || stdout.contains("credentials not found") {
        return Ok(None);
    }

    let parsed: HelperResponse = serde_json::from_str(stdout.trim())?;
    Ok(Some(Credential::new(parsed.username, parsed.secret)))
}

#[derive(serde::Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: BTreeMap<String, DockerConfigAuthEntry>,
}

#[derive(serde::Deserialize)]
struct DockerConfigAuthEntry {
    auth: Option<String>,
}

fn read_docker_config(path: &Path, server: &str) -> Result<Option<Credential>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Ok(None),
    };
    let config: DockerConfigFile = serde_json::from_str(&contents)?;

    let entry = match config.auths.get(server) {
        Some(e) => e,
        None => return Ok(None),
    };
    let auth = match &entry.auth {
        Some(a) => a,
        None => return Ok(None),
    };

    use base64::Engine;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth)
        .map_err(|e| BuildError::Parse(format!("invalid base64 in docker config auth: {e}")))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|e| BuildError::Parse(format!("non-utf8 docker config auth: {e}")))?;

    match decoded.split_once(':') {
        Some((user, pass)) => Ok(Some(Credential::new(user, pass))),
        None => Ok(None),
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_credential_from_docker_config() {
        let tmp = tempfile::tempdir().unwrap();
        let config_path = tmp.path().join("config.json");
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode("user:pass");
        std::fs::write(
            &config_path,
            format!(r#"{{"auths":{{"registry.example.com":{{"auth":"{encoded}"}}}}}}"#),
        )
        .unwrap();

        let cred = read_docker_config(&config_path, "registry.example.com")
            .unwrap()
            .unwrap();
        assert_eq!(cred.username, "user");
        assert_eq!(cred.password, "pass");
    }

    #[test]
    fn missing_server_entry_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let config_path = tmp.path().join("config.json");
        std::fs::write(&config_path, r#"{"auths":{}}"#).unwrap();
        assert!(read_docker_config(&config_path, "registry.example.com")
            .unwrap()
            .is_none());
    }
}
