//! Command-line argument grammar, built with `clap`'s derive API: one
//! top-level [`Args`] with a single [`Commands::Build`] subcommand (room
//! for more sinks/subcommands later without reshaping the entry point).

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "containerize", about = "Builds and publishes JVM application container images without a local container daemon", version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Print debug-level detail for every pipeline step.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Suppress all non-error output.
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build an image from a base image plus local application layers.
    Build(BuildArgs),
}

#[derive(Debug, Parser)]
pub struct BuildArgs {
    /// The base image to build on top of, e.g. `eclipse-temurin:21-jre` or
    /// `scratch`.
    #[arg(long)]
    pub base: String,

    /// Where to push the built image, e.g. `localhost:5000/app:latest`.
    /// Required unless `--tarball` is given.
    #[arg(long)]
    pub target: Option<String>,

    /// Writes a `docker load`-compatible tarball here instead of pushing.
    #[arg(long)]
    pub tarball: Option<PathBuf>,

    /// An application layer: `kind=source-dir:container-prefix`, e.g.
    /// `dependencies=target/deps:/app/lib`. Repeatable; each `kind` must be
    /// unique.
    #[arg(long = "layer", value_parser = parse_layer_arg)]
    pub layers: Vec<(String, PathBuf, String)>,

    /// The container entrypoint (space-separated as multiple values).
    #[arg(long)]
    pub entrypoint: Vec<String>,

    /// The container command (space-separated as multiple values).
    #[arg(long)]
    pub cmd: Vec<String>,

    /// An environment variable `KEY=VALUE`. Repeatable.
    #[arg(long = "env", value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    /// An OCI label `KEY=VALUE`. Repeatable.
    #[arg(long = "label", value_parser = parse_key_value)]
    pub labels: Vec<(String, String)>,

    /// An exposed port spec: `80`, `80/udp`, or `8000-8010`. Repeatable.
    #[arg(long = "expose")]
    pub exposed_ports: Vec<String>,

    /// The user the container runs as.
    #[arg(long)]
    pub user: Option<String>,

    /// The container's working directory.
    #[arg(long = "workdir")]
    pub working_dir: Option<String>,

    /// Target platform as `os/architecture[/variant]`, e.g. `linux/arm64`.
    #[arg(long, default_value = "linux/amd64")]
    pub platform: String,

    /// A credential helper name to try, e.g. `ecr-login` for
    /// `docker-credential-ecr-login`. Repeatable; tried in order before
    /// falling back to `~/.docker/config.json`.
    #[arg(long = "credential-helper")]
    pub credential_helpers: Vec<String>,

    /// Registry username, paired with `--password`.
    #[arg(long, requires = "password")]
    pub username: Option<String>,

    /// Registry password or identity token, paired with `--username`.
    #[arg(long, requires = "username")]
    pub password: Option<String>,

    /// Allow plain HTTP / self-signed TLS for registries that look local
    /// (`localhost`, `127.0.0.1`, a bare hostname with no TLD).
    #[arg(long)]
    pub allow_insecure_registries: bool,

    /// Overrides the layer cache directory (default `$HOME/.cache/containerize`).
    #[arg(long = "cache-dir")]
    pub cache_dir: Option<PathBuf>,
}

fn parse_key_value(input: &str) -> Result<(String, String), String> {
    input
        .split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {input:?}"))
}

fn parse_layer_arg(input: &str) -> Result<(String, PathBuf, String), String> {
    let (kind, rest) = input
        .split_once('=')
        .ok_or_else(|| format!("expected kind=source:container-prefix, got {input:?}"))?;
    let (source, prefix) = rest
        .split_once(':')
        .ok_or_else(|| format!("expected kind=source:container-prefix, got {input:?}"))?;
    Ok((kind.to_string(), PathBuf::from(source), prefix.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_build_invocation() {
        let args = Args::parse_from([
            "containerize",
            "build",
            "--base",
            "eclipse-temurin:21-jre",
            "--target",
            "localhost:5000/app:v1",
            "--layer",
            "classes=target/classes:/app/classes",
            "--entrypoint",
            "java",
            "--env",
            "JAVA_OPTS=-Xmx512m",
            "--expose",
            "8080",
        ]);
        match args.command {
            Commands::Build(build) => {
                assert_eq!(build.base, "eclipse-temurin:21-jre");
                assert_eq!(build.target.as_deref(), Some("localhost:5000/app:v1"));
                assert_eq!(build.layers, vec![("classes".to_string(), PathBuf::from("target/classes"), "/app/classes".to_string())]);
                assert_eq!(build.env, vec![("JAVA_OPTS".to_string(), "-Xmx512m".to_string())]);
                assert_eq!(build.exposed_ports, vec!["8080".to_string()]);
            }
        }
    }

    #[test]
    fn rejects_a_malformed_layer_spec() {
        assert!(parse_layer_arg("classes").is_err());
        assert!(parse_layer_arg("classes=target/classes").is_err());
    }
}
