//! Converts parsed [`Args`] into a [`crate::config::BuildConfig`] and drives
//! the pipeline from argument parsing through to either a registry push or
//! a tarball write.

use crate::cli::args::{Args, BuildArgs, Commands};
use crate::config::{BuildConfig, BuildConfigBuilder, CacheConfig, LayerSpec};
use crate::error::{BuildError, Result};
use crate::logging::Logger;
use crate::model::{Credential, Platform, Port};
use crate::pipeline::Pipeline;
use crate::reference::ImageReference;
use crate::registry::CredentialSource;
use std::path::PathBuf;
use std::time::SystemTime;

pub async fn run(args: Args) -> Result<()> {
    let logger = if args.quiet {
        Logger::new_quiet()
    } else {
        Logger::new(args.verbose)
    };

    match args.command {
        Commands::Build(build) => run_build(build, logger).await,
    }
}

async fn run_build(build: BuildArgs, logger: Logger) -> Result<()> {
    let config = build_config(build)?;
    let pipeline = Pipeline::new(config, logger.clone())?;
    let result = pipeline.run().await?;
    logger.summary_kv(
        "Build complete",
        &[
            ("image", result.image_reference.to_string()),
            ("manifest digest", result.manifest_digest.to_string()),
        ],
    );
    Ok(())
}

/// Resolves the credential chain in priority order: explicit
/// `--username`/`--password`, then any `--credential-helper`s in the order
/// given, then `~/.docker/config.json`.
fn build_config(build: BuildArgs) -> Result<BuildConfig> {
    let base_ref = ImageReference::parse(&build.base)?;
    let platform = parse_platform(&build.platform)?;

    let mut builder = BuildConfigBuilder::new()
        .base_ref(base_ref)
        .platform(platform)
        .entrypoint(build.entrypoint)
        .cmd(build.cmd)
        .allow_insecure_registries(build.allow_insecure_registries)
        .creation_time(SystemTime::now());

    if let (Some(username), Some(password)) = (build.username, build.password) {
        builder = builder.credential_source(CredentialSource::Explicit(Credential::new(username, password)));
    }
    for helper in build.credential_helpers {
        builder = builder.credential_source(CredentialSource::Helper(helper));
    }
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        builder = builder.credential_source(CredentialSource::DockerConfig(
            home.join(".docker").join("config.json"),
        ));
    }

    if let Some(target) = &build.target {
        builder = builder.target_ref(ImageReference::parse(target)?);
    }
    if let Some(tarball) = build.tarball {
        builder = builder.tarball_sink(tarball);
    }

    for (key, value) in build.env {
        builder = builder.env(key, value);
    }
    for (key, value) in build.labels {
        builder = builder.label(key, value);
    }
    for spec in &build.exposed_ports {
        for port in Port::parse_spec(spec)? {
            builder = builder.exposed_port(port);
        }
    }
    if let Some(user) = build.user {
        builder = builder.user(user);
    }
    if let Some(working_dir) = build.working_dir {
        builder = builder.working_dir(working_dir);
    }
    for (kind, source, prefix) in build.layers {
        builder = builder.layer(LayerSpec::new(kind, source, prefix));
    }

    if let Some(cache_dir) = build.cache_dir {
        builder = builder.cache(CacheConfig {
            root: cache_dir,
            ..CacheConfig::default()
        });
    }

    builder.build()
}

fn parse_platform(spec: &str) -> Result<Platform> {
    let mut parts = spec.split('/');
    let os = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BuildError::Validation(format!("invalid platform {spec:?}")))?;
    let architecture = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BuildError::Validation(format!("invalid platform {spec:?}: missing architecture")))?;
    let variant = parts.next().map(|s| s.to_string());
    Ok(Platform {
        os: os.to_string(),
        architecture: architecture.to_string(),
        variant,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_platform_with_and_without_variant() {
        let p = parse_platform("linux/amd64").unwrap();
        assert_eq!(p.os, "linux");
        assert_eq!(p.architecture, "amd64");
        assert!(p.variant.is_none());

        let p = parse_platform("linux/arm/v7").unwrap();
        assert_eq!(p.variant.as_deref(), Some("v7"));
    }

    #[test]
    fn rejects_platform_missing_architecture() {
        assert!(parse_platform("linux").is_err());
    }
}
