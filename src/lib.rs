//! containerize
//!
//! Builds and publishes container images for JVM applications directly
//! against a registry — no local container daemon involved. Given a base
//! image reference and a set of local directories to lay down as
//! application layers, this crate resolves the base image's manifest,
//! builds and content-addresses every application layer, caches layers on
//! disk so unchanged inputs never get rebuilt or re-uploaded, authenticates
//! against the registry's token protocol (or a credential helper), and
//! pushes a new manifest — or, with a tarball sink, writes a
//! `docker load`-compatible tar instead.
//!
//! ## Modules
//! - [`model`] - the in-memory image/layer/credential data model.
//! - [`reference`] - image reference parsing and normalization.
//! - [`digest`] - SHA-256 digests and the one-pass hashing `Blob` trait.
//! - [`error`] - the crate's error taxonomy and HTTP status mapping.
//! - [`layer`] - builds reproducible tar.gz layers from local files.
//! - [`cache`] - the on-disk, content-addressed layer cache.
//! - [`manifest`] - manifest/container-config wire schemas and translation.
//! - [`registry`] - the registry HTTP v2 client, auth, and transport.
//! - [`logging`] - user-facing output.
//! - [`dag`] - the bounded-concurrency step executor the pipeline runs on.
//! - [`config`] - the validated [`config::BuildConfig`] surface.
//! - [`pipeline`] - wires every module above into the build-and-publish DAG.
//! - [`progress`] - the hierarchical progress tree.
//! - [`tarball`] - the tarball sink.
//! - [`cli`] - argument parsing and the binary's entry point glue.

pub mod cache;
pub mod cli;
pub mod config;
pub mod dag;
pub mod digest;
pub mod error;
pub mod layer;
pub mod logging;
pub mod manifest;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod reference;
pub mod registry;
pub mod tarball;

pub use config::{BuildConfig, BuildConfigBuilder};
pub use error::{BuildError, Result};
pub use pipeline::{BuildResult, Pipeline};
pub use reference::ImageReference;
