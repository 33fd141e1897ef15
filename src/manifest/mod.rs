//! Maps between the in-memory [`crate::model::Image`] and the on-wire
//! manifest schemas: Docker v2.2, Docker v2.1, OCI, and manifest
//! list/index.

pub mod media_types;
pub mod schema;
pub mod translator;

pub use translator::{ParsedManifest, Translator};
