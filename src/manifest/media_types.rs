//! Media type constants for every schema [`crate::manifest`] understands.

pub const DOCKER_MANIFEST_V2_1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const DOCKER_MANIFEST_V2_2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_CONTAINER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Every media type this crate can read, in preference order, for the
/// registry client's `Accept` header on a manifest pull.
pub fn all_accept_types() -> Vec<&'static str> {
    vec![
        OCI_MANIFEST,
        DOCKER_MANIFEST_V2_2,
        OCI_IMAGE_INDEX,
        DOCKER_MANIFEST_LIST,
        DOCKER_MANIFEST_V2_1,
    ]
}

pub fn is_list_or_index(media_type: &str) -> bool {
    media_type == DOCKER_MANIFEST_LIST || media_type == OCI_IMAGE_INDEX
}

pub fn is_v2_1(media_type: &str) -> bool {
    media_type == DOCKER_MANIFEST_V2_1
}
