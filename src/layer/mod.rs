//! Layer construction: turning a set of [`FileEntry`](crate::model::FileEntry)
//! values into a reproducible, content-addressed tar.gz blob.

pub mod tar;

pub use tar::TarLayerBuilder;
