//! Bundle-list subsystem.
//!
//! Holds the bundle-list model ([`BundleList`]), its rendering to the Git
//! bundle-URI manifest format, creation-token allocation, and the
//! [`ManifestStore`] that loads and atomically publishes a route's list.

pub mod creation_token;
pub mod list;
pub mod manifest;
pub mod store;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use creation_token::{bundle_filename, next_creation_token};
pub use list::{BundleDescriptor, BundleList, BundleMode};
pub use manifest::{
    is_reserved_filename, render_bundle_list, UriStyle, BUNDLE_LIST_FILENAME,
    BUNDLE_LIST_JSON_FILENAME, REPO_BUNDLE_LIST_FILENAME,
};
pub use store::{FsManifestStore, ManifestStore};

/// Failure to read, decode or publish a bundle list.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to decode bundle list {}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode bundle list")]
    Encode(#[source] serde_json::Error),

    #[error("failed to write {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
