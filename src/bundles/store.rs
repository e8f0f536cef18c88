//! Loading and atomically publishing a route's bundle list.
//!
//! All three files are first staged under temporary names in the destination
//! directory and flushed to disk.  Only then are they renamed into place, the
//! JSON model last as the commit point.  A concurrent reader observes either
//! the complete previous file or the complete new one.  If a rename fails,
//! the files already replaced get their previous contents back, so a failed
//! publish leaves the previous list in place.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, instrument, warn};

use super::list::BundleList;
use super::manifest::{
    render_bundle_list, UriStyle, BUNDLE_LIST_FILENAME, BUNDLE_LIST_JSON_FILENAME,
    REPO_BUNDLE_LIST_FILENAME,
};
use super::ManifestError;
use crate::storage::{self, Route};

/// Data-access interface for a route's published bundle list.
pub trait ManifestStore: Send + Sync {
    /// Load the current list from `web_dir`, or `None` if nothing has been
    /// published yet.
    fn load(&self, web_dir: &Path) -> Result<Option<BundleList>, ManifestError>;

    /// Replace the published list for `route` with `list`.
    fn publish(&self, route: &Route, web_dir: &Path, list: &BundleList) -> Result<(), ManifestError>;
}

/// [`ManifestStore`] backed by plain files in the route's web directory.
#[derive(Debug, Clone, Default)]
pub struct FsManifestStore;

impl ManifestStore for FsManifestStore {
    fn load(&self, web_dir: &Path) -> Result<Option<BundleList>, ManifestError> {
        let path = web_dir.join(BUNDLE_LIST_JSON_FILENAME);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ManifestError::Read { path, source }),
        };
        let list = serde_json::from_slice(&bytes)
            .map_err(|source| ManifestError::Decode { path, source })?;
        Ok(Some(list))
    }

    #[instrument(skip(self, list), fields(%route, bundles = list.len()))]
    fn publish(&self, route: &Route, web_dir: &Path, list: &BundleList) -> Result<(), ManifestError> {
        std::fs::create_dir_all(web_dir).map_err(|source| ManifestError::Write {
            path: web_dir.to_path_buf(),
            source,
        })?;

        let directory_relative = render_bundle_list(list, &UriStyle::DirectoryRelative);
        let file_relative = render_bundle_list(
            list,
            &UriStyle::FileRelative {
                repo_name: route.name().to_string(),
            },
        );
        let json = serde_json::to_vec_pretty(list).map_err(ManifestError::Encode)?;

        let staged = [
            (BUNDLE_LIST_FILENAME, directory_relative.into_bytes()),
            (REPO_BUNDLE_LIST_FILENAME, file_relative.into_bytes()),
            (BUNDLE_LIST_JSON_FILENAME, json),
        ]
        .into_iter()
        .map(|(name, contents)| stage(web_dir, name, &contents))
        .collect::<Result<Vec<_>, _>>()?;

        let mut installed = Vec::with_capacity(staged.len());
        for (path, tmp) in staged {
            match install(path, tmp) {
                Ok(replaced) => installed.push(replaced),
                Err(e) => {
                    roll_back(installed);
                    return Err(e);
                }
            }
        }

        debug!("bundle list published");
        Ok(())
    }
}

/// A manifest file that has been replaced, with what it held before.
struct Replaced {
    path: PathBuf,
    previous: Option<Vec<u8>>,
}

/// Write `contents` to a synced temporary file next to `web_dir/name`.
fn stage(web_dir: &Path, name: &str, contents: &[u8]) -> Result<(PathBuf, NamedTempFile), ManifestError> {
    let path = web_dir.join(name);
    let write = || -> io::Result<NamedTempFile> {
        let mut tmp = tempfile::Builder::new().prefix(".tmp-").tempfile_in(web_dir)?;
        tmp.write_all(contents)?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    };
    let tmp = write().map_err(|source| ManifestError::Write {
        path: path.clone(),
        source,
    })?;
    Ok((path, tmp))
}

fn install(path: PathBuf, tmp: NamedTempFile) -> Result<Replaced, ManifestError> {
    let previous = match std::fs::read(&path) {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(source) => return Err(ManifestError::Write { path, source }),
    };
    if let Err(e) = tmp.persist(&path) {
        return Err(ManifestError::Write {
            path,
            source: e.error,
        });
    }
    Ok(Replaced { path, previous })
}

fn roll_back(installed: Vec<Replaced>) {
    for replaced in installed.into_iter().rev() {
        let restored = match &replaced.previous {
            Some(bytes) => storage::write_atomically(&replaced.path, bytes),
            None => std::fs::remove_file(&replaced.path),
        };
        match restored {
            Ok(()) => debug!(path = %replaced.path.display(), "manifest restored"),
            Err(e) => warn!(
                path = %replaced.path.display(),
                error = %e,
                "failed to restore manifest after aborted publish"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
