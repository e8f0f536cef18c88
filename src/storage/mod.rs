//! On-disk layout for hosted repositories.
//!
//! Every route owns two directories under the storage root:
//!
//! - `{root}/git/{key}` is the private working directory holding the bare
//!   clone and any staging files produced while a bundle is being written.
//! - `{root}/www/{key}` is the web directory that the HTTP layer reads from:
//!   published bundle files plus the bundle-list manifests.
//!
//! `{key}` is the route with its segments joined by `+`, which route segments
//! cannot contain.  Each route therefore gets one directory of its own, and
//! `org/repo` never contains the storage of `org/repo/docs`.
//!
//! Both paths are derived purely from the route string, so the registry, the
//! update engine and the web server always agree without talking to each
//! other.

pub mod route;

use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub use route::{Route, RouteError};

/// Name of the registry file under the storage root.
const REGISTRY_FILENAME: &str = "routes.json";

/// Joins route segments into a single directory name.
const KEY_SEPARATOR: &str = "+";

/// Working and web directories for a single route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePaths {
    pub repo_dir: PathBuf,
    pub web_dir: PathBuf,
}

/// Maps routes to directories beneath a single storage root.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the persisted route registry.
    pub fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILENAME)
    }

    /// Private working directory (bare clone + staging) for `route`.
    pub fn repo_dir(&self, route: &Route) -> PathBuf {
        self.root.join("git").join(storage_key(route))
    }

    /// Web-exposed directory (manifests + bundle files) for `route`.
    pub fn web_dir(&self, route: &Route) -> PathBuf {
        self.root.join("www").join(storage_key(route))
    }

    /// Advisory lock file guarding updates of `route` across processes.
    pub fn lock_path(&self, route: &Route) -> PathBuf {
        self.root
            .join("locks")
            .join(format!("{}.lock", storage_key(route)))
    }

    /// Both directories for `route`.
    pub fn paths(&self, route: &Route) -> RoutePaths {
        RoutePaths {
            repo_dir: self.repo_dir(route),
            web_dir: self.web_dir(route),
        }
    }
}

/// Replace `path` with `contents` via a synced temporary file in the same
/// directory followed by a rename.  Readers never observe a partial write.
pub fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new().prefix(".tmp-").tempfile_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// `true` if `dir` exists and contains at least one entry.
pub fn dir_has_entries(dir: &Path) -> io::Result<bool> {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Remove `dir` and everything below it; a missing directory is not an error.
pub fn remove_dir_if_present(dir: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Single path component naming `route` on disk.
fn storage_key(route: &Route) -> String {
    route.segments().collect::<Vec<_>>().join(KEY_SEPARATOR)
}
