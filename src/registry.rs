//! Durable route registry.
//!
//! Maps each registered [`Route`] to its [`RepositoryRecord`].  The registry
//! is persisted as `routes.json` under the storage root and rewritten with
//! write-temp-then-rename on every mutation.
//!
//! Readers (the web server answers every request from it) work off an
//! in-memory snapshot that is reloaded from disk once it is older than the
//! configured refresh interval, so a route added by a separate CLI process
//! becomes visible to a running server without a restart.  Mutations made
//! through this instance update the snapshot immediately.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::storage::{self, Route, StorageLayout};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Per-route metadata owned by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub route: Route,
    pub repo_dir: PathBuf,
    pub web_dir: PathBuf,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("route {0} is already registered")]
    AlreadyExists(Route),

    #[error("route {0} is not registered")]
    NotFound(Route),

    #[error("route {0} has no working copy; use init")]
    NoWorkingCopy(Route),

    #[error("registry I/O failed on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("registry file {} is corrupt", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// On-disk shape of `routes.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    routes: Vec<RepositoryRecord>,
}

struct Snapshot {
    records: BTreeMap<Route, RepositoryRecord>,
    loaded_at: Instant,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct RouteRegistry {
    layout: StorageLayout,
    refresh_interval: Duration,
    snapshot: RwLock<Snapshot>,
    /// Serializes read-modify-write cycles on `routes.json`.
    write_lock: Mutex<()>,
}

impl RouteRegistry {
    /// Open the registry rooted at `layout`, loading `routes.json` if present.
    pub fn open(layout: StorageLayout, refresh_interval: Duration) -> Result<Self, RegistryError> {
        let records = load_records(&layout)?;
        debug!(routes = records.len(), "route registry loaded");
        Ok(Self {
            layout,
            refresh_interval,
            snapshot: RwLock::new(Snapshot {
                records,
                loaded_at: Instant::now(),
            }),
            write_lock: Mutex::new(()),
        })
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Register `route`, creating its working and web directories.
    ///
    /// Fails with [`RegistryError::AlreadyExists`] when the working directory
    /// already has content.  Otherwise the call is idempotent: an existing
    /// entry whose directory was removed out-of-band keeps its original
    /// registration time and gets fresh, empty directories.
    #[instrument(skip(self), fields(%route))]
    pub fn register(&self, route: &Route) -> Result<RepositoryRecord, RegistryError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records = load_records(&self.layout)?;

        let paths = self.layout.paths(route);
        if storage::dir_has_entries(&paths.repo_dir).map_err(|source| RegistryError::Io {
            path: paths.repo_dir.clone(),
            source,
        })? {
            return Err(RegistryError::AlreadyExists(route.clone()));
        }

        for dir in [&paths.repo_dir, &paths.web_dir] {
            std::fs::create_dir_all(dir).map_err(|source| RegistryError::Io {
                path: dir.clone(),
                source,
            })?;
        }

        let record = records
            .entry(route.clone())
            .or_insert_with(|| RepositoryRecord {
                route: route.clone(),
                repo_dir: paths.repo_dir.clone(),
                web_dir: paths.web_dir.clone(),
                registered_at: Utc::now(),
            })
            .clone();

        self.store(records)?;
        info!("route registered");
        Ok(record)
    }

    /// Register `route` again on top of its existing working copy.
    ///
    /// Recovers a route whose entry was lost from `routes.json` while its
    /// directories survived.  A route that is still registered is returned
    /// unchanged.
    #[instrument(skip(self), fields(%route))]
    pub fn reinstate(&self, route: &Route) -> Result<RepositoryRecord, RegistryError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records = load_records(&self.layout)?;
        if let Some(record) = records.get(route) {
            return Ok(record.clone());
        }

        let paths = self.layout.paths(route);
        let populated = storage::dir_has_entries(&paths.repo_dir).map_err(|source| {
            RegistryError::Io {
                path: paths.repo_dir.clone(),
                source,
            }
        })?;
        if !populated {
            return Err(RegistryError::NoWorkingCopy(route.clone()));
        }
        std::fs::create_dir_all(&paths.web_dir).map_err(|source| RegistryError::Io {
            path: paths.web_dir.clone(),
            source,
        })?;

        let record = RepositoryRecord {
            route: route.clone(),
            repo_dir: paths.repo_dir,
            web_dir: paths.web_dir,
            registered_at: Utc::now(),
        };
        records.insert(route.clone(), record.clone());
        self.store(records)?;
        info!("route reinstated");
        Ok(record)
    }

    /// Look up a single route.
    pub fn get(&self, route: &Route) -> Result<Option<RepositoryRecord>, RegistryError> {
        self.refresh_if_stale()?;
        let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        Ok(snapshot.records.get(route).cloned())
    }

    /// Look up `route` in `routes.json` itself, ignoring snapshot age.  Used
    /// on the write path, where a removal by another process must be seen.
    pub fn get_current(&self, route: &Route) -> Result<Option<RepositoryRecord>, RegistryError> {
        let records = load_records(&self.layout)?;
        let record = records.get(route).cloned();
        self.replace_snapshot(records);
        Ok(record)
    }

    /// Every registered route, ordered by route.
    pub fn list(&self) -> Result<Vec<RepositoryRecord>, RegistryError> {
        self.refresh_if_stale()?;
        let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        Ok(snapshot.records.values().cloned().collect())
    }

    /// Delete the entry for `route` and both of its directories.
    ///
    /// The entry is removed first so that readers stop resolving the route
    /// before its files disappear.  Callers must hold the route's update lock.
    #[instrument(skip(self), fields(%route))]
    pub fn remove(&self, route: &Route) -> Result<RepositoryRecord, RegistryError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records = load_records(&self.layout)?;

        let record = records
            .remove(route)
            .ok_or_else(|| RegistryError::NotFound(route.clone()))?;
        self.store(records)?;

        for dir in [&record.repo_dir, &record.web_dir] {
            storage::remove_dir_if_present(dir).map_err(|source| RegistryError::Io {
                path: dir.clone(),
                source,
            })?;
        }

        info!("route removed");
        Ok(record)
    }

    fn refresh_if_stale(&self) -> Result<(), RegistryError> {
        {
            let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
            if snapshot.loaded_at.elapsed() < self.refresh_interval {
                return Ok(());
            }
        }
        let records = load_records(&self.layout)?;
        self.replace_snapshot(records);
        Ok(())
    }

    fn store(&self, records: BTreeMap<Route, RepositoryRecord>) -> Result<(), RegistryError> {
        let path = self.layout.registry_path();
        let file = RegistryFile {
            routes: records.values().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|source| RegistryError::Corrupt {
            path: path.clone(),
            source,
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| RegistryError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        storage::write_atomically(&path, &json)
            .map_err(|source| RegistryError::Io { path, source })?;

        self.replace_snapshot(records);
        Ok(())
    }

    fn replace_snapshot(&self, records: BTreeMap<Route, RepositoryRecord>) {
        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        *snapshot = Snapshot {
            records,
            loaded_at: Instant::now(),
        };
    }
}

fn load_records(layout: &StorageLayout) -> Result<BTreeMap<Route, RepositoryRecord>, RegistryError> {
    let path = layout.registry_path();
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(source) => return Err(RegistryError::Io { path, source }),
    };
    let file: RegistryFile =
        serde_json::from_slice(&bytes).map_err(|source| RegistryError::Corrupt { path, source })?;
    Ok(file
        .routes
        .into_iter()
        .map(|record| (record.route.clone(), record))
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
