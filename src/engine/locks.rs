//! Per-route update locks.
//!
//! Two layers guard each route:
//!
//! 1. An in-process keyed mutex (one `tokio::sync::Mutex` per route, created on
//!    demand) so tasks inside one server never update the same route at once.
//! 2. An advisory exclusive lock on the route's file under `{root}/locks/` so a CLI
//!    `update` and a running server's scheduler exclude each other as well.
//!
//! Different routes never share a lock.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fs4::FileExt;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace};

use crate::storage::{Route, StorageLayout};

/// Poll interval while waiting for another process to release a file lock.
const FILE_LOCK_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
#[error("failed to lock {}", path.display())]
pub struct LockError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Held for the duration of an update or removal; releases both layers on drop.
#[derive(Debug)]
pub struct RouteLockGuard {
    route: Route,
    _file: File,
    _local: OwnedMutexGuard<()>,
}

impl Drop for RouteLockGuard {
    fn drop(&mut self) {
        trace!(route = %self.route, "route lock released");
    }
}

pub struct RouteLocks {
    layout: StorageLayout,
    local: DashMap<Route, Arc<Mutex<()>>>,
}

impl RouteLocks {
    pub fn new(layout: StorageLayout) -> Self {
        Self {
            layout,
            local: DashMap::new(),
        }
    }

    fn local_mutex(&self, route: &Route) -> Arc<Mutex<()>> {
        self.local
            .entry(route.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Take the lock for `route` if nobody holds it; `Ok(None)` if it is held
    /// by this or another process.
    pub fn try_acquire(&self, route: &Route) -> Result<Option<RouteLockGuard>, LockError> {
        let Ok(local) = self.local_mutex(route).try_lock_owned() else {
            debug!(%route, "route lock held in-process");
            return Ok(None);
        };

        let file = self.open_lock_file(route)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(RouteLockGuard {
                route: route.clone(),
                _file: file,
                _local: local,
            })),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                debug!(%route, "route lock held by another process");
                Ok(None)
            }
            Err(source) => Err(LockError {
                path: self.layout.lock_path(route),
                source,
            }),
        }
    }

    /// Wait until the lock for `route` is free and take it.
    pub async fn acquire(&self, route: &Route) -> Result<RouteLockGuard, LockError> {
        let local = self.local_mutex(route).lock_owned().await;
        let file = self.open_lock_file(route)?;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(RouteLockGuard {
                        route: route.clone(),
                        _file: file,
                        _local: local,
                    })
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    tokio::time::sleep(FILE_LOCK_POLL).await;
                }
                Err(source) => {
                    return Err(LockError {
                        path: self.layout.lock_path(route),
                        source,
                    })
                }
            }
        }
    }

    /// Drop the in-process mutex for `route` unless a guard or a waiter still
    /// refers to it.  Called once a route is removed.
    pub fn forget(&self, route: &Route) {
        if self
            .local
            .remove_if(route, |_, mutex| Arc::strong_count(mutex) == 1)
            .is_some()
        {
            trace!(%route, "route lock dropped");
        }
    }

    #[cfg(test)]
    pub(super) fn tracked_routes(&self) -> usize {
        self.local.len()
    }

    fn open_lock_file(&self, route: &Route) -> Result<File, LockError> {
        let path = self.layout.lock_path(route);
        let open = || -> io::Result<File> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)
        };
        open().map_err(|source| LockError {
            path: path.clone(),
            source,
        })
    }
}
