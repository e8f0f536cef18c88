use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::locks::LockError;
use crate::bundles::ManifestError;
use crate::git::BackendError;
use crate::registry::RegistryError;
use crate::storage::Route;

/// Why an update (or an engine-level init/remove) did not complete.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("route {0} is not registered")]
    UnknownRoute(Route),

    #[error("working directory for route {0} is missing; run init again")]
    RouteDeleted(Route),

    #[error("an update for route {0} is already in progress")]
    AlreadyInProgress(Route),

    #[error("route {0} has nothing to bundle yet")]
    EmptyRepository(Route),

    #[error("backend failed for route {route}")]
    Backend {
        route: Route,
        #[source]
        source: BackendError,
    },

    #[error("git {operation} for route {route} exceeded {timeout:?}")]
    Timeout {
        route: Route,
        operation: &'static str,
        timeout: Duration,
    },

    #[error("failed to stage bundle file {}", path.display())]
    Staging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to load bundle list for route {route}")]
    Manifest {
        route: Route,
        #[source]
        source: ManifestError,
    },

    #[error("failed to publish bundle list for route {route}")]
    Publish {
        route: Route,
        #[source]
        source: ManifestError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("blocking task panicked")]
    Join(#[from] tokio::task::JoinError),
}

impl UpdateError {
    /// Expected outcomes a scheduler should simply retry next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::AlreadyInProgress(_) | Self::EmptyRepository(_))
    }
}
