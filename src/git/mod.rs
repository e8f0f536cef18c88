//! Version-control backend used by the update engine.
//!
//! The engine only needs four capabilities from the VCS: clone a remote into a
//! working directory, refresh it, list its refs, and write a bundle file.  They
//! are expressed as the [`VcsBackend`] trait so the engine can be driven by a
//! scripted backend in tests; [`GitCli`] is the production implementation that
//! shells out to the `git` binary.

pub mod commands;

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use thiserror::Error;

pub use commands::GitCli;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Revisions to put into a bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleSpec {
    /// Ref names whose history is included.
    pub refs: Vec<String>,
    /// Object ids the receiver is assumed to have already; their history is
    /// left out and they become the bundle's prerequisites.
    pub exclude: Vec<String>,
}

impl BundleSpec {
    /// Arguments in `git rev-list` syntax, one per line when fed via `--stdin`.
    pub fn rev_list_args(&self) -> Vec<String> {
        self.refs
            .iter()
            .cloned()
            .chain(self.exclude.iter().map(|oid| format!("^{oid}")))
            .collect()
    }
}

/// Opaque failure of a backend operation.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to run git {command}")]
    Spawn {
        command: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("git {command} failed (exit code {}): {stderr}", display_code(*code))]
    Failed {
        command: &'static str,
        code: Option<i32>,
        stderr: String,
    },
}

fn display_code(code: Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait VcsBackend: Send + Sync {
    /// Bare-clone `url` into the (empty) directory `dest` and configure it so
    /// that later [`fetch`](Self::fetch) calls mirror the remote branches.
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), BackendError>;

    /// Bring the working clone at `repo` up to date with its origin.
    async fn fetch(&self, repo: &Path) -> Result<(), BackendError>;

    /// Current `refname -> oid` map for branches and tags.
    async fn list_refs(&self, repo: &Path) -> Result<BTreeMap<String, String>, BackendError>;

    /// Write a bundle for `spec` to `output`.
    ///
    /// Returns `false` without producing a usable file when there is nothing
    /// to bundle.
    async fn create_bundle(
        &self,
        repo: &Path,
        output: &Path,
        spec: &BundleSpec,
    ) -> Result<bool, BackendError>;
}
