//! In-memory bundle-list model.
//!
//! A [`BundleList`] is the authoritative record of which bundle files are
//! currently valid for a route.  It is persisted as JSON next to the rendered
//! bundle-list manifests and rewritten (never patched) on every publish.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current on-disk format version of the JSON model.
pub const BUNDLE_LIST_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How a client is expected to combine the bundles in a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleMode {
    /// One self-contained bundle covering the whole repository.
    Single,
    /// A base bundle plus a chronological chain of incremental bundles.
    Incremental,
}

/// One published bundle file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleDescriptor {
    /// File name inside the route's web directory.
    pub filename: String,
    /// Strictly increasing token used by clients to order bundles.
    pub creation_token: u64,
    pub created_at: DateTime<Utc>,
    /// Object ids the bundle was built on top of.  Empty for a base bundle;
    /// every entry is a tip recorded by an earlier descriptor in the list.
    #[serde(default)]
    pub prerequisites: Vec<String>,
    /// Full `refname -> oid` state of the repository when the bundle was built.
    #[serde(default)]
    pub tips: BTreeMap<String, String>,
}

impl BundleDescriptor {
    pub fn is_base(&self) -> bool {
        self.prerequisites.is_empty()
    }
}

/// Ordered collection of [`BundleDescriptor`]s plus the strategy mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleList {
    pub version: u32,
    pub mode: BundleMode,
    pub bundles: Vec<BundleDescriptor>,
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

impl BundleList {
    /// A fresh list containing only `base`.
    pub fn singleton(base: BundleDescriptor) -> Self {
        Self {
            version: BUNDLE_LIST_VERSION,
            mode: BundleMode::Single,
            bundles: vec![base],
        }
    }

    /// A new list with `next` appended to the chain.
    pub fn extended(&self, next: BundleDescriptor) -> Self {
        let mut bundles = self.bundles.clone();
        bundles.push(next);
        Self {
            version: BUNDLE_LIST_VERSION,
            mode: if bundles.len() > 1 {
                BundleMode::Incremental
            } else {
                BundleMode::Single
            },
            bundles,
        }
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

impl BundleList {
    pub fn latest(&self) -> Option<&BundleDescriptor> {
        self.bundles.last()
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// Number of incremental bundles chained after the base.
    pub fn incremental_count(&self) -> usize {
        self.bundles.iter().filter(|b| !b.is_base()).count()
    }

    /// Every object id recorded as a tip by any descriptor in the list.
    pub fn covered_oids(&self) -> BTreeSet<String> {
        self.bundles
            .iter()
            .flat_map(|b| b.tips.values().cloned())
            .collect()
    }

    /// Check the chain invariant: the first descriptor is a base bundle and
    /// every later descriptor only depends on tips of its predecessors.
    pub fn is_contiguous(&self) -> bool {
        let Some((first, rest)) = self.bundles.split_first() else {
            return true;
        };
        if !first.is_base() {
            return false;
        }

        let mut covered: BTreeSet<&str> = first.tips.values().map(String::as_str).collect();
        for descriptor in rest {
            if !descriptor
                .prerequisites
                .iter()
                .all(|oid| covered.contains(oid.as_str()))
            {
                return false;
            }
            covered.extend(descriptor.tips.values().map(String::as_str));
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
