//! Bundle-list manifest rendering in Git config INI format.
//!
//! The bundle-list tells `git clone --bundle-uri` (or `git fetch
//! --bundle-uri`) which bundles to download and in what order.  Two variants
//! are published per route because relative `uri` values resolve differently
//! depending on whether the client fetched `/{owner}/{repo}/` (a directory) or
//! `/{owner}/{repo}` (a file):
//!
//! ```ini
//! [bundle]
//!     version = 1
//!     mode = all
//!     heuristic = creationToken
//!
//! [bundle "bundle-1735689600"]
//!     uri = bundle-1735689600.bundle
//!     creationToken = 1735689600
//! ```
//!
//! In the file-relative variant the `uri` is prefixed with the repository
//! name (`repo/bundle-1735689600.bundle`).

use super::list::BundleList;

/// Manifest whose bundle URIs are relative to a directory URL.
pub const BUNDLE_LIST_FILENAME: &str = "bundle-list";
/// Manifest whose bundle URIs are relative to a file URL.
pub const REPO_BUNDLE_LIST_FILENAME: &str = "repo-bundle-list";
/// Authoritative JSON model the engine loads on each update.
pub const BUNDLE_LIST_JSON_FILENAME: &str = "bundle-list.json";

/// Names inside a web directory that are never served as bundle files.
pub fn is_reserved_filename(name: &str) -> bool {
    matches!(
        name,
        BUNDLE_LIST_FILENAME | REPO_BUNDLE_LIST_FILENAME | BUNDLE_LIST_JSON_FILENAME
    )
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How `uri` values in a rendered manifest are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UriStyle {
    /// `uri = bundle-N.bundle`
    DirectoryRelative,
    /// `uri = {repo_name}/bundle-N.bundle`
    FileRelative { repo_name: String },
}

impl UriStyle {
    fn uri_for(&self, filename: &str) -> String {
        match self {
            Self::DirectoryRelative => filename.to_string(),
            Self::FileRelative { repo_name } => format!("{repo_name}/{filename}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Render `list` as a Git bundle-list document.
///
/// Bundles are emitted in list order, which is ascending creation-token order
/// because the engine only ever appends.
pub fn render_bundle_list(list: &BundleList, style: &UriStyle) -> String {
    let mut output = String::from("[bundle]\n\tversion = 1\n\tmode = all\n\theuristic = creationToken\n");

    for bundle in &list.bundles {
        let id = bundle
            .filename
            .strip_suffix(".bundle")
            .unwrap_or(&bundle.filename);
        output.push_str(&format!(
            "\n[bundle \"{id}\"]\n\turi = {}\n\tcreationToken = {}\n",
            style.uri_for(&bundle.filename),
            bundle.creation_token,
        ));
    }

    output
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
