//! Route identifiers.
//!
//! A route is the `owner/repo[/sub]` path under which a repository's bundles
//! are hosted.  Routes are validated once, at construction, so every other
//! component can join them onto filesystem paths without re-checking.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum number of `/`-separated segments in a route.
pub const MIN_DEPTH: usize = 2;
/// Maximum number of `/`-separated segments in a route.
pub const MAX_DEPTH: usize = 3;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A route string that does not satisfy the depth or character rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("invalid route {route:?}: has {depth} segments, expected {MIN_DEPTH} or {MAX_DEPTH}")]
    InvalidDepth { route: String, depth: usize },

    #[error("invalid route {route:?}: segment {segment:?} is not allowed")]
    InvalidSegment { route: String, segment: String },
}

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

/// A normalized, validated route such as `git/git` or `org/repo/docs`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Route(String);

impl Route {
    /// Parse and normalize a route string.
    ///
    /// Leading, trailing and repeated slashes are dropped, so `/org//repo/`
    /// normalizes to `org/repo`.  Each remaining segment must be made of ASCII
    /// alphanumerics, `-`, `_` or `.`, and may not be `.` or `..`.
    pub fn parse(raw: &str) -> Result<Self, RouteError> {
        let segments: Vec<&str> = raw.split('/').filter(|s| !s.is_empty()).collect();

        if !(MIN_DEPTH..=MAX_DEPTH).contains(&segments.len()) {
            return Err(RouteError::InvalidDepth {
                route: raw.to_string(),
                depth: segments.len(),
            });
        }

        if let Some(bad) = segments.iter().find(|s| !is_valid_segment(s)) {
            return Err(RouteError::InvalidSegment {
                route: raw.to_string(),
                segment: (*bad).to_string(),
            });
        }

        Ok(Self(segments.join("/")))
    }

    /// Build a route from an owner and repository name.
    pub fn from_parts(owner: &str, repo: &str) -> Result<Self, RouteError> {
        Self::parse(&format!("{owner}/{repo}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the route's segments in order.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Number of segments (2 or 3).
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// The last segment, used as the repository name in file-relative
    /// bundle URIs.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

fn is_valid_segment(segment: &str) -> bool {
    segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Route {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Route {
    type Error = RouteError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Route> for String {
    fn from(route: Route) -> Self {
        route.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
