//! Monotonic creation tokens for bundle-URI.
//!
//! Each bundle in a bundle-list carries a `creationToken` that clients use to
//! determine which bundles they already have and which they still need.
//! Tokens must be **strictly increasing** within a route's list.  We derive
//! them from the UTC timestamp and bump past the previous token when the clock
//! has not moved (two updates within the same second, or clock skew).
//!
//! The token also names the bundle file, which keeps file names unique for the
//! lifetime of a route.

use chrono::{DateTime, Utc};

/// Allocate the token for a new bundle given the newest token already in the
/// list (if any).
pub fn next_creation_token(previous: Option<u64>, now: DateTime<Utc>) -> u64 {
    let from_clock = u64::try_from(now.timestamp()).unwrap_or(0);
    match previous {
        Some(prev) if prev >= from_clock => prev + 1,
        _ => from_clock,
    }
}

/// File name of the bundle carrying `token`.
pub fn bundle_filename(token: u64) -> String {
    format!("bundle-{token}.bundle")
}
