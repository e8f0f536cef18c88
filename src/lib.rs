//! Hosts incrementally-updated Git bundles and bundle-lists over HTTP(S).
//!
//! Each hosted repository lives under a route (`owner/repo`).  The
//! [`engine`] keeps a bare clone per route up to date and publishes a chain
//! of bundle files plus a bundle-list manifest; the [`http`] layer serves
//! them as static files so `git clone --bundle-uri` can bootstrap from them.

pub mod bundles;
pub mod config;
pub mod engine;
pub mod git;
pub mod http;
pub mod registry;
pub mod scheduler;
pub mod storage;
