//! axum router and request handler for bundle and bundle-list downloads.
//!
//! Routes:
//! - `GET /{owner}/{repo}/`           - bundle-list, URIs relative to a directory
//! - `GET /{owner}/{repo}`            - bundle-list, URIs relative to a file
//! - `GET /{owner}/{repo}/{filename}` - a bundle file from the web directory
//!
//! Every failure is answered with an empty `404 Not Found`; the reason is only
//! logged, so responses never reveal which routes exist.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use thiserror::Error;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, instrument};

use crate::bundles::{is_reserved_filename, BUNDLE_LIST_FILENAME, REPO_BUNDLE_LIST_FILENAME};
use crate::registry::{RegistryError, RouteRegistry};
use crate::storage::{Route, RouteError};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// State shared by all request handlers.
#[derive(Clone)]
pub struct ServerState {
    pub registry: Arc<RouteRegistry>,
}

/// Build the axum [`Router`] serving every registered route.
pub fn create_router(registry: Arc<RouteRegistry>, request_timeout: Duration) -> Router {
    Router::new()
        .route("/{*path}", get(handle_request))
        .fallback(not_found)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(ServerState { registry })
}

// ---------------------------------------------------------------------------
// Request resolution
// ---------------------------------------------------------------------------

/// Why a request could not be mapped to a file.  Never sent to clients.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("empty route")]
    Empty,
    #[error("route has owner, but no repo")]
    OwnerOnly,
    #[error("path has depth exceeding three")]
    TooDeep,
    #[error(transparent)]
    InvalidRoute(#[from] RouteError),
    #[error("route {0} is not registered")]
    UnknownRoute(Route),
    #[error("filename {0:?} is not servable")]
    ForbiddenFilename(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// A request path split into its route and optional filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedRoute<'a> {
    pub owner: &'a str,
    pub repo: &'a str,
    pub filename: Option<&'a str>,
}

/// Split `path` on `/`, ignoring empty segments.
pub fn parse_route(path: &str) -> Result<ParsedRoute<'_>, ResolveError> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments[..] {
        [] => Err(ResolveError::Empty),
        [_] => Err(ResolveError::OwnerOnly),
        [owner, repo] => Ok(ParsedRoute {
            owner,
            repo,
            filename: None,
        }),
        [owner, repo, filename] => Ok(ParsedRoute {
            owner,
            repo,
            filename: Some(filename),
        }),
        _ => Err(ResolveError::TooDeep),
    }
}

/// File to stream for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    pub path: PathBuf,
    /// Bundle-lists are served as text regardless of their (absent) extension.
    pub is_manifest: bool,
}

/// Map a request path to a file inside the route's web directory.
pub fn resolve_request(registry: &RouteRegistry, path: &str) -> Result<ResolvedFile, ResolveError> {
    let parsed = parse_route(path)?;
    let route = Route::from_parts(parsed.owner, parsed.repo)?;
    let record = registry
        .get(&route)?
        .ok_or(ResolveError::UnknownRoute(route))?;

    match parsed.filename {
        None => {
            // With a trailing slash the client resolves relative URIs against
            // the route as a directory; without one, against its parent.
            let manifest = if path.ends_with('/') {
                BUNDLE_LIST_FILENAME
            } else {
                REPO_BUNDLE_LIST_FILENAME
            };
            Ok(ResolvedFile {
                path: record.web_dir.join(manifest),
                is_manifest: true,
            })
        }
        Some(name) if is_reserved_filename(name) || name.starts_with('.') => {
            Err(ResolveError::ForbiddenFilename(name.to_string()))
        }
        Some(name) => Ok(ResolvedFile {
            path: record.web_dir.join(name),
            is_manifest: false,
        }),
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(path = %req.uri().path()))]
async fn handle_request(State(state): State<ServerState>, req: Request) -> Response {
    let path = req.uri().path().to_owned();
    let registry = Arc::clone(&state.registry);
    let resolved =
        match tokio::task::spawn_blocking(move || resolve_request(&registry, &path)).await {
            Ok(Ok(resolved)) => resolved,
            Ok(Err(reason)) => {
                debug!(%reason, "request not served");
                return not_found().await;
            }
            Err(e) => {
                debug!(error = %e, "route resolution task failed");
                return not_found().await;
            }
        };

    serve_file(resolved, req).await
}

/// Stream `file` with conditional-request and range support.
async fn serve_file(file: ResolvedFile, req: Request) -> Response {
    let response = match ServeFile::new(&file.path).oneshot(req).await {
        Ok(response) => response,
        Err(never) => match never {},
    };

    let status = response.status();
    if status == StatusCode::NOT_FOUND || status.is_server_error() {
        debug!(path = %file.path.display(), %status, "file not served");
        return not_found().await;
    }

    let mut response = response.map(Body::new);
    if file.is_manifest {
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
    }
    debug!(path = %file.path.display(), %status, "serving file");
    response
}

async fn not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
