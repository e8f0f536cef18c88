//! Full round trip against a real `git` binary: init a route from a local
//! repository, publish an incremental bundle, and fetch both manifests over
//! HTTP.  Skipped when `git` is not installed.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use git_bundle_server::bundles::{BundleMode, FsManifestStore, ManifestStore};
use git_bundle_server::config::ServerConfig;
use git_bundle_server::engine::{BundleEngine, EnginePolicy};
use git_bundle_server::git::GitCli;
use git_bundle_server::http::BundleWebServer;
use git_bundle_server::registry::RouteRegistry;
use git_bundle_server::storage::{Route, StorageLayout};

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
        .args(args)
        .status()
        .unwrap();
    assert!(status.success(), "git {args:?} failed");
}

fn commit(dir: &Path, name: &str) {
    std::fs::write(dir.join(name), name).unwrap();
    git(dir, &["add", name]);
    git(dir, &["commit", "-q", "-m", name]);
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn init_update_and_serve() {
    if !git_available() {
        eprintln!("git not found; skipping");
        return;
    }

    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("source");
    std::fs::create_dir(&source).unwrap();
    git(&source, &["init", "-q"]);
    commit(&source, "first");

    let registry = Arc::new(
        RouteRegistry::open(StorageLayout::new(tmp.path().join("data")), Duration::ZERO).unwrap(),
    );
    let engine = BundleEngine::new(
        Arc::clone(&registry),
        Arc::new(FsManifestStore),
        Arc::new(GitCli::default()),
        EnginePolicy::default(),
    );
    let route = Route::parse("org/repo").unwrap();

    // -- init publishes a base bundle ------------------------------------
    let outcome = engine
        .init(source.to_str().unwrap(), &route)
        .await
        .unwrap();
    assert!(outcome.created);
    let record = registry.get(&route).unwrap().unwrap();
    let list = FsManifestStore.load(&record.web_dir).unwrap().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list.mode, BundleMode::Single);
    let base = list.bundles[0].clone();
    assert!(base.is_base());

    // -- nothing new upstream ---------------------------------------------
    let outcome = engine.update(&route).await.unwrap();
    assert!(!outcome.created);

    // -- a new commit yields an incremental bundle ------------------------
    commit(&source, "second");
    let outcome = engine.update(&route).await.unwrap();
    assert!(outcome.created);
    let list = FsManifestStore.load(&record.web_dir).unwrap().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list.mode, BundleMode::Incremental);
    let incremental = &list.bundles[1];
    assert!(incremental.creation_token > base.creation_token);
    assert!(!incremental.prerequisites.is_empty());

    for bundle in &list.bundles {
        let path = record.web_dir.join(&bundle.filename);
        assert!(path.is_file(), "{} missing", bundle.filename);
        git(&record.repo_dir, &["bundle", "verify", path.to_str().unwrap()]);
    }

    // -- both manifests over HTTP -----------------------------------------
    let config = ServerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        shutdown_grace_period: 1,
        ..ServerConfig::default()
    };
    let shutdown = CancellationToken::new();
    let running = BundleWebServer::new(&config, Arc::clone(&registry))
        .unwrap()
        .start(shutdown.clone())
        .await
        .unwrap();
    let addr = running.local_addr();

    let directory_relative = http_get(addr, "/org/repo/").await;
    assert!(directory_relative.starts_with("HTTP/1.1 200"));
    assert!(directory_relative.contains("mode = all"));
    assert!(directory_relative.contains(&format!("uri = {}", base.filename)));
    assert!(directory_relative.contains(&format!("uri = {}", incremental.filename)));

    let file_relative = http_get(addr, "/org/repo").await;
    assert!(file_relative.contains(&format!("uri = repo/{}", incremental.filename)));

    let bundle = http_get(addr, &format!("/org/repo/{}", base.filename)).await;
    assert!(bundle.starts_with("HTTP/1.1 200"));

    // -- stop removes the route -------------------------------------------
    engine.remove(&route).await.unwrap();
    let gone = http_get(addr, "/org/repo/").await;
    assert!(gone.starts_with("HTTP/1.1 404"));
    assert!(!record.web_dir.exists());

    shutdown.cancel();
    running.wait().await.unwrap();
}
