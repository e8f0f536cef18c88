//! Bundle update engine.
//!
//! Drives a route through `no bundle -> base bundle -> base + N incrementals`.
//! One [`BundleEngine::update`] call:
//!
//! 1. resolves the route in the registry,
//! 2. takes the route's update lock without waiting,
//! 3. loads the published bundle list (if any),
//! 4. fetches from origin and lists refs,
//! 5. decides between a base bundle, an incremental bundle or nothing,
//! 6. writes the bundle to a staging file in the working directory, moves it
//!    into the web directory, and only then publishes the new list.
//!
//! A failure before step 6 leaves the published state untouched.  The engine
//! never retries; callers classify failures with
//! [`UpdateError::is_transient`].

pub mod error;
pub mod locks;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

pub use error::UpdateError;
pub use locks::{LockError, RouteLockGuard, RouteLocks};

use crate::bundles::{
    bundle_filename, next_creation_token, BundleDescriptor, BundleList, ManifestStore,
};
use crate::git::{BackendError, BundleSpec, VcsBackend};
use crate::registry::{RepositoryRecord, RouteRegistry};
use crate::storage::{self, Route};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Tunables for the engine.
#[derive(Debug, Clone)]
pub struct EnginePolicy {
    /// Upper bound on a single clone or fetch.
    pub fetch_timeout: Duration,
    /// Once the chain holds this many incremental bundles the next update
    /// starts over with a fresh base bundle.  `None` grows without bound.
    pub max_incremental_bundles: Option<usize>,
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(600),
            max_incremental_bundles: None,
        }
    }
}

/// Result of a successful [`BundleEngine::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Whether a new bundle was published.
    pub created: bool,
    /// The newly published descriptor, or the latest existing one when
    /// nothing was created.
    pub descriptor: Option<BundleDescriptor>,
}

/// Per-route tallies from [`BundleEngine::update_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub created: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// What the next bundle for a route should be.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BundlePlan {
    /// Nothing changed since the latest bundle.
    UpToDate,
    /// A self-contained bundle of every ref; starts a new list.
    Base { spec: BundleSpec },
    /// Changed refs only, on top of everything the list already covers.
    Incremental { spec: BundleSpec },
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct BundleEngine {
    registry: Arc<RouteRegistry>,
    manifests: Arc<dyn ManifestStore>,
    backend: Arc<dyn VcsBackend>,
    locks: RouteLocks,
    policy: EnginePolicy,
}

impl BundleEngine {
    pub fn new(
        registry: Arc<RouteRegistry>,
        manifests: Arc<dyn ManifestStore>,
        backend: Arc<dyn VcsBackend>,
        policy: EnginePolicy,
    ) -> Self {
        let locks = RouteLocks::new(registry.layout().clone());
        Self {
            registry,
            manifests,
            backend,
            locks,
            policy,
        }
    }

    pub fn registry(&self) -> &Arc<RouteRegistry> {
        &self.registry
    }

    /// Register `route`, clone `url` into it and publish the base bundle.
    #[instrument(skip(self), fields(%route))]
    pub async fn init(&self, url: &str, route: &Route) -> Result<UpdateOutcome, UpdateError> {
        let record = {
            let registry = Arc::clone(&self.registry);
            let route = route.clone();
            tokio::task::spawn_blocking(move || registry.register(&route)).await??
        };

        let _guard = self
            .locks
            .try_acquire(route)?
            .ok_or_else(|| UpdateError::AlreadyInProgress(route.clone()))?;

        info!(%url, "cloning repository");
        let cloned = self
            .bounded(route, "clone", self.backend.clone_repo(url, &record.repo_dir))
            .await;
        if let Err(e) = cloned {
            // Leave the working directory empty so a retried init is accepted.
            if let Err(cleanup) = storage::remove_dir_if_present(&record.repo_dir) {
                warn!(error = %cleanup, "failed to clean up after failed clone");
            }
            return Err(e);
        }

        self.update_locked(&record).await
    }

    /// Compute and publish the next bundle for `route`.
    #[instrument(skip(self), fields(%route))]
    pub async fn update(&self, route: &Route) -> Result<UpdateOutcome, UpdateError> {
        if self.registry.get(route)?.is_none() {
            return Err(UpdateError::UnknownRoute(route.clone()));
        }

        let _guard = self
            .locks
            .try_acquire(route)?
            .ok_or_else(|| UpdateError::AlreadyInProgress(route.clone()))?;

        // Resolve again under the lock: a removal may have finished since the
        // check above, here or in another process.
        let record = self
            .registry
            .get_current(route)?
            .ok_or_else(|| UpdateError::UnknownRoute(route.clone()))?;
        if !record.repo_dir.is_dir() {
            return Err(UpdateError::RouteDeleted(route.clone()));
        }

        self.update_locked(&record).await
    }

    /// Run [`update`](Self::update) for every registered route.  A failure on
    /// one route does not stop the others.
    #[instrument(skip(self))]
    pub async fn update_all(&self) -> Result<UpdateSummary, UpdateError> {
        let records = self.registry.list()?;
        let mut summary = UpdateSummary::default();

        for record in &records {
            match self.update(&record.route).await {
                Ok(outcome) if outcome.created => summary.created += 1,
                Ok(_) => summary.unchanged += 1,
                Err(e) if e.is_transient() => {
                    info!(route = %record.route, reason = %e, "route skipped this cycle");
                    summary.skipped += 1;
                }
                Err(e) => {
                    warn!(route = %record.route, error = %e, "route update failed");
                    summary.failed += 1;
                }
            }
        }

        debug!(?summary, "update cycle complete");
        Ok(summary)
    }

    /// Unregister `route` and delete its directories once no update holds the
    /// route's lock.
    #[instrument(skip(self), fields(%route))]
    pub async fn remove(&self, route: &Route) -> Result<RepositoryRecord, UpdateError> {
        if self.registry.get(route)?.is_none() {
            return Err(crate::registry::RegistryError::NotFound(route.clone()).into());
        }

        let record = {
            let _guard = self.locks.acquire(route).await?;
            let registry = Arc::clone(&self.registry);
            let owned = route.clone();
            tokio::task::spawn_blocking(move || registry.remove(&owned)).await??
        };
        self.locks.forget(route);
        Ok(record)
    }

    /// Put `route` back in the registry when its working copy still exists,
    /// e.g. after `routes.json` was lost.  Later updates continue from the
    /// bundle list already published for it.
    #[instrument(skip(self), fields(%route))]
    pub async fn start(&self, route: &Route) -> Result<RepositoryRecord, UpdateError> {
        let registry = Arc::clone(&self.registry);
        let owned = route.clone();
        let record = tokio::task::spawn_blocking(move || registry.reinstate(&owned)).await??;
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Update body (lock held)
    // -----------------------------------------------------------------------

    async fn update_locked(&self, record: &RepositoryRecord) -> Result<UpdateOutcome, UpdateError> {
        let route = &record.route;

        let previous = self
            .manifests
            .load(&record.web_dir)
            .map_err(|source| UpdateError::Manifest {
                route: route.clone(),
                source,
            })?
            .filter(|list| !list.is_empty());

        self.bounded(route, "fetch", self.backend.fetch(&record.repo_dir))
            .await?;
        let refs = self
            .backend
            .list_refs(&record.repo_dir)
            .await
            .map_err(|source| backend_error(route, source))?;

        let plan = plan_bundle(
            previous.as_ref(),
            &refs,
            self.policy.max_incremental_bundles,
        );
        let spec = match &plan {
            BundlePlan::UpToDate => {
                debug!("no ref changes since latest bundle");
                return Ok(unchanged(previous.as_ref()));
            }
            BundlePlan::Base { spec } if spec.refs.is_empty() => {
                return Err(UpdateError::EmptyRepository(route.clone()));
            }
            BundlePlan::Base { spec } | BundlePlan::Incremental { spec } => spec,
        };

        let now = Utc::now();
        let creation_token = next_creation_token(
            previous
                .as_ref()
                .and_then(BundleList::latest)
                .map(|d| d.creation_token),
            now,
        );
        let descriptor = BundleDescriptor {
            filename: bundle_filename(creation_token),
            creation_token,
            created_at: now,
            prerequisites: spec.exclude.clone(),
            tips: refs.clone(),
        };

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .suffix(".bundle")
            .tempfile_in(&record.repo_dir)
            .map_err(|source| UpdateError::Staging {
                path: record.repo_dir.clone(),
                source,
            })?
            .into_temp_path();

        info!(
            creation_token,
            refs = spec.refs.len(),
            excluded = spec.exclude.len(),
            base = matches!(plan, BundlePlan::Base { .. }),
            "creating bundle"
        );
        let written = self
            .backend
            .create_bundle(&record.repo_dir, &staging, spec)
            .await
            .map_err(|source| backend_error(route, source))?;

        if !written {
            return match plan {
                BundlePlan::Base { .. } => Err(UpdateError::EmptyRepository(route.clone())),
                _ => {
                    debug!("backend found nothing new to bundle");
                    Ok(unchanged(previous.as_ref()))
                }
            };
        }

        let list = match (&plan, &previous) {
            (BundlePlan::Incremental { .. }, Some(previous)) => previous.extended(descriptor.clone()),
            _ => BundleList::singleton(descriptor.clone()),
        };

        // Bundle file first, manifest last.
        let manifests = Arc::clone(&self.manifests);
        let owned_route = route.clone();
        let web_dir = record.web_dir.clone();
        let filename = descriptor.filename.clone();
        tokio::task::spawn_blocking(move || -> Result<(), UpdateError> {
            let dest = web_dir.join(&filename);
            staging.persist(&dest).map_err(|e| UpdateError::Staging {
                path: dest,
                source: e.error,
            })?;
            manifests
                .publish(&owned_route, &web_dir, &list)
                .map_err(|source| UpdateError::Publish {
                    route: owned_route.clone(),
                    source,
                })
        })
        .await??;

        info!(
            creation_token,
            filename = %descriptor.filename,
            "bundle published"
        );
        Ok(UpdateOutcome {
            created: true,
            descriptor: Some(descriptor),
        })
    }

    async fn bounded<T>(
        &self,
        route: &Route,
        operation: &'static str,
        fut: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, UpdateError> {
        match tokio::time::timeout(self.policy.fetch_timeout, fut).await {
            Ok(result) => result.map_err(|source| backend_error(route, source)),
            Err(_) => Err(UpdateError::Timeout {
                route: route.clone(),
                operation,
                timeout: self.policy.fetch_timeout,
            }),
        }
    }
}

fn backend_error(route: &Route, source: BackendError) -> UpdateError {
    UpdateError::Backend {
        route: route.clone(),
        source,
    }
}

fn unchanged(previous: Option<&BundleList>) -> UpdateOutcome {
    UpdateOutcome {
        created: false,
        descriptor: previous.and_then(BundleList::latest).cloned(),
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Decide the next bundle given the published list and the current refs.
///
/// An incremental bundle carries every ref whose oid differs from the latest
/// descriptor's tips and excludes every oid already covered by the list, so
/// its prerequisites are always satisfied by earlier bundles.
fn plan_bundle(
    previous: Option<&BundleList>,
    refs: &BTreeMap<String, String>,
    max_incremental_bundles: Option<usize>,
) -> BundlePlan {
    let base = || BundlePlan::Base {
        spec: BundleSpec {
            refs: refs.keys().cloned().collect(),
            exclude: Vec::new(),
        },
    };

    let Some((list, latest)) = previous.and_then(|l| l.latest().map(|d| (l, d))) else {
        return base();
    };

    let changed: Vec<String> = refs
        .iter()
        .filter(|(name, oid)| latest.tips.get(*name) != Some(*oid))
        .map(|(name, _)| name.clone())
        .collect();
    if changed.is_empty() {
        return BundlePlan::UpToDate;
    }

    if max_incremental_bundles.is_some_and(|max| list.incremental_count() >= max) {
        return base();
    }

    BundlePlan::Incremental {
        spec: BundleSpec {
            refs: changed,
            exclude: list.covered_oids().into_iter().collect(),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use tokio::sync::Notify;

    use crate::bundles::list::tests::descriptor;
    use crate::bundles::{BundleMode, FsManifestStore, BUNDLE_LIST_FILENAME, BUNDLE_LIST_JSON_FILENAME};
    use crate::storage::StorageLayout;

    // -- scripted backend ---------------------------------------------------

    #[derive(Default)]
    struct FakeBackend {
        refs: Mutex<BTreeMap<String, String>>,
        specs: Mutex<Vec<BundleSpec>>,
        fail_fetch: AtomicBool,
        fetch_delay: Mutex<Option<Duration>>,
        /// When set, `fetch` signals `entered` and waits for `release`.
        gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
    }

    impl FakeBackend {
        fn set_refs(&self, refs: &[(&str, &str)]) {
            *self.refs.lock().unwrap() = refs
                .iter()
                .map(|(r, o)| (r.to_string(), o.to_string()))
                .collect();
        }

        fn last_spec(&self) -> BundleSpec {
            self.specs.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl VcsBackend for FakeBackend {
        async fn clone_repo(&self, _url: &str, dest: &Path) -> Result<(), BackendError> {
            std::fs::create_dir_all(dest).unwrap();
            std::fs::write(dest.join("HEAD"), "ref: refs/heads/main\n").unwrap();
            Ok(())
        }

        async fn fetch(&self, _repo: &Path) -> Result<(), BackendError> {
            let gate = self.gate.lock().unwrap().clone();
            if let Some((entered, release)) = gate {
                entered.notify_one();
                release.notified().await;
            }
            let delay = *self.fetch_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_fetch.load(Ordering::SeqCst) {
                return Err(BackendError::Failed {
                    command: "fetch",
                    code: Some(128),
                    stderr: "fatal: unable to access origin".into(),
                });
            }
            Ok(())
        }

        async fn list_refs(&self, _repo: &Path) -> Result<BTreeMap<String, String>, BackendError> {
            Ok(self.refs.lock().unwrap().clone())
        }

        async fn create_bundle(
            &self,
            _repo: &Path,
            output: &Path,
            spec: &BundleSpec,
        ) -> Result<bool, BackendError> {
            self.specs.lock().unwrap().push(spec.clone());
            let refs = self.refs.lock().unwrap().clone();
            let excluded: BTreeSet<&String> = spec.exclude.iter().collect();
            let has_new = spec
                .refs
                .iter()
                .filter_map(|r| refs.get(r))
                .any(|oid| !excluded.contains(oid));
            if !has_new {
                return Ok(false);
            }
            std::fs::write(output, spec.rev_list_args().join("\n")).unwrap();
            Ok(true)
        }
    }

    // -- fixtures -------------------------------------------------------------

    struct Fixture {
        _tmp: tempfile::TempDir,
        backend: Arc<FakeBackend>,
        engine: Arc<BundleEngine>,
    }

    fn fixture(policy: EnginePolicy) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(
            RouteRegistry::open(StorageLayout::new(tmp.path()), Duration::ZERO).unwrap(),
        );
        let backend = Arc::new(FakeBackend::default());
        let engine = Arc::new(BundleEngine::new(
            registry,
            Arc::new(FsManifestStore),
            backend.clone(),
            policy,
        ));
        Fixture {
            _tmp: tmp,
            backend,
            engine,
        }
    }

    fn route() -> Route {
        Route::parse("org/repo").unwrap()
    }

    impl Fixture {
        async fn init(&self) -> UpdateOutcome {
            self.engine
                .init("https://example.invalid/org/repo.git", &route())
                .await
                .unwrap()
        }

        fn record(&self) -> RepositoryRecord {
            self.engine.registry().get(&route()).unwrap().unwrap()
        }

        fn published(&self) -> BundleList {
            FsManifestStore.load(&self.record().web_dir).unwrap().unwrap()
        }

        fn read_web(&self, name: &str) -> Vec<u8> {
            std::fs::read(self.record().web_dir.join(name)).unwrap()
        }
    }

    // -- planning -------------------------------------------------------------

    fn refs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(r, o)| (r.to_string(), o.to_string()))
            .collect()
    }

    #[test]
    fn plan_without_list_is_base() {
        let plan = plan_bundle(None, &refs(&[("refs/heads/main", "a1")]), None);
        assert_eq!(
            plan,
            BundlePlan::Base {
                spec: BundleSpec {
                    refs: vec!["refs/heads/main".into()],
                    exclude: vec![],
                }
            }
        );
    }

    #[test]
    fn plan_only_changed_refs() {
        let list = BundleList::singleton(descriptor(
            1,
            &[],
            &[("refs/heads/main", "a1"), ("refs/tags/v1", "t1")],
        ));
        let current = refs(&[
            ("refs/heads/main", "b2"),
            ("refs/heads/topic", "c3"),
            ("refs/tags/v1", "t1"),
        ]);
        let BundlePlan::Incremental { spec } = plan_bundle(Some(&list), &current, None) else {
            panic!("expected incremental plan");
        };
        assert_eq!(spec.refs, vec!["refs/heads/main", "refs/heads/topic"]);
        assert_eq!(spec.exclude, vec!["a1", "t1"]);
    }

    #[test]
    fn plan_up_to_date_ignores_deleted_refs() {
        let list = BundleList::singleton(descriptor(
            1,
            &[],
            &[("refs/heads/main", "a1"), ("refs/heads/old", "o1")],
        ));
        let plan = plan_bundle(Some(&list), &refs(&[("refs/heads/main", "a1")]), None);
        assert_eq!(plan, BundlePlan::UpToDate);
    }

    #[test]
    fn plan_collapses_at_threshold() {
        let list = BundleList::singleton(descriptor(1, &[], &[("refs/heads/main", "a1")]))
            .extended(descriptor(2, &["a1"], &[("refs/heads/main", "b2")]));
        let current = refs(&[("refs/heads/main", "c3")]);
        assert!(matches!(
            plan_bundle(Some(&list), &current, Some(1)),
            BundlePlan::Base { .. }
        ));
        assert!(matches!(
            plan_bundle(Some(&list), &current, Some(2)),
            BundlePlan::Incremental { .. }
        ));
    }

    // -- update flows -----------------------------------------------------------

    #[tokio::test]
    async fn bootstrap_publishes_single_bundle() {
        let f = fixture(EnginePolicy::default());
        f.backend.set_refs(&[("refs/heads/main", "a1")]);

        let outcome = f.init().await;
        assert!(outcome.created);

        let list = f.published();
        assert_eq!(list.mode, BundleMode::Single);
        assert_eq!(list.len(), 1);
        assert!(list.bundles[0].is_base());
        assert!(f.record().web_dir.join(&list.bundles[0].filename).is_file());
    }

    #[tokio::test]
    async fn no_changes_leaves_manifest_untouched() {
        let f = fixture(EnginePolicy::default());
        f.backend.set_refs(&[("refs/heads/main", "a1")]);
        f.init().await;

        let before_ini = f.read_web(BUNDLE_LIST_FILENAME);
        let before_json = f.read_web(BUNDLE_LIST_JSON_FILENAME);

        let outcome = f.engine.update(&route()).await.unwrap();
        assert!(!outcome.created);
        assert_eq!(outcome.descriptor, f.published().latest().cloned());
        assert_eq!(f.read_web(BUNDLE_LIST_FILENAME), before_ini);
        assert_eq!(f.read_web(BUNDLE_LIST_JSON_FILENAME), before_json);
    }

    #[tokio::test]
    async fn incremental_chain_stays_contiguous() {
        let f = fixture(EnginePolicy::default());
        f.backend.set_refs(&[("refs/heads/main", "a1")]);
        f.init().await;

        f.backend.set_refs(&[("refs/heads/main", "b2"), ("refs/tags/v1", "t1")]);
        assert!(f.engine.update(&route()).await.unwrap().created);
        assert_eq!(f.backend.last_spec().exclude, vec!["a1"]);

        f.backend.set_refs(&[("refs/heads/main", "c3"), ("refs/tags/v1", "t1")]);
        assert!(f.engine.update(&route()).await.unwrap().created);
        assert_eq!(f.backend.last_spec().refs, vec!["refs/heads/main"]);

        let list = f.published();
        assert_eq!(list.mode, BundleMode::Incremental);
        assert_eq!(list.len(), 3);
        assert!(list.is_contiguous());
        let tokens: Vec<u64> = list.bundles.iter().map(|b| b.creation_token).collect();
        assert!(tokens.windows(2).all(|w| w[0] < w[1]));
        for bundle in &list.bundles {
            assert!(f.record().web_dir.join(&bundle.filename).is_file());
        }
    }

    #[tokio::test]
    async fn new_ref_at_covered_commit_is_not_a_bundle() {
        let f = fixture(EnginePolicy::default());
        f.backend.set_refs(&[("refs/heads/main", "a1")]);
        f.init().await;

        f.backend.set_refs(&[("refs/heads/main", "a1"), ("refs/heads/alias", "a1")]);
        let outcome = f.engine.update(&route()).await.unwrap();
        assert!(!outcome.created);
        assert_eq!(f.published().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_update_is_refused() {
        let f = fixture(EnginePolicy::default());
        f.backend.set_refs(&[("refs/heads/main", "a1")]);
        f.init().await;
        f.backend.set_refs(&[("refs/heads/main", "b2")]);

        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *f.backend.gate.lock().unwrap() = Some((entered.clone(), release.clone()));

        let first = tokio::spawn({
            let engine = Arc::clone(&f.engine);
            async move { engine.update(&route()).await }
        });
        entered.notified().await;

        let second = f.engine.update(&route()).await;
        assert!(matches!(second, Err(UpdateError::AlreadyInProgress(_))));

        release.notify_one();
        assert!(first.await.unwrap().unwrap().created);
    }

    #[tokio::test]
    async fn empty_repository_is_not_published() {
        let f = fixture(EnginePolicy::default());
        let err = f
            .engine
            .init("https://example.invalid/empty.git", &route())
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::EmptyRepository(_)));
        assert!(err.is_transient());
        assert!(FsManifestStore.load(&f.record().web_dir).unwrap().is_none());
    }

    #[tokio::test]
    async fn backend_failure_keeps_previous_manifest() {
        let f = fixture(EnginePolicy::default());
        f.backend.set_refs(&[("refs/heads/main", "a1")]);
        f.init().await;
        let before = f.read_web(BUNDLE_LIST_JSON_FILENAME);

        f.backend.set_refs(&[("refs/heads/main", "b2")]);
        f.backend.fail_fetch.store(true, Ordering::SeqCst);
        let err = f.engine.update(&route()).await.unwrap_err();
        assert!(matches!(err, UpdateError::Backend { .. }));
        assert_eq!(f.read_web(BUNDLE_LIST_JSON_FILENAME), before);
    }

    #[tokio::test]
    async fn slow_fetch_times_out() {
        let f = fixture(EnginePolicy {
            fetch_timeout: Duration::from_millis(20),
            max_incremental_bundles: None,
        });
        f.backend.set_refs(&[("refs/heads/main", "a1")]);
        f.init().await;

        *f.backend.fetch_delay.lock().unwrap() = Some(Duration::from_secs(5));
        let err = f.engine.update(&route()).await.unwrap_err();
        assert!(matches!(err, UpdateError::Timeout { operation: "fetch", .. }));
    }

    #[tokio::test]
    async fn collapse_policy_starts_new_base() {
        let f = fixture(EnginePolicy {
            max_incremental_bundles: Some(1),
            ..EnginePolicy::default()
        });
        f.backend.set_refs(&[("refs/heads/main", "a1")]);
        f.init().await;
        f.backend.set_refs(&[("refs/heads/main", "b2")]);
        f.engine.update(&route()).await.unwrap();
        let chained = f.published();
        assert_eq!(chained.len(), 2);

        f.backend.set_refs(&[("refs/heads/main", "c3")]);
        f.engine.update(&route()).await.unwrap();

        let list = f.published();
        assert_eq!(list.mode, BundleMode::Single);
        assert_eq!(list.len(), 1);
        assert!(list.bundles[0].is_base());
        assert!(list.bundles[0].creation_token > chained.latest().unwrap().creation_token);
        // Superseded bundle files stay on disk.
        for old in &chained.bundles {
            assert!(f.record().web_dir.join(&old.filename).is_file());
        }
    }

    #[tokio::test]
    async fn staging_files_do_not_linger() {
        let f = fixture(EnginePolicy::default());
        f.backend.set_refs(&[("refs/heads/main", "a1")]);
        f.init().await;
        f.backend.set_refs(&[("refs/heads/main", "b2")]);
        f.engine.update(&route()).await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(&f.record().repo_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".staging-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn unknown_and_deleted_routes() {
        let f = fixture(EnginePolicy::default());
        assert!(matches!(
            f.engine.update(&route()).await,
            Err(UpdateError::UnknownRoute(_))
        ));

        f.backend.set_refs(&[("refs/heads/main", "a1")]);
        f.init().await;
        std::fs::remove_dir_all(f.record().repo_dir).unwrap();
        assert!(matches!(
            f.engine.update(&route()).await,
            Err(UpdateError::RouteDeleted(_))
        ));
    }

    #[tokio::test]
    async fn remove_route() {
        let f = fixture(EnginePolicy::default());
        assert!(matches!(
            f.engine.remove(&route()).await,
            Err(UpdateError::Registry(crate::registry::RegistryError::NotFound(_)))
        ));

        f.backend.set_refs(&[("refs/heads/main", "a1")]);
        f.init().await;
        let record = f.record();

        f.engine.remove(&route()).await.unwrap();
        assert!(f.engine.registry().get(&route()).unwrap().is_none());
        assert!(!record.repo_dir.exists());
        assert!(!record.web_dir.exists());
        assert_eq!(f.engine.locks.tracked_routes(), 0);
    }

    #[tokio::test]
    async fn update_all_reports_per_route() {
        let f = fixture(EnginePolicy::default());
        f.backend.set_refs(&[("refs/heads/main", "a1")]);
        f.init().await;
        f.engine
            .init("https://example.invalid/org/other.git", &Route::parse("org/other").unwrap())
            .await
            .unwrap();

        f.backend.set_refs(&[("refs/heads/main", "b2")]);
        let summary = f.engine.update_all().await.unwrap();
        assert_eq!(summary.created, 2);
        assert_eq!(summary.failed, 0);

        let summary = f.engine.update_all().await.unwrap();
        assert_eq!(summary.unchanged, 2);
    }

    // -- publish ordering -----------------------------------------------------

    /// Fails the test if a list is published that names a bundle file not yet
    /// present in the web directory.
    #[derive(Default)]
    struct InstalledFirstStore {
        publishes: AtomicUsize,
    }

    impl ManifestStore for InstalledFirstStore {
        fn load(&self, web_dir: &Path) -> Result<Option<BundleList>, crate::bundles::ManifestError> {
            FsManifestStore.load(web_dir)
        }

        fn publish(
            &self,
            route: &Route,
            web_dir: &Path,
            list: &BundleList,
        ) -> Result<(), crate::bundles::ManifestError> {
            for bundle in &list.bundles {
                assert!(
                    web_dir.join(&bundle.filename).is_file(),
                    "{} listed before it was installed",
                    bundle.filename
                );
            }
            self.publishes.fetch_add(1, Ordering::SeqCst);
            FsManifestStore.publish(route, web_dir, list)
        }
    }

    #[tokio::test]
    async fn lists_only_reference_installed_bundles() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(
            RouteRegistry::open(StorageLayout::new(tmp.path()), Duration::ZERO).unwrap(),
        );
        let backend = Arc::new(FakeBackend::default());
        let store = Arc::new(InstalledFirstStore::default());
        let engine = BundleEngine::new(
            registry,
            store.clone(),
            backend.clone(),
            EnginePolicy::default(),
        );

        backend.set_refs(&[("refs/heads/main", "a1")]);
        engine.init("https://example.invalid/org/repo.git", &route()).await.unwrap();
        for oid in ["b2", "c3", "d4"] {
            backend.set_refs(&[("refs/heads/main", oid)]);
            assert!(engine.update(&route()).await.unwrap().created);
        }
        assert_eq!(store.publishes.load(Ordering::SeqCst), 4);
    }

    // -- registry races -------------------------------------------------------

    #[tokio::test]
    async fn update_sees_removal_by_another_process() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(tmp.path());
        // A snapshot that never refreshes on its own.
        let registry = Arc::new(RouteRegistry::open(layout.clone(), Duration::from_secs(3600)).unwrap());
        let backend = Arc::new(FakeBackend::default());
        let engine = BundleEngine::new(
            registry,
            Arc::new(FsManifestStore),
            backend.clone(),
            EnginePolicy::default(),
        );
        backend.set_refs(&[("refs/heads/main", "a1")]);
        engine.init("https://example.invalid/org/repo.git", &route()).await.unwrap();

        let other = RouteRegistry::open(layout, Duration::ZERO).unwrap();
        other.remove(&route()).unwrap();

        backend.set_refs(&[("refs/heads/main", "b2")]);
        assert!(matches!(
            engine.update(&route()).await,
            Err(UpdateError::UnknownRoute(_))
        ));
    }

    #[tokio::test]
    async fn start_reinstates_lost_route() {
        let f = fixture(EnginePolicy::default());
        f.backend.set_refs(&[("refs/heads/main", "a1")]);
        f.init().await;
        let published = f.published();

        std::fs::remove_file(f.engine.registry().layout().registry_path()).unwrap();
        assert!(matches!(
            f.engine.update(&route()).await,
            Err(UpdateError::UnknownRoute(_))
        ));

        f.engine.start(&route()).await.unwrap();
        assert_eq!(f.published(), published);

        f.backend.set_refs(&[("refs/heads/main", "b2")]);
        assert!(f.engine.update(&route()).await.unwrap().created);
        assert_eq!(f.published().len(), 2);
    }

    #[tokio::test]
    async fn start_without_working_copy_is_refused() {
        let f = fixture(EnginePolicy::default());
        assert!(matches!(
            f.engine.start(&route()).await,
            Err(UpdateError::Registry(crate::registry::RegistryError::NoWorkingCopy(_)))
        ));
    }
}
