//! Build deduplication on top of the artifact store
//!
//! `get_or_build` returns a cached artifact when one is valid and otherwise
//! runs the build exactly once per fingerprint, however many callers ask
//! for it concurrently. The build runs in its own task, so it completes and
//! populates the cache even when every caller has gone away.

use crate::build::{BuildResult, FailureKind};
use crate::cache::fingerprint::{fingerprint, short};
use crate::cache::store::{CacheEntry, CacheStore, StoredEntry};
use crate::compiler::CompilerOutput;
use crate::diagnostic::Diagnostic;
use crate::error::{KilnError, KilnResult};
use crate::resolve::CompilationUnit;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

type InFlight = Arc<DashMap<String, Shared<BoxFuture<'static, BuildResult>>>>;

/// Input handed to a build function
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub unit: Arc<CompilationUnit>,
    /// Path the artifact must be written to
    pub artifact: PathBuf,
    pub fingerprint: String,
}

/// Shared state moved into build tasks
#[derive(Clone)]
struct BuildContext {
    store: Option<CacheStore>,
    /// Compiler identity; refreshed before each build
    backend: Arc<RwLock<String>>,
    artifact_extension: Option<String>,
    in_flight: InFlight,
}

/// Artifact cache with per-fingerprint build deduplication
pub struct CacheManager {
    ctx: BuildContext,
}

impl CacheManager {
    /// Create a manager rooted at `root`. `None` disables persistence; an
    /// unusable root degrades to temporary, uncached builds.
    pub fn new(root: Option<PathBuf>, backend: String, artifact_extension: Option<String>) -> Self {
        let store = root.and_then(|root| {
            let store = CacheStore::new(root);
            match store.ensure_usable() {
                Ok(()) => Some(store),
                Err(e) => {
                    warn!("{}; building without cache", e);
                    None
                }
            }
        });

        Self {
            ctx: BuildContext {
                store,
                backend: Arc::new(RwLock::new(backend)),
                artifact_extension,
                in_flight: Arc::new(DashMap::new()),
            },
        }
    }

    /// Whether builds are persisted
    pub fn is_degraded(&self) -> bool {
        self.ctx.store.is_none()
    }

    pub fn root(&self) -> Option<&Path> {
        self.ctx.store.as_ref().map(CacheStore::root)
    }

    pub fn backend(&self) -> String {
        self.ctx
            .backend
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record the current compiler identity. A changed compiler yields new
    /// fingerprints, so earlier artifacts are no longer looked up.
    pub fn set_backend(&self, identity: String) {
        let mut backend = self
            .ctx
            .backend
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if *backend != identity {
            debug!("Compiler identity now {}", identity);
            *backend = identity;
        }
    }

    pub fn fingerprint(&self, unit: &CompilationUnit) -> String {
        fingerprint(unit, &self.backend())
    }

    /// Valid cache entry for a unit, if any
    pub fn lookup(&self, unit: &CompilationUnit) -> Option<StoredEntry> {
        self.ctx.store.as_ref()?.lookup(&self.fingerprint(unit))
    }

    pub fn list_entries(&self) -> KilnResult<Vec<StoredEntry>> {
        match &self.ctx.store {
            Some(store) => store.list_entries(),
            None => Ok(Vec::new()),
        }
    }

    pub fn clear(&self) -> KilnResult<usize> {
        match &self.ctx.store {
            Some(store) => store.clear(),
            None => Ok(0),
        }
    }

    /// Return a cached artifact for `unit` or build it.
    ///
    /// `force` skips the cache lookup but still joins a build already in
    /// flight for the same fingerprint. Failed builds are never cached.
    pub async fn get_or_build<F, Fut>(&self, unit: &CompilationUnit, force: bool, build: F) -> BuildResult
    where
        F: FnOnce(BuildJob) -> Fut + Send + 'static,
        Fut: Future<Output = KilnResult<CompilerOutput>> + Send + 'static,
    {
        let backend = self.backend();
        let fp = fingerprint(unit, &backend);

        if !force {
            if let Some(result) = self.ctx.cached_result(unit, &fp) {
                return finish(result, unit.output.as_deref()).await;
            }
        }

        let pending = match self.ctx.in_flight.entry(fp.clone()) {
            Entry::Occupied(existing) => {
                debug!("Joining in-flight build {}", short(&fp));
                existing.get().clone()
            }
            Entry::Vacant(slot) => {
                let ctx = self.ctx.clone();
                let unit = Arc::new(unit.clone());
                let key = fp.clone();
                let handle = tokio::spawn(async move {
                    // Released on return and on panic alike
                    let _slot = InFlightSlot {
                        in_flight: Arc::clone(&ctx.in_flight),
                        key: key.clone(),
                    };
                    ctx.run_build(unit, key, backend, force, build).await
                });
                let pending = async move {
                    handle
                        .await
                        .unwrap_or_else(|e| BuildResult::internal(format!("build task failed: {}", e)))
                }
                .boxed()
                .shared();
                slot.insert(pending.clone());
                pending
            }
        };

        finish(pending.await, unit.output.as_deref()).await
    }
}

/// Removes a fingerprint from the in-flight map when the build task ends
struct InFlightSlot {
    in_flight: InFlight,
    key: String,
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

/// A build directory that is removed unless the build produced an artifact
struct BuildDir<'a> {
    ctx: &'a BuildContext,
    path: PathBuf,
    persistent: bool,
    keep: bool,
}

impl Drop for BuildDir<'_> {
    fn drop(&mut self) {
        if !self.keep {
            self.ctx.discard(&self.path, self.persistent);
        }
    }
}

impl BuildContext {
    fn artifact_name(&self, unit: &CompilationUnit) -> String {
        match &self.artifact_extension {
            Some(ext) => format!("{}.{}", unit.script_name(), ext.trim_start_matches('.')),
            None => unit.script_name(),
        }
    }

    fn cached_result(&self, unit: &CompilationUnit, fp: &str) -> Option<BuildResult> {
        let hit = self.store.as_ref()?.lookup(fp)?;
        debug!("Cache hit {} for {}", short(fp), unit.primary.display());

        let mut diagnostics = unit.diagnostics.clone();
        diagnostics.extend(hit.entry.diagnostics.iter().cloned());
        Some(BuildResult::succeeded(
            hit.artifact_path(),
            fp.to_string(),
            true,
            diagnostics,
        ))
    }

    /// Directory a build writes into, and whether it will be committed
    fn build_dir(&self, fp: &str) -> KilnResult<(PathBuf, bool)> {
        if let Some(store) = &self.store {
            match store.stage(fp) {
                Ok(staging) => return Ok((staging, true)),
                Err(e) => warn!("{}; building without cache", e),
            }
        }

        let dir = std::env::temp_dir().join(format!("kiln-{}-{}", short(fp), uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)
            .map_err(|e| KilnError::io(format!("creating {}", dir.display()), e))?;
        Ok((dir, false))
    }

    fn discard(&self, dir: &Path, persistent: bool) {
        match (&self.store, persistent) {
            (Some(store), true) => store.discard(dir),
            _ => {
                if let Err(e) = std::fs::remove_dir_all(dir) {
                    warn!("Failed to remove build dir {}: {}", dir.display(), e);
                }
            }
        }
    }

    async fn run_build<F, Fut>(
        &self,
        unit: Arc<CompilationUnit>,
        fp: String,
        backend: String,
        force: bool,
        build: F,
    ) -> BuildResult
    where
        F: FnOnce(BuildJob) -> Fut,
        Fut: Future<Output = KilnResult<CompilerOutput>>,
    {
        // Another process may have finished the same build meanwhile
        if !force {
            if let Some(result) = self.cached_result(&unit, &fp) {
                return result;
            }
        }

        let (path, persistent) = match self.build_dir(&fp) {
            Ok(prepared) => prepared,
            Err(e) => return BuildResult::from_error(&e),
        };
        let mut dir = BuildDir {
            ctx: self,
            path,
            persistent,
            keep: false,
        };
        let name = self.artifact_name(&unit);
        let artifact = dir.path.join(&name);

        info!("Compiling {} ({})", unit.primary.display(), short(&fp));
        let job = BuildJob {
            unit: Arc::clone(&unit),
            artifact: artifact.clone(),
            fingerprint: fp.clone(),
        };
        let output = match build(job).await {
            Ok(output) => output,
            Err(e) => return BuildResult::from_error(&e),
        };

        let mut diagnostics = unit.diagnostics.clone();
        diagnostics.extend(output.diagnostics.iter().cloned());

        if !output.success {
            return BuildResult::failed(FailureKind::Compile, diagnostics);
        }
        dir.keep = true;

        let store = match (&self.store, persistent) {
            (Some(store), true) => store,
            _ => return BuildResult::succeeded(artifact, fp, false, diagnostics),
        };

        let entry = CacheEntry::for_unit(&unit, &fp, &backend, &name, output.diagnostics);
        match store.commit(&dir.path, &entry) {
            Ok(stored) => BuildResult::succeeded(stored.artifact_path(), fp, false, diagnostics),
            Err(e) => {
                warn!("Failed to cache build {}: {}", short(&fp), e);
                BuildResult::succeeded(artifact, fp, false, diagnostics)
            }
        }
    }
}

/// Copy the artifact to an explicit output path when one was requested
async fn finish(mut result: BuildResult, output: Option<&Path>) -> BuildResult {
    let (Some(target), Some(artifact), true) = (output, result.artifact.clone(), result.success) else {
        return result;
    };

    let copied = async {
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&artifact, target).await
    }
    .await;

    if let Err(e) = copied {
        result.success = false;
        result.failure = Some(FailureKind::Internal);
        result.diagnostics.push(Diagnostic::error(format!(
            "failed to copy artifact to {}: {}",
            target.display(),
            e
        )));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::{content_hash, SourceFile};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn unit(temp: &TempDir, text: &str) -> CompilationUnit {
        let path = temp.path().join("hello.c");
        std::fs::write(&path, text).unwrap();
        CompilationUnit {
            primary: path.clone(),
            sources: vec![SourceFile {
                compile_path: path.clone(),
                path,
                text: text.to_string(),
                modified: Utc::now(),
                hash: content_hash(text.as_bytes()),
            }],
            references: vec![],
            probing_dirs: vec![],
            compiler_args: vec![],
            debug: false,
            output: None,
            macros: vec![],
            diagnostics: vec![],
        }
    }

    fn manager(temp: &TempDir) -> CacheManager {
        CacheManager::new(Some(temp.path().join("cache")), "test-cc".to_string(), None)
    }

    /// Build function that writes the artifact and counts invocations
    fn writer(
        calls: Arc<AtomicUsize>,
        delay: Duration,
    ) -> impl FnOnce(BuildJob) -> BoxFuture<'static, KilnResult<CompilerOutput>> + Send + 'static {
        move |job: BuildJob| {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                std::fs::write(&job.artifact, b"artifact").unwrap();
                Ok(CompilerOutput {
                    success: true,
                    exit_code: Some(0),
                    diagnostics: vec![],
                })
            }
            .boxed()
        }
    }

    fn failing(calls: Arc<AtomicUsize>) -> impl FnOnce(BuildJob) -> BoxFuture<'static, KilnResult<CompilerOutput>> + Send + 'static {
        move |_job: BuildJob| {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(CompilerOutput {
                    success: false,
                    exit_code: Some(1),
                    diagnostics: vec![Diagnostic::error("boom")],
                })
            }
            .boxed()
        }
    }

    fn panicking() -> impl FnOnce(BuildJob) -> BoxFuture<'static, KilnResult<CompilerOutput>> + Send + 'static {
        |_job: BuildJob| async move { panic!("compiler backend bug") }.boxed()
    }

    #[tokio::test]
    async fn second_call_hits_cache() {
        let temp = TempDir::new().unwrap();
        let cache = manager(&temp);
        let unit = unit(&temp, "int main(){}");
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache
            .get_or_build(&unit, false, writer(calls.clone(), Duration::ZERO))
            .await;
        let second = cache
            .get_or_build(&unit, false, writer(calls.clone(), Duration::ZERO))
            .await;

        assert!(first.success && !first.cached);
        assert!(second.success && second.cached);
        assert_eq!(first.artifact, second.artifact);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.list_entries().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn content_change_rebuilds() {
        let temp = TempDir::new().unwrap();
        let cache = manager(&temp);
        let calls = Arc::new(AtomicUsize::new(0));

        let v1 = cache
            .get_or_build(&unit(&temp, "v1"), false, writer(calls.clone(), Duration::ZERO))
            .await;
        let v2 = cache
            .get_or_build(&unit(&temp, "v2"), false, writer(calls.clone(), Duration::ZERO))
            .await;

        assert_ne!(v1.fingerprint, v2.fingerprint);
        assert!(!v2.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_build() {
        let temp = TempDir::new().unwrap();
        let cache = Arc::new(manager(&temp));
        let unit = Arc::new(unit(&temp, "int main(){}"));
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let unit = Arc::clone(&unit);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_build(&unit, false, writer(calls, Duration::from_millis(200)))
                        .await
                })
            })
            .collect();

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.success));
        assert!(results.iter().all(|r| r.artifact == results[0].artifact));
    }

    #[tokio::test]
    async fn failed_build_not_cached_and_retried() {
        let temp = TempDir::new().unwrap();
        let cache = manager(&temp);
        let unit = unit(&temp, "int main(){}");
        let calls = Arc::new(AtomicUsize::new(0));

        let failed = cache.get_or_build(&unit, false, failing(calls.clone())).await;
        assert!(!failed.success);
        assert_eq!(failed.failure, Some(FailureKind::Compile));
        assert!(cache.list_entries().unwrap().is_empty());
        // Staging directory removed
        assert_eq!(std::fs::read_dir(temp.path().join("cache")).unwrap().count(), 0);

        let fixed = cache
            .get_or_build(&unit, false, writer(calls.clone(), Duration::ZERO))
            .await;
        assert!(fixed.success && !fixed.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_build_does_not_poison_fingerprint() {
        let temp = TempDir::new().unwrap();
        let cache = manager(&temp);
        let unit = unit(&temp, "int main(){}");
        let calls = Arc::new(AtomicUsize::new(0));

        let crashed = cache
            .get_or_build(&unit, false, panicking())
            .await;
        assert!(!crashed.success);
        assert_eq!(crashed.failure, Some(FailureKind::Internal));
        assert_eq!(std::fs::read_dir(temp.path().join("cache")).unwrap().count(), 0);

        let retried = cache
            .get_or_build(&unit, false, writer(calls.clone(), Duration::ZERO))
            .await;
        assert!(retried.success && !retried.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn compiler_change_rebuilds() {
        let temp = TempDir::new().unwrap();
        let cache = manager(&temp);
        let unit = unit(&temp, "int main(){}");
        let calls = Arc::new(AtomicUsize::new(0));

        let before = cache
            .get_or_build(&unit, false, writer(calls.clone(), Duration::ZERO))
            .await;
        cache.set_backend("test-cc@2".to_string());
        let after = cache
            .get_or_build(&unit, false, writer(calls.clone(), Duration::ZERO))
            .await;

        assert_ne!(before.fingerprint, after.fingerprint);
        assert!(!after.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache
            .list_entries()
            .unwrap()
            .iter()
            .any(|e| e.entry.backend == "test-cc@2"));
    }

    #[tokio::test]
    async fn missing_artifact_forces_rebuild() {
        let temp = TempDir::new().unwrap();
        let cache = manager(&temp);
        let unit = unit(&temp, "int main(){}");
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache
            .get_or_build(&unit, false, writer(calls.clone(), Duration::ZERO))
            .await;
        std::fs::remove_file(first.artifact.unwrap()).unwrap();

        let second = cache
            .get_or_build(&unit, false, writer(calls.clone(), Duration::ZERO))
            .await;
        assert!(second.success && !second.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn force_skips_lookup() {
        let temp = TempDir::new().unwrap();
        let cache = manager(&temp);
        let unit = unit(&temp, "int main(){}");
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .get_or_build(&unit, false, writer(calls.clone(), Duration::ZERO))
            .await;
        let forced = cache
            .get_or_build(&unit, true, writer(calls.clone(), Duration::ZERO))
            .await;

        assert!(forced.success && !forced.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.list_entries().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn abandoned_build_still_cached() {
        let temp = TempDir::new().unwrap();
        let cache = Arc::new(manager(&temp));
        let unit = Arc::new(unit(&temp, "int main(){}"));
        let calls = Arc::new(AtomicUsize::new(0));

        let caller = {
            let cache = Arc::clone(&cache);
            let unit = Arc::clone(&unit);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_build(&unit, false, writer(calls, Duration::from_millis(100)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        caller.abort();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(cache.lookup(&unit).is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn degraded_mode_builds_without_persisting() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let cache = CacheManager::new(Some(blocker.join("cache")), "cc".to_string(), None);
        assert!(cache.is_degraded());

        let unit = unit(&temp, "int main(){}");
        let calls = Arc::new(AtomicUsize::new(0));
        let result = cache
            .get_or_build(&unit, false, writer(calls.clone(), Duration::ZERO))
            .await;

        assert!(result.success && !result.cached);
        assert!(result.artifact.as_ref().unwrap().is_file());
        assert!(cache.list_entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn artifact_extension_applied() {
        let temp = TempDir::new().unwrap();
        let cache = CacheManager::new(
            Some(temp.path().join("cache")),
            "cc".to_string(),
            Some("jar".to_string()),
        );
        let calls = Arc::new(AtomicUsize::new(0));

        let result = cache
            .get_or_build(&unit(&temp, "x"), false, writer(calls, Duration::ZERO))
            .await;
        assert!(result.artifact.unwrap().ends_with("hello.jar"));
    }
}
