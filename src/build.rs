//! Build requests, results and the service that ties resolution, caching
//! and compilation together

use crate::cache::{BuildJob, CacheManager};
use crate::compiler::{CompileJob, Compiler, ExternalCompiler};
use crate::config::{Config, ConfigManager};
use crate::diagnostic::{error_count, Diagnostic};
use crate::error::KilnError;
use crate::events::{EventLog, EventType};
use crate::resolve::{CompilationUnit, ResolveOptions, Resolver};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// A request to build one script
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub script: PathBuf,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Bypass the cache lookup (in-flight builds are still shared)
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub output: Option<PathBuf>,
}

impl BuildRequest {
    pub fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            debug: self.debug,
            references: self.references.clone(),
            args: self.args.clone(),
            output: self.output.clone(),
        }
    }
}

/// Why a build failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Resolution,
    PackageFetch,
    Compile,
    Internal,
}

impl FailureKind {
    fn from_error(error: &KilnError) -> Self {
        match error {
            KilnError::PackageFetch { .. } => Self::PackageFetch,
            e if e.is_resolution() => Self::Resolution,
            _ => Self::Internal,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolution => write!(f, "resolution"),
            Self::PackageFetch => write!(f, "package fetch"),
            Self::Compile => write!(f, "compile"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Outcome of a build, as returned by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub success: bool,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    #[serde(default)]
    pub artifact: Option<PathBuf>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub failure: Option<FailureKind>,
}

impl BuildResult {
    pub fn succeeded(artifact: PathBuf, fingerprint: String, cached: bool, diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            success: true,
            diagnostics,
            artifact: Some(artifact),
            fingerprint: Some(fingerprint),
            cached,
            failure: None,
        }
    }

    pub fn failed(kind: FailureKind, diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            success: false,
            diagnostics,
            artifact: None,
            fingerprint: None,
            cached: false,
            failure: Some(kind),
        }
    }

    /// Failed result carrying a single error diagnostic
    pub fn internal(message: impl Into<String>) -> Self {
        Self::failed(FailureKind::Internal, vec![Diagnostic::error(message)])
    }

    /// Convert an error raised before compilation into a result
    pub fn from_error(error: &KilnError) -> Self {
        let mut diagnostic = Diagnostic::error(error.to_string());
        if let Some((file, line)) = error.location() {
            diagnostic = diagnostic.at(&file, line);
        }
        Self::failed(FailureKind::from_error(error), vec![diagnostic])
    }

    /// Only transient failures are worth retrying
    pub fn is_retryable(&self) -> bool {
        self.failure == Some(FailureKind::PackageFetch)
    }

    pub fn error_count(&self) -> usize {
        error_count(&self.diagnostics)
    }
}

/// Resolves, caches and compiles scripts
pub struct BuildService {
    resolver: Resolver,
    cache: CacheManager,
    compiler: Arc<dyn Compiler>,
    events: EventLog,
}

impl BuildService {
    /// Assemble a service from configuration with the external compiler
    pub fn from_config(config: &Config) -> Self {
        let compiler: Arc<dyn Compiler> = Arc::new(ExternalCompiler::new(config.compiler.clone()));
        Self::with_compiler(config, compiler)
    }

    pub fn with_compiler(config: &Config, compiler: Arc<dyn Compiler>) -> Self {
        let cache_root = config
            .cache
            .enabled
            .then(|| ConfigManager::cache_dir(config));
        let cache = CacheManager::new(
            cache_root,
            compiler.identity(),
            config.compiler.artifact_extension.clone(),
        );

        Self {
            resolver: Resolver::new(config),
            cache,
            compiler,
            events: EventLog::new(config.general.event_log),
        }
    }

    /// Replace the resolver (used to inject fetchers and precompilers)
    pub fn with_resolver(mut self, resolver: Resolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Resolve a request into its compilation unit without building
    pub async fn resolve(&self, request: &BuildRequest) -> Result<CompilationUnit, KilnError> {
        self.resolver
            .resolve(&request.script, &request.resolve_options())
            .await
    }

    /// Build a script. Never fails: every problem is reported in the result.
    pub async fn build(&self, request: &BuildRequest) -> BuildResult {
        let started = Instant::now();
        self.cache.set_backend(self.compiler.identity());

        let unit = match self.resolve(request).await {
            Ok(unit) => unit,
            Err(e) => {
                debug!("Resolution of {} failed: {}", request.script.display(), e);
                let result = BuildResult::from_error(&e);
                self.record(request, &result, started).await;
                return result;
            }
        };

        let compiler = Arc::clone(&self.compiler);
        let result = self
            .cache
            .get_or_build(&unit, request.force, move |job: BuildJob| async move {
                let compile = CompileJob::from_unit(&job.unit, job.artifact);
                compiler.compile(&compile).await
            })
            .await;

        info!(
            "Built {} ({}, {} error(s)) in {}ms",
            request.script.display(),
            if result.cached { "cached" } else { "compiled" },
            result.error_count(),
            started.elapsed().as_millis()
        );
        self.record(request, &result, started).await;
        result
    }

    async fn record(&self, request: &BuildRequest, result: &BuildResult, started: Instant) {
        self.events
            .log(
                EventType::BuildCompleted,
                serde_json::json!({
                    "script": request.script,
                    "success": result.success,
                    "cached": result.cached,
                    "fingerprint": result.fingerprint,
                    "failure": result.failure,
                    "duration_ms": started.elapsed().as_millis() as u64,
                }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::CompilerOutput;
    use crate::error::KilnResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Compiler that writes the concatenated sources as the artifact
    struct ConcatCompiler {
        calls: AtomicUsize,
        version: AtomicUsize,
    }

    #[async_trait]
    impl Compiler for ConcatCompiler {
        fn identity(&self) -> String {
            format!("concat@{}", self.version.load(Ordering::SeqCst))
        }

        async fn compile(&self, job: &CompileJob) -> KilnResult<CompilerOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut text = String::new();
            for source in &job.sources {
                text.push_str(&std::fs::read_to_string(source).unwrap());
            }
            if text.contains("syntax error") {
                return Ok(CompilerOutput {
                    success: false,
                    exit_code: Some(1),
                    diagnostics: vec![Diagnostic::error("syntax error")],
                });
            }
            std::fs::write(&job.artifact, text).unwrap();
            Ok(CompilerOutput {
                success: true,
                exit_code: Some(0),
                diagnostics: vec![],
            })
        }
    }

    fn service(temp: &TempDir) -> (BuildService, Arc<ConcatCompiler>) {
        let mut config = Config::default();
        config.cache.dir = Some(temp.path().join("cache"));
        config.packages.dir = Some(temp.path().join("packages"));
        config.general.event_log = false;
        let compiler = Arc::new(ConcatCompiler {
            calls: AtomicUsize::new(0),
            version: AtomicUsize::new(1),
        });
        (BuildService::with_compiler(&config, compiler.clone()), compiler)
    }

    fn request(script: PathBuf) -> BuildRequest {
        BuildRequest {
            script,
            ..BuildRequest::default()
        }
    }

    #[tokio::test]
    async fn second_build_is_cached() {
        let temp = TempDir::new().unwrap();
        let script = temp.path().join("hello.c");
        std::fs::write(&script, "//kiln_inc util.c\nmain\n").unwrap();
        std::fs::write(temp.path().join("util.c"), "util\n").unwrap();
        let (service, compiler) = service(&temp);

        let first = service.build(&request(script.clone())).await;
        assert!(first.success);
        assert!(!first.cached);

        let second = service.build(&request(script)).await;
        assert!(second.success);
        assert!(second.cached);
        assert_eq!(first.artifact, second.artifact);
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn upgraded_compiler_rebuilds() {
        let temp = TempDir::new().unwrap();
        let script = temp.path().join("hello.c");
        std::fs::write(&script, "main\n").unwrap();
        let (service, compiler) = service(&temp);

        let first = service.build(&request(script.clone())).await;
        compiler.version.store(2, Ordering::SeqCst);
        let second = service.build(&request(script)).await;

        assert!(second.success);
        assert!(!second.cached);
        assert_ne!(first.fingerprint, second.fingerprint);
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(service.cache().backend(), "concat@2");
    }

    #[tokio::test]
    async fn resolution_failure_reported() {
        let temp = TempDir::new().unwrap();
        let script = temp.path().join("hello.c");
        std::fs::write(&script, "//kiln_inc missing.c\n").unwrap();
        let (service, compiler) = service(&temp);

        let result = service.build(&request(script)).await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Resolution));
        assert_eq!(result.diagnostics[0].line, Some(1));
        assert!(!result.is_retryable());
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn compile_failure_then_fix() {
        let temp = TempDir::new().unwrap();
        let script = temp.path().join("hello.c");
        std::fs::write(&script, "syntax error\n").unwrap();
        let (service, compiler) = service(&temp);

        let failed = service.build(&request(script.clone())).await;
        assert!(!failed.success);
        assert_eq!(failed.failure, Some(FailureKind::Compile));
        assert!(service.cache().list_entries().unwrap().is_empty());

        std::fs::write(&script, "fixed\n").unwrap();
        let fixed = service.build(&request(script)).await;
        assert!(fixed.success);
        assert!(!fixed.cached);
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn output_copy() {
        let temp = TempDir::new().unwrap();
        let script = temp.path().join("hello.c");
        std::fs::write(&script, "main\n").unwrap();
        let (service, _) = service(&temp);

        let out = temp.path().join("dist").join("hello");
        let mut req = request(script);
        req.output = Some(out.clone());
        let result = service.build(&req).await;

        assert!(result.success);
        assert_eq!(std::fs::read_to_string(out).unwrap(), "main\n");
    }

    #[test]
    fn retryable_only_for_package_fetch() {
        let err = KilnError::PackageFetch {
            name: "w".to_string(),
            reason: "timeout".to_string(),
        };
        assert!(BuildResult::from_error(&err).is_retryable());
        assert!(!BuildResult::internal("boom").is_retryable());
    }
}
