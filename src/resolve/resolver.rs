//! Breadth-first dependency resolution
//!
//! Resolution starts at the primary script and walks `//kiln_inc` directives
//! breadth-first. Directives are flat: probing directories and compiler
//! flags declared in an included file apply to the whole unit, including
//! files resolved after it.

use crate::config::{Config, ConfigManager};
use crate::diagnostic::Diagnostic;
use crate::directive::{self, Directive, DirectiveKind, ScanOutput};
use crate::error::{KilnError, KilnResult};
use crate::resolve::package::{
    parse_requirement, PackageFetcher, PackageStore, RegistryFetcher,
};
use crate::resolve::precompiler::{ExternalPrecompiler, Precompiler};
use crate::resolve::unit::{
    content_hash, CompilationUnit, Reference, ResolveOptions, SourceFile,
};
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// File name patterns tried for a bare reference name
const REFERENCE_PATTERNS: &[(&str, &str)] = &[
    ("", ""),
    ("lib", ".so"),
    ("lib", ".a"),
    ("lib", ".dylib"),
    ("", ".dll"),
    ("", ".lib"),
];

/// Shared state accumulated across every file of a unit
#[derive(Default)]
struct ResolutionContext {
    probing_dirs: Vec<PathBuf>,
    compiler_args: Vec<String>,
    references: Vec<Reference>,
    seen_references: HashSet<PathBuf>,
    diagnostics: Vec<Diagnostic>,
}

impl ResolutionContext {
    fn add_probing_dir(&mut self, dir: PathBuf) {
        if !self.probing_dirs.contains(&dir) {
            self.probing_dirs.push(dir);
        }
    }

    async fn add_reference(&mut self, path: PathBuf) -> KilnResult<()> {
        if !self.seen_references.insert(path.clone()) {
            return Ok(());
        }
        let bytes = fs::read(&path)
            .await
            .map_err(|e| KilnError::io(format!("reading reference {}", path.display()), e))?;
        let modified = modified_time(&path).await?;
        self.references.push(Reference {
            hash: content_hash(&bytes),
            path,
            modified,
        });
        Ok(())
    }
}

/// An include waiting in the breadth-first queue. The path is looked up
/// when the include is dequeued so that probing directories declared by
/// files ahead of it in the queue are already known.
struct PendingInclude {
    name: String,
    optional: bool,
    file: PathBuf,
    line: usize,
}

enum Queued {
    Primary(PathBuf),
    Include(PendingInclude),
}

/// Resolves a primary script into a compilation unit
pub struct Resolver {
    search_roots: Vec<PathBuf>,
    default_precompilers: Vec<String>,
    precompiled_dir: PathBuf,
    store: PackageStore,
    fetcher: Option<Arc<dyn PackageFetcher>>,
    precompiler: Arc<dyn Precompiler>,
}

impl Resolver {
    /// Create a resolver from configuration
    pub fn new(config: &Config) -> Self {
        let fetcher = config.packages.registry.as_ref().map(|url| {
            Arc::new(RegistryFetcher::new(
                url.clone(),
                Duration::from_secs(config.packages.timeout_secs),
            )) as Arc<dyn PackageFetcher>
        });

        Self {
            search_roots: config.resolve.search_roots.clone(),
            default_precompilers: config.resolve.precompilers.clone(),
            precompiled_dir: ConfigManager::precompiled_dir(config),
            store: PackageStore::new(ConfigManager::packages_dir(config)),
            fetcher,
            precompiler: Arc::new(ExternalPrecompiler::new(config.resolve.search_roots.clone())),
        }
    }

    /// Replace the package fetcher
    pub fn with_fetcher(mut self, fetcher: Arc<dyn PackageFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Replace the precompiler runner
    pub fn with_precompiler(mut self, precompiler: Arc<dyn Precompiler>) -> Self {
        self.precompiler = precompiler;
        self
    }

    /// Resolve `primary` and everything it pulls in
    pub async fn resolve(
        &self,
        primary: &Path,
        options: &ResolveOptions,
    ) -> KilnResult<CompilationUnit> {
        let primary = fs::canonicalize(primary)
            .await
            .map_err(|_| KilnError::ScriptNotFound(primary.to_path_buf()))?;
        let extension = primary
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_string);

        let mut ctx = ResolutionContext::default();
        let mut macros = Vec::new();
        let mut sources = Vec::new();
        let mut visited = HashSet::from([primary.clone()]);
        let mut queue = VecDeque::from([Queued::Primary(primary.clone())]);

        while let Some(next) = queue.pop_front() {
            let path = match next {
                Queued::Primary(path) => path,
                Queued::Include(include) => {
                    match self.resolve_include(&mut ctx, &include, &primary, extension.as_deref())? {
                        Some(found) if visited.insert(found.clone()) => {
                            debug!("Include {} -> {}", include.name, found.display());
                            found
                        }
                        _ => continue,
                    }
                }
            };

            let (source, scan) = self.load(&path).await?;
            debug!(
                "Scanned {}: {} directive(s)",
                path.display(),
                scan.directives.len()
            );

            ctx.diagnostics.extend(scan.diagnostics.iter().cloned().map(|mut d| {
                d.file = Some(path.clone());
                d
            }));
            macros.extend(scan.macros.iter().cloned());

            let dir = parent_dir(&path);

            for directive in scan.of_kind(DirectiveKind::ProbingDir) {
                for item in &directive.items {
                    self.add_probing_dirs(&mut ctx, &dir, &item.value, &path, directive.line);
                }
            }
            for directive in scan.of_kind(DirectiveKind::CompilerArgs) {
                ctx.compiler_args
                    .extend(directive.items.iter().map(|i| i.value.clone()));
            }

            for directive in &scan.directives {
                match directive.kind {
                    DirectiveKind::Include => {
                        queue.extend(directive.items.iter().map(|item| {
                            Queued::Include(PendingInclude {
                                name: item.value.clone(),
                                optional: item.has_option("optional"),
                                file: path.clone(),
                                line: directive.line,
                            })
                        }));
                    }
                    DirectiveKind::Reference => {
                        for item in &directive.items {
                            let found = self
                                .find_reference(&ctx, &dir, &item.value)
                                .ok_or_else(|| KilnError::ReferenceNotFound {
                                    name: item.value.clone(),
                                    file: path.clone(),
                                    line: directive.line,
                                })?;
                            ctx.add_reference(found).await?;
                        }
                    }
                    DirectiveKind::Package => {
                        for item in &directive.items {
                            let (name, version) = Directive::package_spec(item);
                            for file in self.resolve_package(&name, version.as_deref()).await? {
                                ctx.add_reference(file).await?;
                            }
                        }
                    }
                    _ => {}
                }
            }

            sources.push(source);
        }

        let primary_dir = parent_dir(&primary);
        for name in &options.references {
            let found = self
                .find_reference(&ctx, &primary_dir, name)
                .ok_or_else(|| KilnError::ReferenceNotFound {
                    name: name.clone(),
                    file: primary.clone(),
                    line: 0,
                })?;
            ctx.add_reference(found).await?;
        }
        ctx.compiler_args.extend(options.args.iter().cloned());

        for diag in &ctx.diagnostics {
            warn!("{}", diag);
        }

        Ok(CompilationUnit {
            primary,
            sources,
            references: ctx.references,
            probing_dirs: ctx.probing_dirs,
            compiler_args: ctx.compiler_args,
            debug: options.debug,
            output: options.output.clone(),
            macros,
            diagnostics: ctx.diagnostics,
        })
    }

    /// Locate a queued include. `None` means an optional include was missing.
    fn resolve_include(
        &self,
        ctx: &mut ResolutionContext,
        include: &PendingInclude,
        primary: &Path,
        extension: Option<&str>,
    ) -> KilnResult<Option<PathBuf>> {
        let dir = parent_dir(&include.file);

        match self.find_source(ctx, &dir, &include.name, extension) {
            Some(found) if found == primary => Err(KilnError::SelfInclude {
                primary: primary.to_path_buf(),
                file: include.file.clone(),
                line: include.line,
            }),
            Some(found) => Ok(Some(found)),
            None if include.optional => {
                ctx.diagnostics.push(
                    Diagnostic::warning(format!("optional include not found: {}", include.name))
                        .at(&include.file, include.line),
                );
                Ok(None)
            }
            None => Err(KilnError::IncludeNotFound {
                path: include.name.clone(),
                file: include.file.clone(),
                line: include.line,
            }),
        }
    }

    /// Read a file, run its precompilers and scan the result
    async fn load(&self, path: &Path) -> KilnResult<(SourceFile, ScanOutput)> {
        let raw = fs::read_to_string(path)
            .await
            .map_err(|e| KilnError::io(format!("reading source {}", path.display()), e))?;
        let modified = modified_time(path).await?;

        let mut hooks = self.default_precompilers.clone();
        let first_pass = directive::scan(&raw);
        hooks.extend(
            first_pass
                .of_kind(DirectiveKind::Precompiler)
                .flat_map(|d| d.items.iter().map(|i| i.value.clone())),
        );

        if hooks.is_empty() {
            let source = SourceFile {
                path: path.to_path_buf(),
                compile_path: path.to_path_buf(),
                hash: content_hash(raw.as_bytes()),
                text: raw,
                modified,
            };
            return Ok((source, first_pass));
        }

        let mut text = raw;
        for hook in &hooks {
            text = self.precompiler.transform(hook, path, &text).await?;
        }

        let hash = content_hash(text.as_bytes());
        let compile_path = self.write_precompiled(path, &hash, &text).await?;
        let scan = directive::scan(&text);

        let source = SourceFile {
            path: path.to_path_buf(),
            compile_path,
            text,
            modified,
            hash,
        };
        Ok((source, scan))
    }

    async fn write_precompiled(&self, path: &Path, hash: &str, text: &str) -> KilnResult<PathBuf> {
        fs::create_dir_all(&self.precompiled_dir).await.map_err(|e| {
            KilnError::io(
                format!("creating {}", self.precompiled_dir.display()),
                e,
            )
        })?;

        let mut name = hash[..16].to_string();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            name.push('.');
            name.push_str(ext);
        }
        let target = self.precompiled_dir.join(name);
        if !target.exists() {
            fs::write(&target, text)
                .await
                .map_err(|e| KilnError::io(format!("writing {}", target.display()), e))?;
        }
        Ok(target)
    }

    fn add_probing_dirs(
        &self,
        ctx: &mut ResolutionContext,
        base: &Path,
        value: &str,
        file: &Path,
        line: usize,
    ) {
        let (dir, recursive) = match value
            .strip_suffix("/**")
            .or_else(|| value.strip_suffix("/*"))
            .or_else(|| value.strip_suffix("\\**"))
        {
            Some(stripped) => (stripped, true),
            None => (value, false),
        };

        let root = base.join(dir);
        let Ok(root) = root.canonicalize() else {
            ctx.diagnostics.push(
                Diagnostic::warning(format!("probing directory not found: {}", value))
                    .at(file, line),
            );
            return;
        };

        ctx.add_probing_dir(root.clone());
        if recursive {
            for entry in WalkDir::new(&root)
                .min_depth(1)
                .follow_links(true)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_dir())
            {
                ctx.add_probing_dir(entry.into_path());
            }
        }
    }

    /// Directories searched for a file referenced from `dir`, in priority order
    fn search_dirs(&self, ctx: &ResolutionContext, dir: &Path) -> Vec<PathBuf> {
        std::iter::once(dir.to_path_buf())
            .chain(ctx.probing_dirs.iter().cloned())
            .chain(self.search_roots.iter().cloned())
            .collect()
    }

    fn find_source(
        &self,
        ctx: &ResolutionContext,
        dir: &Path,
        name: &str,
        extension: Option<&str>,
    ) -> Option<PathBuf> {
        let mut names = vec![name.to_string()];
        if let Some(ext) = extension {
            if Path::new(name).extension().is_none() {
                names.push(format!("{}.{}", name, ext));
            }
        }

        if Path::new(name).is_absolute() {
            return names
                .iter()
                .map(PathBuf::from)
                .find(|p| p.is_file())
                .and_then(|p| p.canonicalize().ok());
        }

        self.search_dirs(ctx, dir)
            .iter()
            .flat_map(|d| names.iter().map(move |n| d.join(n)))
            .find(|p| p.is_file())
            .and_then(|p| p.canonicalize().ok())
    }

    fn find_reference(&self, ctx: &ResolutionContext, dir: &Path, name: &str) -> Option<PathBuf> {
        let candidate = Path::new(name);
        if candidate.is_absolute() {
            return candidate
                .is_file()
                .then(|| candidate.canonicalize().ok())
                .flatten();
        }

        let names: Vec<String> = REFERENCE_PATTERNS
            .iter()
            .map(|(prefix, suffix)| format!("{}{}{}", prefix, name, suffix))
            .collect();

        self.search_dirs(ctx, dir)
            .iter()
            .flat_map(|d| names.iter().map(move |n| d.join(n)))
            .find(|p| p.is_file())
            .and_then(|p| p.canonicalize().ok())
    }

    /// Locate a package in the store, fetching it when absent
    async fn resolve_package(&self, name: &str, version: Option<&str>) -> KilnResult<Vec<PathBuf>> {
        let requirement = parse_requirement(name, version)?;

        if let Some(installed) = self.store.find_installed(name, &requirement) {
            debug!("Using installed package {} {}", name, installed.version);
            return Ok(installed.files);
        }

        let fetcher = self.fetcher.as_ref().ok_or_else(|| KilnError::PackageNotFound {
            name: name.to_string(),
            requirement: requirement.to_string(),
        })?;
        let installed = fetcher.fetch(name, &requirement, &self.store).await?;
        Ok(installed.files)
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

async fn modified_time(path: &Path) -> KilnResult<DateTime<Utc>> {
    let metadata = fs::metadata(path)
        .await
        .map_err(|e| KilnError::io(format!("reading metadata of {}", path.display()), e))?;
    let modified = metadata
        .modified()
        .map_err(|e| KilnError::io(format!("reading mtime of {}", path.display()), e))?;
    Ok(DateTime::<Utc>::from(modified))
}
