//! Inspect command - show what a build of a script would use

use crate::build::{BuildRequest, BuildService};
use crate::cli::args::{InspectArgs, OutputFormat};
use crate::config::Config;
use crate::diagnostic::Diagnostic;
use crate::directive::MacroInvocation;
use crate::error::{KilnError, KilnResult};
use crate::resolve::{CompilationUnit, Reference};
use crate::ui::{self, UiContext};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Serialize)]
struct SourceReport {
    path: PathBuf,
    /// Set when a precompiler rewrote the file
    #[serde(skip_serializing_if = "Option::is_none")]
    compiled_from: Option<PathBuf>,
    hash: String,
}

#[derive(Debug, Serialize)]
struct InspectReport {
    script: PathBuf,
    mode: &'static str,
    backend: String,
    fingerprint: String,
    /// Valid cached artifact, if any
    artifact: Option<PathBuf>,
    cache_enabled: bool,
    sources: Vec<SourceReport>,
    references: Vec<Reference>,
    probing_dirs: Vec<PathBuf>,
    compiler_args: Vec<String>,
    macros: Vec<MacroInvocation>,
    diagnostics: Vec<Diagnostic>,
}

impl InspectReport {
    fn new(unit: CompilationUnit, service: &BuildService) -> Self {
        let cache = service.cache();
        let fingerprint = cache.fingerprint(&unit);
        let artifact = cache.lookup(&unit).map(|stored| stored.artifact_path());

        let sources = unit
            .sources
            .iter()
            .map(|source| SourceReport {
                path: source.compile_path.clone(),
                compiled_from: source.is_precompiled().then(|| source.path.clone()),
                hash: source.hash.clone(),
            })
            .collect();

        Self {
            mode: unit.mode(),
            backend: cache.backend().to_string(),
            fingerprint,
            artifact,
            cache_enabled: !cache.is_degraded(),
            sources,
            script: unit.primary,
            references: unit.references,
            probing_dirs: unit.probing_dirs,
            compiler_args: unit.compiler_args,
            macros: unit.macros,
            diagnostics: unit.diagnostics,
        }
    }
}

/// Execute the inspect command
pub async fn execute(args: InspectArgs, config: &Config) -> KilnResult<()> {
    let script = std::fs::canonicalize(&args.script)
        .map_err(|_| KilnError::ScriptNotFound(args.script.clone()))?;
    let request = BuildRequest {
        script,
        debug: args.debug,
        ..BuildRequest::default()
    };

    let service = BuildService::from_config(config);
    let unit = service.resolve(&request).await?;
    let report = InspectReport::new(unit, &service);

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Plain => {
            for source in &report.sources {
                println!("{}", source.path.display());
            }
            for reference in &report.references {
                println!("{}", reference.path.display());
            }
        }
        OutputFormat::Table => print_report(&report),
    }
    Ok(())
}

fn print_report(report: &InspectReport) {
    let ctx = UiContext::detect();
    ui::intro(&ctx, &format!("Inspect {}", report.script.display()));

    ui::key_value(&ctx, "Mode", report.mode);
    ui::key_value(&ctx, "Compiler", &report.backend);
    ui::key_value(&ctx, "Fingerprint", &report.fingerprint);
    let cache_state = match (&report.artifact, report.cache_enabled) {
        (Some(artifact), _) => format!("hit ({})", artifact.display()),
        (None, true) => "miss".to_string(),
        (None, false) => "disabled".to_string(),
    };
    ui::key_value(&ctx, "Cache", &cache_state);

    ui::section(&ctx, "Sources");
    for source in &report.sources {
        match &source.compiled_from {
            Some(original) => println!(
                "  {}  {} (from {})",
                &source.hash[..12.min(source.hash.len())],
                source.path.display(),
                original.display()
            ),
            None => println!(
                "  {}  {}",
                &source.hash[..12.min(source.hash.len())],
                source.path.display()
            ),
        }
    }

    if !report.references.is_empty() {
        ui::section(&ctx, "References");
        for reference in &report.references {
            println!("  {}", reference.path.display());
        }
    }

    if !report.probing_dirs.is_empty() {
        ui::section(&ctx, "Probing directories");
        for dir in &report.probing_dirs {
            println!("  {}", dir.display());
        }
    }

    if !report.compiler_args.is_empty() {
        ui::section(&ctx, "Compiler arguments");
        println!("  {}", report.compiler_args.join(" "));
    }

    if !report.macros.is_empty() {
        ui::section(&ctx, "Macros");
        for invocation in &report.macros {
            println!(
                "  {}:{}  {}({})",
                invocation.table,
                invocation.line,
                invocation.op,
                invocation.args.join(", ")
            );
        }
    }

    if !report.diagnostics.is_empty() {
        ui::section(&ctx, "Warnings");
        ui::diagnostics(&ctx, &report.diagnostics);
    }
}
