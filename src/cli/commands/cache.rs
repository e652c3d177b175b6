//! Cache command - inspect and clear the build cache

use crate::build::{BuildRequest, BuildService};
use crate::cache::{format_bytes, StoredEntry};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::Config;
use crate::error::{KilnError, KilnResult};
use crate::ui::{self, UiContext};
use console::style;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config) -> KilnResult<()> {
    let service = BuildService::from_config(config);

    match args.action {
        CacheAction::List { format } => list_entries(&service, format),
        CacheAction::Info { script, debug } => show_script_info(&service, &script, debug).await,
        CacheAction::Clear { yes } => clear_cache(&service, yes).await,
    }
}

/// Compact form of an entry for `--format json`
#[derive(Serialize)]
struct EntryJson<'a> {
    fingerprint: &'a str,
    primary: &'a Path,
    mode: &'a str,
    backend: &'a str,
    compiled_at: String,
    artifact: PathBuf,
    inputs: usize,
    size_bytes: u64,
}

impl<'a> From<&'a StoredEntry> for EntryJson<'a> {
    fn from(stored: &'a StoredEntry) -> Self {
        Self {
            fingerprint: &stored.entry.fingerprint,
            primary: &stored.entry.primary,
            mode: &stored.entry.mode,
            backend: &stored.entry.backend,
            compiled_at: stored.entry.compiled_at.to_rfc3339(),
            artifact: stored.artifact_path(),
            inputs: stored.entry.inputs.len(),
            size_bytes: stored.size_bytes,
        }
    }
}

fn list_entries(service: &BuildService, format: OutputFormat) -> KilnResult<()> {
    let entries = service.cache().list_entries()?;

    if entries.is_empty() {
        match format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => ui::step_info(&UiContext::detect(), "No cached builds"),
        }
        return Ok(());
    }

    match format {
        OutputFormat::Table => print_entry_table(&entries),
        OutputFormat::Json => {
            let json: Vec<EntryJson<'_>> = entries.iter().map(EntryJson::from).collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Plain => {
            for stored in &entries {
                println!("{}", stored.entry.fingerprint);
            }
        }
    }
    Ok(())
}

fn print_entry_table(entries: &[StoredEntry]) {
    println!(
        "{:<18} {:<8} {:<10} {:<18} {:<30}",
        style("FINGERPRINT").bold(),
        style("MODE").bold(),
        style("SIZE").bold(),
        style("COMPILED").bold(),
        style("SCRIPT").bold()
    );
    println!("{}", "-".repeat(88));

    let mut total = 0;
    for stored in entries {
        total += stored.size_bytes;
        let entry = &stored.entry;
        println!(
            "{:<18} {:<8} {:<10} {:<18} {:<30}",
            &entry.fingerprint[..16.min(entry.fingerprint.len())],
            entry.mode,
            format_bytes(stored.size_bytes),
            entry.compiled_at.format("%Y-%m-%d %H:%M").to_string(),
            entry.primary.display()
        );
    }

    println!();
    println!("{} build(s), {}", entries.len(), format_bytes(total));
}

/// Show the cache entry that a build of `script` would use
async fn show_script_info(service: &BuildService, script: &Path, debug: bool) -> KilnResult<()> {
    let ctx = UiContext::detect();
    let script = std::fs::canonicalize(script)
        .map_err(|_| KilnError::ScriptNotFound(script.to_path_buf()))?;

    let request = BuildRequest {
        script: script.clone(),
        debug,
        ..BuildRequest::default()
    };
    let unit = service.resolve(&request).await?;
    let fingerprint = service.cache().fingerprint(&unit);

    ui::key_value(&ctx, "Script", &script.display().to_string());
    ui::key_value(&ctx, "Fingerprint", &fingerprint);

    if service.cache().is_degraded() {
        ui::step_warn(&ctx, "Cache directory unusable; builds are not cached");
        return Ok(());
    }

    let Some(stored) = service.cache().lookup(&unit) else {
        ui::step_info(&ctx, "Not cached (next run compiles)");
        return Ok(());
    };

    let entry = &stored.entry;
    ui::key_value(&ctx, "Artifact", &stored.artifact_path().display().to_string());
    ui::key_value(&ctx, "Compiled", &entry.compiled_at.to_rfc3339());
    ui::key_value(&ctx, "Compiler", &entry.backend);
    ui::key_value(&ctx, "Size", &format_bytes(stored.size_bytes));

    ui::section(&ctx, "Inputs");
    for input in &entry.inputs {
        println!(
            "  {} {:<9} {}  {}",
            style("•").cyan(),
            input.kind.to_string(),
            &input.hash[..12.min(input.hash.len())],
            input.path.display()
        );
    }
    Ok(())
}

async fn clear_cache(service: &BuildService, yes: bool) -> KilnResult<()> {
    let ctx = UiContext::detect().with_auto_yes(yes);
    let entries = service.cache().list_entries()?;

    if entries.is_empty() {
        ui::step_info(&ctx, "No cached builds to clear");
        return Ok(());
    }

    let total: u64 = entries.iter().map(|e| e.size_bytes).sum();
    let prompt = format!(
        "Remove {} cached build(s) ({})?",
        entries.len(),
        format_bytes(total)
    );
    if !ui::confirm(&ctx, &prompt, false).await? {
        ui::remark(&ctx, "Aborted");
        return Ok(());
    }

    let removed = service.cache().clear()?;
    ui::step_ok(&ctx, &format!("Cleared {} cached build(s)", removed));
    Ok(())
}
