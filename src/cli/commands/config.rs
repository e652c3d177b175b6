//! Config command - show or edit configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager, LOCAL_CONFIG_FILE};
use crate::error::{KilnError, KilnResult};
use crate::ui::{self, UiContext};
use std::path::Path;
use tokio::fs;

/// How a key's value is parsed from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Text,
    /// Empty value removes the key
    OptionalText,
    Bool,
    Number,
    /// Comma-separated
    List,
}

/// Every key `config set` accepts
const KEYS: &[(&str, ValueKind)] = &[
    ("general.log_format", ValueKind::Text),
    ("general.event_log", ValueKind::Bool),
    ("compiler.program", ValueKind::Text),
    ("compiler.args", ValueKind::List),
    ("compiler.debug_args", ValueKind::List),
    ("compiler.release_args", ValueKind::List),
    ("compiler.output_flag", ValueKind::Text),
    ("compiler.reference_flag", ValueKind::OptionalText),
    ("compiler.timeout_secs", ValueKind::Number),
    ("compiler.artifact_extension", ValueKind::OptionalText),
    ("compiler.runner", ValueKind::List),
    ("cache.enabled", ValueKind::Bool),
    ("cache.dir", ValueKind::OptionalText),
    ("server.enabled", ValueKind::Bool),
    ("server.auto_start", ValueKind::Bool),
    ("server.port", ValueKind::Number),
    ("server.idle_timeout_secs", ValueKind::Number),
    ("server.stop_timeout_ms", ValueKind::Number),
    ("server.start_timeout_ms", ValueKind::Number),
    ("server.drain_timeout_ms", ValueKind::Number),
    ("resolve.search_roots", ValueKind::List),
    ("resolve.precompilers", ValueKind::List),
    ("packages.registry", ValueKind::OptionalText),
    ("packages.dir", ValueKind::OptionalText),
    ("packages.timeout_secs", ValueKind::Number),
];

/// Execute the config command
pub async fn execute(args: ConfigArgs, config: &Config, config_path: Option<&Path>) -> KilnResult<()> {
    let manager = match config_path {
        Some(path) => ConfigManager::with_path(path.to_path_buf()),
        None => ConfigManager::new(),
    };

    match args.action {
        None | Some(ConfigAction::Show) => show_config(config)?,
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(&manager, force).await?,
        Some(ConfigAction::Set { key, value, local }) => {
            if local {
                set_local_value(&key, &value).await?
            } else {
                set_value(&manager, &key, &value).await?
            }
        }
    }

    Ok(())
}

fn show_config(config: &Config) -> KilnResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn init_config(manager: &ConfigManager, force: bool) -> KilnResult<()> {
    let ctx = UiContext::detect();
    let path = manager.path();

    if path.exists() && !force {
        ui::step_warn_hint(
            &ctx,
            &format!("Config already exists at {}", path.display()),
            "Use --force to overwrite",
        );
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    ui::step_ok_detail(&ctx, "Configuration initialized", &path.display().to_string());
    Ok(())
}

/// Set a key in the global config file.
///
/// Only the file's own contents are edited; values merged in from a local
/// `.kiln.toml` are never written back.
async fn set_value(manager: &ConfigManager, key: &str, value: &str) -> KilnResult<()> {
    let ctx = UiContext::detect();
    let kind = value_kind(key)?;

    let mut doc = toml::Value::try_from(manager.load().await?)?;
    set_toml_value(&mut doc, key, value, kind)?;
    let config = validate(doc, manager.path())?;

    manager.save(&config).await?;
    ui::step_ok(&ctx, &format!("Set {} = {}", key, value));
    Ok(())
}

async fn set_local_value(key: &str, value: &str) -> KilnResult<()> {
    let ctx = UiContext::detect();
    let kind = value_kind(key)?;

    let cwd = std::env::current_dir().map_err(|e| KilnError::io("getting current directory", e))?;
    let local_path = cwd.join(LOCAL_CONFIG_FILE);

    // Only keys the user has set are kept in the local file
    let mut doc: toml::Value = if local_path.exists() {
        let content = fs::read_to_string(&local_path)
            .await
            .map_err(|e| KilnError::io(format!("reading {}", local_path.display()), e))?;
        content
            .parse()
            .map_err(|e: toml::de::Error| KilnError::ConfigInvalid {
                path: local_path.clone(),
                reason: e.to_string(),
            })?
    } else {
        toml::Value::Table(toml::map::Map::new())
    };

    set_toml_value(&mut doc, key, value, kind)?;
    validate(doc.clone(), &local_path)?;

    let content = toml::to_string_pretty(&doc)?;
    fs::write(&local_path, content)
        .await
        .map_err(|e| KilnError::io(format!("writing {}", local_path.display()), e))?;

    ui::step_ok(
        &ctx,
        &format!("Set {} = {} in {}", key, value, local_path.display()),
    );
    Ok(())
}

fn value_kind(key: &str) -> KilnResult<ValueKind> {
    KEYS.iter()
        .find(|(name, _)| *name == key)
        .map(|(_, kind)| *kind)
        .ok_or_else(|| {
            let valid: Vec<&str> = KEYS.iter().map(|(name, _)| *name).collect();
            KilnError::User(format!(
                "Unknown config key: {}\nValid keys:\n  {}",
                key,
                valid.join("\n  ")
            ))
        })
}

/// Check that an edited document still deserializes
fn validate(doc: toml::Value, path: &Path) -> KilnResult<Config> {
    doc.try_into().map_err(|e: toml::de::Error| KilnError::ConfigInvalid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Set a dot-separated key in a TOML value tree, creating intermediate tables as needed.
fn set_toml_value(doc: &mut toml::Value, key: &str, value: &str, kind: ValueKind) -> KilnResult<()> {
    let Some((sections, leaf)) = key.rsplit_once('.') else {
        return Err(KilnError::User(format!("Expected section.key, got: {}", key)));
    };

    let mut current = doc;
    for part in sections.split('.') {
        current = current
            .as_table_mut()
            .ok_or_else(|| KilnError::User(format!("Expected table at key: {}", part)))?
            .entry(part)
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
    let table = current
        .as_table_mut()
        .ok_or_else(|| KilnError::User(format!("Expected table for key: {}", key)))?;

    let parsed = match kind {
        ValueKind::Text => toml::Value::String(value.to_string()),
        ValueKind::OptionalText if value.is_empty() => {
            table.remove(leaf);
            return Ok(());
        }
        ValueKind::OptionalText => toml::Value::String(value.to_string()),
        ValueKind::Bool => toml::Value::Boolean(parse_bool(value)?),
        ValueKind::Number => toml::Value::Integer(
            value
                .parse()
                .map_err(|_| KilnError::User(format!("Invalid number: {}", value)))?,
        ),
        ValueKind::List => toml::Value::Array(
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| toml::Value::String(item.to_string()))
                .collect(),
        ),
    };

    table.insert(leaf.to_string(), parsed);
    Ok(())
}

fn parse_bool(value: &str) -> KilnResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(KilnError::User(format!(
            "Invalid boolean value: {}. Use true/false",
            value
        ))),
    }
}
