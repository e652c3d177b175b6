//! Event log for server lifecycle and builds
//!
//! Appends JSON lines to `{state_dir}/events.log`. Enabled by default and
//! switched off with `general.event_log = false`.

use crate::config::ConfigManager;
use chrono::Utc;
use std::fmt;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Kinds of recorded events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ServerStarted,
    ServerStopped,
    BuildCompleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerStarted => "server.started",
            Self::ServerStopped => "server.stopped",
            Self::BuildCompleted => "build.completed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Append-only JSON lines log
#[derive(Debug, Clone)]
pub struct EventLog {
    enabled: bool,
    path: PathBuf,
}

impl EventLog {
    pub fn new(enabled: bool) -> Self {
        Self::at(ConfigManager::event_log_path(), enabled)
    }

    pub fn at(path: PathBuf, enabled: bool) -> Self {
        Self { enabled, path }
    }

    /// Record an event. IO failures are logged and dropped so the event log
    /// never fails a build or a server operation.
    pub async fn log(&self, event: EventType, data: serde_json::Value) {
        if !self.enabled {
            return;
        }

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event.as_str(),
            "pid": std::process::id(),
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize event {}: {}", event, e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            warn!("Failed to write event log {}: {}", self.path.display(), e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
