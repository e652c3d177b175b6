//! Registry of running build servers
//!
//! Stored as JSON at `{state_dir}/servers.json`. Every read-modify-write
//! happens under an exclusive OS lock on `servers.lock` so concurrent kiln
//! processes never lose each other's entries.

use crate::config::ConfigManager;
use crate::error::{KilnError, KilnResult};
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A registered server process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInstance {
    pub pid: u32,
    pub port: u16,
    pub started_at: DateTime<Utc>,
    /// Compiler program the server builds with
    pub compiler: String,
    pub idle_timeout_secs: u64,
    pub version: String,
}

/// Whether a process with `pid` exists
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

/// Forcefully terminate a process
#[cfg(unix)]
pub fn kill_pid(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: sending a signal has no memory-safety implications
    unsafe { libc::kill(pid, libc::SIGKILL) == 0 }
}

#[cfg(not(unix))]
pub fn kill_pid(_pid: u32) -> bool {
    false
}

/// Holds the registry lock until dropped
struct RegistryLock {
    file: File,
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release registry lock: {}", e);
        }
    }
}

/// File-backed server registry
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(ConfigManager::registry_path())
    }
}

impl Registry {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Run `update` on the entry list under the lock and persist the result
    async fn with_entries<T, F>(&self, update: F) -> KilnResult<T>
    where
        F: FnOnce(&mut Vec<ServerInstance>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path();

        tokio::task::spawn_blocking(move || -> KilnResult<T> {
            let _lock = acquire(&lock_path)?;
            let mut entries = read_entries(&path);
            let before = entries.clone();

            let result = update(&mut entries);
            if entries != before {
                write_entries(&path, &entries)?;
            }
            Ok(result)
        })
        .await
        .map_err(|e| KilnError::RegistryLock(format!("registry task failed: {}", e)))?
    }

    /// Add an instance, replacing any entry on the same port
    pub async fn register(&self, instance: ServerInstance) -> KilnResult<()> {
        debug!("Registering server pid {} on port {}", instance.pid, instance.port);
        self.with_entries(move |entries| {
            entries.retain(|e| e.port != instance.port);
            entries.push(instance);
        })
        .await
    }

    /// Remove the entry for `port` owned by `pid`
    pub async fn deregister(&self, port: u16, pid: u32) -> KilnResult<()> {
        debug!("Deregistering server pid {} on port {}", pid, port);
        self.with_entries(move |entries| {
            entries.retain(|e| !(e.port == port && e.pid == pid));
        })
        .await
    }

    /// Live instances, pruning entries whose process is gone
    pub async fn list(&self) -> KilnResult<Vec<ServerInstance>> {
        self.with_entries(|entries| {
            entries.retain(|e| {
                let alive = pid_alive(e.pid);
                if !alive {
                    debug!("Pruning dead server pid {} on port {}", e.pid, e.port);
                }
                alive
            });
            let mut live = entries.clone();
            live.sort_by_key(|e| e.port);
            live
        })
        .await
    }

    /// The live instance registered on `port`
    pub async fn find(&self, port: u16) -> KilnResult<Option<ServerInstance>> {
        Ok(self.list().await?.into_iter().find(|e| e.port == port))
    }
}

fn acquire(lock_path: &Path) -> KilnResult<RegistryLock> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| KilnError::RegistryLock(format!("{}: {}", parent.display(), e)))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)
        .map_err(|e| KilnError::RegistryLock(format!("{}: {}", lock_path.display(), e)))?;
    FileExt::lock_exclusive(&file)
        .map_err(|e| KilnError::RegistryLock(format!("{}: {}", lock_path.display(), e)))?;

    Ok(RegistryLock { file })
}

fn read_entries(path: &Path) -> Vec<ServerInstance> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    serde_json::from_str(&content).unwrap_or_else(|e| {
        warn!("Ignoring corrupt registry {}: {}", path.display(), e);
        Vec::new()
    })
}

fn write_entries(path: &Path, entries: &[ServerInstance]) -> KilnResult<()> {
    let content = serde_json::to_string_pretty(entries)?;
    let tmp = path.with_extension(format!("json.tmp-{}", std::process::id()));
    fs::write(&tmp, content)
        .map_err(|e| KilnError::io(format!("writing registry {}", tmp.display()), e))?;
    fs::rename(&tmp, path)
        .map_err(|e| KilnError::io(format!("replacing registry {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn instance(pid: u32, port: u16) -> ServerInstance {
        ServerInstance {
            pid,
            port,
            started_at: Utc::now(),
            compiler: "cc".to_string(),
            idle_timeout_secs: 600,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    #[tokio::test]
    async fn register_and_list() {
        let temp = TempDir::new().unwrap();
        let registry = Registry::new(temp.path().join("servers.json"));

        registry.register(instance(std::process::id(), 17001)).await.unwrap();
        registry.register(instance(std::process::id(), 17002)).await.unwrap();

        let live = registry.list().await.unwrap();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].port, 17001);
        assert!(registry.find(17002).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn same_port_replaces_entry() {
        let temp = TempDir::new().unwrap();
        let registry = Registry::new(temp.path().join("servers.json"));

        registry.register(instance(std::process::id(), 17001)).await.unwrap();
        registry.register(instance(std::process::id(), 17001)).await.unwrap();

        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deregister_removes_entry() {
        let temp = TempDir::new().unwrap();
        let registry = Registry::new(temp.path().join("servers.json"));

        registry.register(instance(std::process::id(), 17001)).await.unwrap();
        registry.deregister(17001, std::process::id()).await.unwrap();

        assert!(registry.list().await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dead_pids_pruned() {
        let temp = TempDir::new().unwrap();
        let registry = Registry::new(temp.path().join("servers.json"));

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        registry.register(instance(dead_pid, 17001)).await.unwrap();
        registry.register(instance(std::process::id(), 17002)).await.unwrap();

        let live = registry.list().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].port, 17002);

        let stored: Vec<ServerInstance> =
            serde_json::from_str(&fs::read_to_string(registry.path()).unwrap()).unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_registry_treated_as_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("servers.json");
        fs::write(&path, "{broken").unwrap();
        let registry = Registry::new(path);

        assert!(registry.list().await.unwrap().is_empty());
    }

    #[test]
    fn own_process_alive() {
        assert!(pid_alive(std::process::id()));
    }
}
