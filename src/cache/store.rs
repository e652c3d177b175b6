//! On-disk artifact store
//!
//! Each entry is a directory named after the fingerprint prefix holding the
//! artifact and a `kiln-cache.json` sidecar:
//!
//! ```text
//! {cache_root}/
//!   3f9a0c1d2e4b5a69/
//!     hello            artifact
//!     kiln-cache.json  sidecar
//!   3f9a0c1d2e4b5a69.tmp-<uuid>/   build in progress
//! ```
//!
//! Entries are written once. A build stages into a temporary sibling which is
//! renamed over the entry directory only after the sidecar is in place.

use crate::cache::fingerprint::short;
use crate::diagnostic::Diagnostic;
use crate::error::{KilnError, KilnResult};
use crate::resolve::CompilationUnit;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Sidecar file name inside an entry directory
pub const SIDECAR_FILE: &str = "kiln-cache.json";

/// Marker in staging directory names
const STAGING_MARKER: &str = ".tmp-";

/// Kind of a recorded input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Source,
    Reference,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Reference => write!(f, "reference"),
        }
    }
}

/// One file that went into a build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInput {
    pub kind: InputKind,
    pub path: PathBuf,
    pub hash: String,
    pub modified: DateTime<Utc>,
}

/// Sidecar metadata for a cached artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub primary: PathBuf,
    pub mode: String,
    pub backend: String,
    pub compiled_at: DateTime<Utc>,
    /// Artifact file name within the entry directory
    pub artifact: String,
    pub inputs: Vec<CacheInput>,
    pub args: Vec<String>,
    /// Compiler warnings emitted by the successful build
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

impl CacheEntry {
    /// Describe a unit that was just compiled
    pub fn for_unit(
        unit: &CompilationUnit,
        fingerprint: &str,
        backend: &str,
        artifact: &str,
        diagnostics: Vec<Diagnostic>,
    ) -> Self {
        let sources = unit.sources.iter().map(|s| CacheInput {
            kind: InputKind::Source,
            path: s.path.clone(),
            hash: s.hash.clone(),
            modified: s.modified,
        });
        let references = unit.references.iter().map(|r| CacheInput {
            kind: InputKind::Reference,
            path: r.path.clone(),
            hash: r.hash.clone(),
            modified: r.modified,
        });

        Self {
            fingerprint: fingerprint.to_string(),
            primary: unit.primary.clone(),
            mode: unit.mode().to_string(),
            backend: backend.to_string(),
            compiled_at: Utc::now(),
            artifact: artifact.to_string(),
            inputs: sources.chain(references).collect(),
            args: unit.compiler_args.clone(),
            diagnostics,
        }
    }

    /// Whether any input changed on disk after the entry was compiled
    fn inputs_newer(&self) -> bool {
        self.inputs.iter().any(|input| {
            match fs::metadata(&input.path).and_then(|m| m.modified()) {
                Ok(modified) => DateTime::<Utc>::from(modified) > self.compiled_at,
                Err(_) => true,
            }
        })
    }
}

/// A cache entry found on disk, with its location
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub dir: PathBuf,
    pub entry: CacheEntry,
    pub size_bytes: u64,
}

impl StoredEntry {
    pub fn artifact_path(&self) -> PathBuf {
        self.dir.join(&self.entry.artifact)
    }
}

/// Filesystem-backed artifact store rooted at the cache directory
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root and verify it is writable
    pub fn ensure_usable(&self) -> KilnResult<()> {
        let unusable = |e: std::io::Error| KilnError::CacheIo {
            path: self.root.clone(),
            reason: e.to_string(),
        };

        fs::create_dir_all(&self.root).map_err(unusable)?;
        let probe = self.root.join(format!(".probe-{}", uuid::Uuid::new_v4()));
        fs::write(&probe, b"").map_err(unusable)?;
        fs::remove_file(&probe).map_err(unusable)?;
        Ok(())
    }

    /// Entry directory for a fingerprint
    pub fn entry_dir(&self, fingerprint: &str) -> PathBuf {
        self.root.join(short(fingerprint))
    }

    /// Return the entry for `fingerprint` when it is still valid.
    ///
    /// A hit requires the full fingerprint to match the sidecar, the artifact
    /// to exist and no input to be modified after the entry was compiled.
    pub fn lookup(&self, fingerprint: &str) -> Option<StoredEntry> {
        let dir = self.entry_dir(fingerprint);
        let entry = read_sidecar(&dir)?;

        if entry.fingerprint != fingerprint {
            debug!("Cache prefix collision at {}", dir.display());
            return None;
        }
        if !dir.join(&entry.artifact).is_file() {
            debug!("Cache entry {} lost its artifact", short(fingerprint));
            return None;
        }
        if entry.inputs_newer() {
            debug!("Cache entry {} has newer inputs", short(fingerprint));
            return None;
        }

        Some(StoredEntry {
            size_bytes: dir_size(&dir),
            dir,
            entry,
        })
    }

    /// Create a fresh staging directory for a build
    pub fn stage(&self, fingerprint: &str) -> KilnResult<PathBuf> {
        let staging = self.root.join(format!(
            "{}{}{}",
            short(fingerprint),
            STAGING_MARKER,
            uuid::Uuid::new_v4()
        ));
        fs::create_dir_all(&staging).map_err(|e| KilnError::CacheIo {
            path: staging.clone(),
            reason: e.to_string(),
        })?;
        Ok(staging)
    }

    /// Write the sidecar and move a staging directory into place
    pub fn commit(&self, staging: &Path, entry: &CacheEntry) -> KilnResult<StoredEntry> {
        let cache_io = |path: &Path, e: std::io::Error| KilnError::CacheIo {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        let content = serde_json::to_string_pretty(entry)?;
        let sidecar = staging.join(SIDECAR_FILE);
        fs::write(&sidecar, content).map_err(|e| cache_io(&sidecar, e))?;

        let dir = self.entry_dir(&entry.fingerprint);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| cache_io(&dir, e))?;
        }
        fs::rename(staging, &dir).map_err(|e| cache_io(&dir, e))?;

        debug!("Cached {} at {}", entry.primary.display(), dir.display());
        Ok(StoredEntry {
            size_bytes: dir_size(&dir),
            dir,
            entry: entry.clone(),
        })
    }

    /// Remove a staging directory, logging failures
    pub fn discard(&self, staging: &Path) {
        if let Err(e) = fs::remove_dir_all(staging) {
            warn!("Failed to remove staging dir {}: {}", staging.display(), e);
        }
    }

    /// All readable entries, newest first
    pub fn list_entries(&self) -> KilnResult<Vec<StoredEntry>> {
        let reader = match fs::read_dir(&self.root) {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(KilnError::io(
                    format!("reading cache dir {}", self.root.display()),
                    e,
                ))
            }
        };

        let mut entries: Vec<StoredEntry> = reader
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir() && !is_staging(p))
            .filter_map(|dir| {
                let entry = read_sidecar(&dir)?;
                Some(StoredEntry {
                    size_bytes: dir_size(&dir),
                    dir,
                    entry,
                })
            })
            .collect();

        entries.sort_by(|a, b| b.entry.compiled_at.cmp(&a.entry.compiled_at));
        Ok(entries)
    }

    /// Delete every entry and leftover staging directory, returning how many
    /// entries were removed. Precompiler output is cleared as well.
    pub fn clear(&self) -> KilnResult<usize> {
        let reader = match fs::read_dir(&self.root) {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(KilnError::io(
                    format!("reading cache dir {}", self.root.display()),
                    e,
                ))
            }
        };

        let mut removed = 0;
        for path in reader.flatten().map(|e| e.path()).filter(|p| p.is_dir()) {
            let counted = !is_staging(&path) && path.join(SIDECAR_FILE).is_file();
            match fs::remove_dir_all(&path) {
                Ok(()) if counted => removed += 1,
                Ok(()) => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
        Ok(removed)
    }
}

fn is_staging(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.contains(STAGING_MARKER))
}

fn read_sidecar(dir: &Path) -> Option<CacheEntry> {
    let content = fs::read_to_string(dir.join(SIDECAR_FILE)).ok()?;
    match serde_json::from_str(&content) {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!("Ignoring unreadable cache sidecar in {}: {}", dir.display(), e);
            None
        }
    }
}

fn dir_size(dir: &Path) -> u64 {
    fs::read_dir(dir)
        .map(|reader| {
            reader
                .flatten()
                .filter_map(|e| e.metadata().ok())
                .filter(|m| m.is_file())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0)
}

/// Format bytes as human-readable size (e.g., "1.5 MB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FP: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn entry(source: &Path) -> CacheEntry {
        CacheEntry {
            fingerprint: FP.to_string(),
            primary: source.to_path_buf(),
            mode: "debug".to_string(),
            backend: "cc".to_string(),
            compiled_at: Utc::now() + chrono::Duration::seconds(5),
            artifact: "main".to_string(),
            inputs: vec![CacheInput {
                kind: InputKind::Source,
                path: source.to_path_buf(),
                hash: "h".to_string(),
                modified: Utc::now(),
            }],
            args: vec![],
            diagnostics: vec![],
        }
    }

    fn committed(temp: &TempDir) -> (CacheStore, PathBuf) {
        let source = temp.path().join("main.c");
        fs::write(&source, "int main(){}").unwrap();

        let store = CacheStore::new(temp.path().join("cache"));
        store.ensure_usable().unwrap();
        let staging = store.stage(FP).unwrap();
        fs::write(staging.join("main"), b"binary").unwrap();
        store.commit(&staging, &entry(&source)).unwrap();
        (store, source)
    }

    #[test]
    fn commit_then_lookup() {
        let temp = TempDir::new().unwrap();
        let (store, _) = committed(&temp);

        let hit = store.lookup(FP).unwrap();
        assert!(hit.artifact_path().is_file());
        assert_eq!(hit.dir, store.root().join(&FP[..16]));
        assert!(hit.size_bytes > 0);
    }

    #[test]
    fn prefix_collision_is_miss() {
        let temp = TempDir::new().unwrap();
        let (store, _) = committed(&temp);

        let other = format!("{}ffff", &FP[..60]);
        assert!(store.lookup(&other).is_none());
    }

    #[test]
    fn missing_artifact_is_miss() {
        let temp = TempDir::new().unwrap();
        let (store, _) = committed(&temp);

        fs::remove_file(store.entry_dir(FP).join("main")).unwrap();
        assert!(store.lookup(FP).is_none());
    }

    #[test]
    fn deleted_input_is_miss() {
        let temp = TempDir::new().unwrap();
        let (store, source) = committed(&temp);

        fs::remove_file(source).unwrap();
        assert!(store.lookup(FP).is_none());
    }

    #[test]
    fn list_skips_staging_and_clear_removes_all() {
        let temp = TempDir::new().unwrap();
        let (store, _) = committed(&temp);
        let leftover = store.stage(FP).unwrap();

        let entries = store.list_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry.fingerprint, FP);

        assert_eq!(store.clear().unwrap(), 1);
        assert!(!leftover.exists());
        assert!(store.list_entries().unwrap().is_empty());
    }

    #[test]
    fn list_missing_root_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::new(temp.path().join("nope"));
        assert!(store.list_entries().unwrap().is_empty());
        assert_eq!(store.clear().unwrap(), 0);
    }

    #[test]
    fn unusable_root_reported() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("file");
        fs::write(&file, "").unwrap();

        let store = CacheStore::new(file.join("cache"));
        assert!(matches!(
            store.ensure_usable(),
            Err(KilnError::CacheIo { .. })
        ));
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
