//! External packages
//!
//! Packages live in a local store laid out as
//! `{store}/<name>/<version>/kiln-package.json` plus the library files the
//! manifest lists. A package already present in the store is reused without
//! contacting the registry.

use crate::error::{KilnError, KilnResult};
use crate::resolve::unit::content_hash;
use async_trait::async_trait;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Manifest file written next to an installed package's files
pub const MANIFEST_FILE: &str = "kiln-package.json";

/// Manifest of an installed package
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageManifest {
    pub name: String,
    pub version: String,
    /// File names relative to the version directory
    pub files: Vec<String>,
}

/// A package available on disk
#[derive(Debug, Clone)]
pub struct InstalledPackage {
    pub name: String,
    pub version: Version,
    pub files: Vec<PathBuf>,
}

/// On-disk package store
#[derive(Debug, Clone)]
pub struct PackageStore {
    root: PathBuf,
}

impl PackageStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one version of a package
    pub fn version_dir(&self, name: &str, version: &Version) -> PathBuf {
        self.root.join(name).join(version.to_string())
    }

    /// Highest installed version matching `requirement` whose files all exist
    pub fn find_installed(&self, name: &str, requirement: &VersionReq) -> Option<InstalledPackage> {
        let entries = std::fs::read_dir(self.root.join(name)).ok()?;

        let mut best: Option<InstalledPackage> = None;
        for entry in entries.flatten() {
            let Some(version) = entry
                .file_name()
                .to_str()
                .and_then(|v| Version::parse(v).ok())
            else {
                continue;
            };
            if !requirement.matches(&version) {
                continue;
            }
            if best.as_ref().is_some_and(|b| b.version >= version) {
                continue;
            }

            let dir = entry.path();
            let Some(manifest) = read_manifest(&dir) else {
                continue;
            };
            let files: Vec<PathBuf> = manifest.files.iter().map(|f| dir.join(f)).collect();
            if files.iter().all(|f| f.is_file()) {
                best = Some(InstalledPackage {
                    name: name.to_string(),
                    version,
                    files,
                });
            }
        }

        best
    }

    /// Move a fully downloaded staging directory into place
    pub fn commit(
        &self,
        staging: &Path,
        name: &str,
        version: &Version,
        files: Vec<String>,
    ) -> KilnResult<InstalledPackage> {
        let manifest = PackageManifest {
            name: name.to_string(),
            version: version.to_string(),
            files: files.clone(),
        };
        let content = serde_json::to_string_pretty(&manifest)?;
        std::fs::write(staging.join(MANIFEST_FILE), content)
            .map_err(|e| KilnError::io(format!("writing manifest for {}", name), e))?;

        let target = self.version_dir(name, version);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| KilnError::io(format!("creating {}", parent.display()), e))?;
        }
        if target.exists() {
            std::fs::remove_dir_all(&target)
                .map_err(|e| KilnError::io(format!("replacing {}", target.display()), e))?;
        }
        std::fs::rename(staging, &target)
            .map_err(|e| KilnError::io(format!("installing {}", target.display()), e))?;

        Ok(InstalledPackage {
            name: name.to_string(),
            version: version.clone(),
            files: files.iter().map(|f| target.join(f)).collect(),
        })
    }
}

/// Remove a half-downloaded package; failures are logged and dropped
fn discard_staging(staging: &Path) {
    if let Err(e) = std::fs::remove_dir_all(staging) {
        warn!("Failed to remove {}: {}", staging.display(), e);
    }
}

fn read_manifest(dir: &Path) -> Option<PackageManifest> {
    let content = std::fs::read_to_string(dir.join(MANIFEST_FILE)).ok()?;
    serde_json::from_str(&content).ok()
}

/// Parse an optional version requirement (`None` matches any version)
pub fn parse_requirement(name: &str, requirement: Option<&str>) -> KilnResult<VersionReq> {
    match requirement {
        None => Ok(VersionReq::STAR),
        Some(req) => VersionReq::parse(req).map_err(|e| {
            KilnError::User(format!(
                "Invalid version requirement '{}' for package {}: {}",
                req, name, e
            ))
        }),
    }
}

/// Source of packages that are not yet in the store
#[async_trait]
pub trait PackageFetcher: Send + Sync {
    /// Download the best version matching `requirement` into `store`.
    ///
    /// Must return `PackageNotFound` when the registry has no match and
    /// `PackageFetch` for transport failures.
    async fn fetch(
        &self,
        name: &str,
        requirement: &VersionReq,
        store: &PackageStore,
    ) -> KilnResult<InstalledPackage>;
}

/// Registry index served at `{base}/<name>/index.json`
#[derive(Debug, Clone, Deserialize)]
struct RegistryIndex {
    versions: Vec<RegistryVersion>,
}

#[derive(Debug, Clone, Deserialize)]
struct RegistryVersion {
    version: String,
    files: Vec<RegistryFile>,
}

#[derive(Debug, Clone, Deserialize)]
struct RegistryFile {
    name: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    sha256: Option<String>,
}

/// Fetches packages from a static HTTP registry
#[derive(Debug, Clone)]
pub struct RegistryFetcher {
    base_url: String,
    timeout: Duration,
}

impl RegistryFetcher {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn agent(&self) -> ureq::Agent {
        ureq::Agent::config_builder()
            .timeout_global(Some(self.timeout))
            .build()
            .into()
    }

    fn fetch_blocking(
        &self,
        name: &str,
        requirement: &VersionReq,
        store: &PackageStore,
    ) -> KilnResult<InstalledPackage> {
        let agent = self.agent();
        let index_url = format!("{}/{}/index.json", self.base_url, name);
        debug!("Fetching package index {}", index_url);

        let not_found = || KilnError::PackageNotFound {
            name: name.to_string(),
            requirement: requirement.to_string(),
        };
        let fetch_error = |reason: String| KilnError::PackageFetch {
            name: name.to_string(),
            reason,
        };

        let mut response = match agent.get(&index_url).call() {
            Ok(response) => response,
            Err(ureq::Error::StatusCode(404)) => return Err(not_found()),
            Err(e) => return Err(fetch_error(e.to_string())),
        };
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| fetch_error(e.to_string()))?;
        let index: RegistryIndex = serde_json::from_str(&body)
            .map_err(|e| fetch_error(format!("invalid index: {}", e)))?;

        let (version, entry) = index
            .versions
            .iter()
            .filter_map(|v| Version::parse(&v.version).ok().map(|parsed| (parsed, v)))
            .filter(|(parsed, _)| requirement.matches(parsed))
            .max_by(|a, b| a.0.cmp(&b.0))
            .ok_or_else(not_found)?;

        let name_dir = store.root().join(name);
        std::fs::create_dir_all(&name_dir)
            .map_err(|e| KilnError::io(format!("creating {}", name_dir.display()), e))?;
        let staging = name_dir.join(format!(".{}.tmp-{}", version, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&staging)
            .map_err(|e| KilnError::io(format!("creating {}", staging.display()), e))?;

        let result = self.download_files(&agent, name, &version, &entry.files, &staging);
        match result {
            Ok(files) => {
                info!("Installed package {} {}", name, version);
                store.commit(&staging, name, &version, files)
            }
            Err(e) => {
                discard_staging(&staging);
                Err(e)
            }
        }
    }

    fn download_files(
        &self,
        agent: &ureq::Agent,
        name: &str,
        version: &Version,
        files: &[RegistryFile],
        staging: &Path,
    ) -> KilnResult<Vec<String>> {
        let mut names = Vec::with_capacity(files.len());

        for file in files {
            if file.name.contains('/') || file.name.contains('\\') || file.name.contains("..") {
                return Err(KilnError::PackageFetch {
                    name: name.to_string(),
                    reason: format!("invalid file name in index: {}", file.name),
                });
            }
            let url = file.url.clone().unwrap_or_else(|| {
                format!("{}/{}/{}/{}", self.base_url, name, version, file.name)
            });
            debug!("Downloading {}", url);

            let bytes = agent
                .get(&url)
                .call()
                .and_then(|mut r| r.body_mut().with_config().limit(u64::MAX).read_to_vec())
                .map_err(|e| KilnError::PackageFetch {
                    name: name.to_string(),
                    reason: format!("{}: {}", url, e),
                })?;

            if let Some(expected) = &file.sha256 {
                let actual = content_hash(&bytes);
                if !actual.eq_ignore_ascii_case(expected) {
                    return Err(KilnError::PackageFetch {
                        name: name.to_string(),
                        reason: format!("checksum mismatch for {}", file.name),
                    });
                }
            }

            let target = staging.join(&file.name);
            std::fs::write(&target, &bytes)
                .map_err(|e| KilnError::io(format!("writing {}", target.display()), e))?;
            names.push(file.name.clone());
        }

        Ok(names)
    }
}

#[async_trait]
impl PackageFetcher for RegistryFetcher {
    async fn fetch(
        &self,
        name: &str,
        requirement: &VersionReq,
        store: &PackageStore,
    ) -> KilnResult<InstalledPackage> {
        let fetcher = self.clone();
        let name = name.to_string();
        let requirement = requirement.clone();
        let store = store.clone();

        tokio::task::spawn_blocking(move || fetcher.fetch_blocking(&name, &requirement, &store))
            .await
            .map_err(|e| KilnError::Internal(format!("package fetch task failed: {}", e)))?
    }
}
