//! The installed-plugins manifest (`<pluginsRoot>/plugins.yaml`).
//!
//! Treated as a single-table key-value store keyed by plugin name. Every
//! mutation is a read-modify-write performed under a process-local mutex
//! and committed with an atomic rename, so readers never observe a partial
//! file. Cross-process exclusion is the caller's job (see `lock.rs`).

use crate::error::{PluginError, Result};
use crate::paths;
use crate::types::InstalledPluginRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifestFile {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub plugins: BTreeMap<String, InstalledPluginRecord>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl Default for PluginManifestFile {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            plugins: BTreeMap::new(),
        }
    }
}

impl PluginManifestFile {
    pub fn get(&self, name: &str) -> Option<&InstalledPluginRecord> {
        self.plugins.get(name)
    }

    /// Insert or replace the record keyed by its name.
    pub fn upsert(&mut self, record: InstalledPluginRecord) {
        self.plugins.insert(record.name.clone(), record);
    }

    pub fn remove(&mut self, name: &str) -> Option<InstalledPluginRecord> {
        self.plugins.remove(name)
    }

    /// Records in registration order: oldest install first, ties by name.
    pub fn records_by_install_time(&self) -> Vec<&InstalledPluginRecord> {
        let mut records: Vec<&InstalledPluginRecord> = self.plugins.values().collect();
        records.sort_by(|a, b| {
            a.installed_at
                .cmp(&b.installed_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        records
    }
}

// ---------------------------------------------------------------------------
// ManifestStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ManifestStore {
    path: PathBuf,
    write_guard: Mutex<()>,
}

impl ManifestStore {
    pub fn new(plugins_root: &Path) -> Self {
        Self {
            path: paths::manifest_path(plugins_root),
            write_guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty manifest.
    pub fn load(&self) -> Result<PluginManifestFile> {
        if !self.path.exists() {
            return Ok(PluginManifestFile::default());
        }
        let data = std::fs::read_to_string(&self.path)?;
        let manifest: PluginManifestFile = serde_yaml::from_str(&data)?;
        if manifest.schema_version > SCHEMA_VERSION {
            return Err(PluginError::Validation(format!(
                "{} has schema version {}, this xaheen understands up to {}",
                self.path.display(),
                manifest.schema_version,
                SCHEMA_VERSION
            )));
        }
        Ok(manifest)
    }

    /// Read-modify-write. The file is rewritten only when `f` succeeds.
    pub fn update<T>(&self, f: impl FnOnce(&mut PluginManifestFile) -> Result<T>) -> Result<T> {
        let _guard = self
            .write_guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut manifest = self.load()?;
        let out = f(&mut manifest)?;
        manifest.schema_version = SCHEMA_VERSION;
        let data = serde_yaml::to_string(&manifest)?;
        crate::io::atomic_write(&self.path, data.as_bytes())?;
        Ok(out)
    }
}
