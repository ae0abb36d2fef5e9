//! Durable plugin installation under one plugins root.
//!
//! Layout:
//!   <pluginsRoot>/
//!     plugins.yaml          installed-plugins manifest
//!     .plugins.lock         cross-process lock (held by the caller)
//!     <name>/               unpacked plugin, with its own deps/
//!     .staging-XXXX/        in-flight install, removed on drop
//!     .trash-XXXX/<name>/   previous version during replacement
//!
//! A plugin directory and its manifest record change together or not at all:
//! the old directory is only discarded after the manifest write succeeded.

use crate::archive;
use crate::deps::{DependencyInstaller, ResolvedDependency};
use crate::error::{PluginError, Result};
use crate::io;
use crate::manifest::ManifestStore;
use crate::paths;
use crate::types::{InstalledPluginRecord, PackageManifest, PluginSource};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A validated, unpacked plugin waiting to be committed. Dropping it removes
/// the staging directory.
#[derive(Debug)]
pub struct StagedPlugin {
    dir: TempDir,
    pub manifest: PackageManifest,
}

impl StagedPlugin {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub source: PluginSource,
    pub forced: bool,
}

#[derive(Debug, Clone)]
pub struct Installed {
    pub record: InstalledPluginRecord,
    pub package: PackageManifest,
    pub dependencies: Vec<ResolvedDependency>,
    /// Record replaced by this install, if any.
    pub previous: Option<InstalledPluginRecord>,
}

#[derive(Debug, Clone)]
pub struct Uninstalled {
    pub record: InstalledPluginRecord,
    /// Set when the directory could not be deleted after the manifest
    /// already dropped the plugin.
    pub residual_warning: Option<String>,
}

#[derive(Debug)]
pub struct FilesystemInstaller {
    root: PathBuf,
    manifest: ManifestStore,
}

impl FilesystemInstaller {
    pub fn new(plugins_root: &Path) -> Self {
        Self {
            root: plugins_root.to_path_buf(),
            manifest: ManifestStore::new(plugins_root),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &ManifestStore {
        &self.manifest
    }

    /// Unpack `archive_path` into a fresh `.staging-*` directory and validate
    /// it as `name@version`.
    pub fn stage(&self, archive_path: &Path, name: &str, version: &str) -> Result<StagedPlugin> {
        io::ensure_dir(&self.root)?;
        let dir = tempfile::Builder::new()
            .prefix(paths::STAGING_PREFIX)
            .tempdir_in(&self.root)?;
        tracing::debug!(plugin = %name, %version, staging = %dir.path().display(), "staging");

        archive::unpack(archive_path, dir.path(), name, version)?;
        let manifest = archive::read_package_manifest(dir.path(), name, version)?;
        archive::validate_package(&manifest, dir.path(), name, version)?;
        Ok(StagedPlugin { dir, manifest })
    }

    /// Stage, run `preflight` against the package, install dependencies and
    /// commit. Any failure before the manifest write leaves the previous
    /// install (directory and record) exactly as it was.
    pub fn install(
        &self,
        archive_path: &Path,
        name: &str,
        version: &str,
        options: &InstallOptions,
        deps: &DependencyInstaller<'_>,
        preflight: impl FnOnce(&PackageManifest) -> Result<()>,
    ) -> Result<Installed> {
        let staged = self.stage(archive_path, name, version)?;
        preflight(&staged.manifest)?;
        let dependencies = deps.install(&staged.manifest, staged.path())?;
        self.commit(staged, options, dependencies)
    }

    /// Swap the staged directory into place and record it in the manifest.
    pub fn commit(
        &self,
        staged: StagedPlugin,
        options: &InstallOptions,
        dependencies: Vec<ResolvedDependency>,
    ) -> Result<Installed> {
        let name = staged.manifest.name.clone();
        let target = paths::plugin_dir(&self.root, &name);

        let trash = if target.exists() {
            let trash = tempfile::Builder::new()
                .prefix(paths::TRASH_PREFIX)
                .tempdir_in(&self.root)?;
            std::fs::rename(&target, trash.path().join(&name))?;
            Some(trash)
        } else {
            None
        };

        if let Err(e) = std::fs::rename(staged.path(), &target) {
            restore(trash.as_ref(), &name, &target);
            return Err(e.into());
        }

        let record = InstalledPluginRecord {
            name: name.clone(),
            version: staged.manifest.version.clone(),
            description: staged.manifest.description.clone(),
            install_path: target.clone(),
            installed_at: Utc::now(),
            commands: staged.manifest.command_names(),
            source: options.source,
            forced: options.forced,
            dependencies: dependencies.iter().map(ResolvedDependency::key).collect(),
        };
        let previous = match self
            .manifest
            .update(|m| Ok(m.plugins.insert(name.clone(), record.clone())))
        {
            Ok(previous) => previous,
            Err(e) => {
                if let Err(cleanup) = io::remove_dir_if_exists(&target) {
                    tracing::warn!(path = %target.display(), "rollback failed: {cleanup}");
                }
                restore(trash.as_ref(), &name, &target);
                return Err(e);
            }
        };

        if let Some(trash) = trash {
            let path = trash.path().to_path_buf();
            if let Err(e) = trash.close() {
                tracing::warn!(path = %path.display(), "failed to remove replaced plugin files: {e}");
            }
        }
        tracing::info!(plugin = %name, version = %record.version, "installed");
        Ok(Installed {
            record,
            package: staged.manifest,
            dependencies,
            previous,
        })
    }

    /// Drop `name` from the manifest, then delete its directory. Failing to
    /// delete is reported, not raised: the plugin is already uninstalled.
    pub fn uninstall(&self, name: &str) -> Result<Uninstalled> {
        let record = self.manifest.update(|m| {
            m.remove(name)
                .ok_or_else(|| PluginError::NotFound(format!("plugin {name} is not installed")))
        })?;

        let dir = paths::plugin_dir(&self.root, name);
        let residual_warning = match io::remove_dir_if_exists(&dir) {
            Ok(()) => None,
            Err(e) => {
                let warning = format!(
                    "{name} was uninstalled but {} could not be removed: {e}",
                    dir.display()
                );
                tracing::warn!("{warning}");
                Some(warning)
            }
        };
        tracing::info!(plugin = %name, "uninstalled");
        Ok(Uninstalled {
            record,
            residual_warning,
        })
    }

    /// Package manifest of an installed plugin, read from its directory.
    pub fn read_installed(&self, record: &InstalledPluginRecord) -> Result<PackageManifest> {
        archive::read_package_manifest(
            &paths::plugin_dir(&self.root, &record.name),
            &record.name,
            &record.version,
        )
    }

    /// Remove `.staging-*` and `.trash-*` directories left by interrupted
    /// operations. Must only run while holding the plugins lock.
    pub fn sweep_orphans(&self) -> Result<usize> {
        let read = match std::fs::read_dir(&self.root) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut swept = 0;
        for item in read {
            let item = item?;
            let file_name = item.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let orphan = file_name.starts_with(paths::STAGING_PREFIX)
                || file_name.starts_with(paths::TRASH_PREFIX);
            if orphan && item.file_type()?.is_dir() {
                tracing::debug!(path = %item.path().display(), "sweeping orphan");
                io::remove_dir_if_exists(&item.path())?;
                swept += 1;
            }
        }
        Ok(swept)
    }
}

/// Put the previous plugin directory back after a failed swap.
fn restore(trash: Option<&TempDir>, name: &str, target: &Path) {
    let Some(trash) = trash else {
        return;
    };
    if let Err(e) = std::fs::rename(trash.path().join(name), target) {
        tracing::warn!(
            plugin = %name,
            "failed to restore previous install from {}: {e}",
            trash.path().display()
        );
    }
}
