//! Plugin lifecycle orchestration.
//!
//! A `PluginManager` targets one plugins root (local or global) for mutating
//! operations, while its command registry reflects both roots. Every
//! mutating operation holds the cross-process plugins lock for its whole
//! duration and starts by sweeping leftovers of interrupted runs.
//!
//! Batch installs resolve every request first, then fetch archives on a
//! bounded set of worker threads, then commit one plugin at a time.

use crate::archive;
use crate::cache::{FetchSource, Fetched, PackageCache};
use crate::commands::{CommandDescriptor, CommandRegistry};
use crate::compat;
use crate::config::{
    validate_registry_url, ConfigWarning, PluginConfig, PluginScope, RegistrySettings,
};
use crate::deps::DependencyInstaller;
use crate::error::{PluginError, Result};
use crate::installer::{FilesystemInstaller, InstallOptions};
use crate::lock::PluginsLock;
use crate::paths;
use crate::registry::RegistryClient;
use crate::types::{
    InstalledPluginRecord, PluginMetadata, PluginRequest, PluginSource, RegistryHealth,
    RegistryStats, SearchFilters, VersionSelector,
};
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Cache temp files younger than this may belong to a concurrent download.
const TEMP_FILE_GRACE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, Default)]
pub struct InstallFlags {
    /// Downgrade incompatibility and command conflicts to warnings.
    pub force: bool,
    /// Re-download archives even when cached.
    pub refresh: bool,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct InstalledPlugin {
    pub name: String,
    pub version: String,
    pub previous_version: Option<String>,
    pub source: PluginSource,
    pub forced: bool,
    pub commands: Vec<String>,
    pub dependencies: Vec<String>,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallReport {
    pub installed: Vec<InstalledPlugin>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateReport {
    pub updated: Vec<InstalledPlugin>,
    pub up_to_date: Vec<String>,
    pub skipped: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveReport {
    pub name: String,
    pub version: String,
    pub commands: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub installed: Option<InstalledPluginRecord>,
    pub metadata: Option<PluginMetadata>,
    pub active_commands: Vec<String>,
    pub update_available: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheClearReport {
    pub packages: usize,
    pub searches: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryConfigView {
    pub registry_url: String,
    pub api_key_configured: bool,
    pub timeout_secs: u64,
    pub search_cache_ttl_secs: u64,
    pub settings_file: PathBuf,
    pub cache_dir: PathBuf,
    pub local_plugins_dir: PathBuf,
    pub global_plugins_dir: PathBuf,
    pub warnings: Vec<ConfigWarning>,
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum ArchiveSource {
    Remote(PluginMetadata),
    Local(PathBuf),
}

#[derive(Debug)]
struct Plan {
    name: String,
    version: String,
    source: PluginSource,
    forced: bool,
    previous_version: Option<String>,
    archive: ArchiveSource,
}

/// `<name>` arguments that point at an archive on disk rather than the
/// registry.
fn is_archive_path(spec: &str) -> bool {
    spec.ends_with(".tgz")
        || spec.ends_with(".tar.gz")
        || spec.contains(std::path::MAIN_SEPARATOR)
        || spec.contains('/')
}

// ---------------------------------------------------------------------------
// PluginManager
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PluginManager {
    config: PluginConfig,
    scope: PluginScope,
    host_version: String,
    registry: RegistryClient,
    cache: PackageCache,
    installer: FilesystemInstaller,
    commands: CommandRegistry,
}

impl PluginManager {
    pub fn new(config: PluginConfig, scope: PluginScope, host_version: &str) -> Result<Self> {
        compat::parse_version(host_version)?;
        let registry = RegistryClient::new(&config)?;
        let cache = PackageCache::new(&config.cache_dir);
        let installer = FilesystemInstaller::new(config.plugins_root(scope));
        Ok(Self {
            config,
            scope,
            host_version: host_version.to_string(),
            registry,
            cache,
            installer,
            commands: CommandRegistry::new(),
        })
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn scope(&self) -> PluginScope {
        self.scope
    }

    pub fn host_version(&self) -> &str {
        &self.host_version
    }

    pub fn plugins_root(&self) -> &Path {
        self.installer.root()
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    /// Hand the live command surface to the dispatcher.
    pub fn into_commands(self) -> CommandRegistry {
        self.commands
    }

    /// Register the commands of every installed plugin, global root first,
    /// then local, each in install order. Conflicts and unreadable plugins
    /// are skipped with a warning so one broken plugin cannot take the CLI
    /// down.
    pub fn activate_installed(&mut self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();
        let mut roots = vec![self.config.global_plugins_dir.clone()];
        if self.config.local_plugins_dir != self.config.global_plugins_dir {
            roots.push(self.config.local_plugins_dir.clone());
        }
        for root in roots {
            let installer = FilesystemInstaller::new(&root);
            let manifest = match installer.manifest().load() {
                Ok(manifest) => manifest,
                Err(e) => {
                    warnings.push(format!(
                        "ignoring {}: {e}",
                        installer.manifest().path().display()
                    ));
                    continue;
                }
            };
            for record in manifest.records_by_install_time() {
                let package = match installer.read_installed(record) {
                    Ok(package) => package,
                    Err(e) => {
                        warnings.push(format!("plugin {} is not loadable: {e}", record.name));
                        continue;
                    }
                };
                let dir = paths::plugin_dir(installer.root(), &record.name);
                let descriptors = CommandDescriptor::from_package(&package, &dir);
                warnings.extend(self.commands.register(&record.name, descriptors, true)?);
            }
        }
        tracing::debug!(commands = self.commands.len(), "activated plugin commands");
        Ok(warnings)
    }

    fn lock(&self) -> Result<PluginsLock> {
        let lock = PluginsLock::acquire(
            &paths::lock_path(self.installer.root()),
            self.config.lock_timeout,
        )?;
        let swept = self.installer.sweep_orphans()?;
        if swept > 0 {
            tracing::info!(swept, "removed leftovers of interrupted operations");
        }
        if let Err(e) = self.cache.sweep_temp_files(TEMP_FILE_GRACE) {
            tracing::warn!("failed to sweep cache temp files: {e}");
        }
        Ok(lock)
    }

    fn registry_source(&self) -> PluginSource {
        match self.scope {
            PluginScope::Local => PluginSource::Registry,
            PluginScope::Global => PluginSource::Global,
        }
    }

    // -----------------------------------------------------------------------
    // Install
    // -----------------------------------------------------------------------

    /// Install one or more `name[@version]` requests (or local archive paths).
    pub fn install(&mut self, specs: &[String], flags: InstallFlags) -> Result<InstallReport> {
        if specs.is_empty() {
            return Err(PluginError::Validation(
                "no plugins given to install".to_string(),
            ));
        }
        let _lock = self.lock()?;

        let mut warnings = Vec::new();
        let mut plans = Vec::new();
        let mut seen = BTreeSet::new();
        for spec in specs {
            let plan = self.plan_install(spec, flags.force, &mut warnings)?;
            if !seen.insert(plan.name.clone()) {
                return Err(PluginError::Validation(format!(
                    "{} is requested more than once",
                    plan.name
                )));
            }
            plans.push(plan);
        }

        let installed = self.execute(plans, flags, &mut warnings)?;
        Ok(InstallReport {
            installed,
            warnings,
        })
    }

    fn plan_install(&self, spec: &str, force: bool, warnings: &mut Vec<String>) -> Result<Plan> {
        if is_archive_path(spec) {
            let path = PathBuf::from(spec);
            if !path.is_file() {
                return Err(PluginError::NotFound(format!("plugin archive {spec}")));
            }
            let package = archive::peek_manifest(&path)?;
            paths::validate_plugin_name(&package.name)?;
            let compatibility = compat::check(
                &package.name,
                &package.version,
                package.host.as_deref(),
                &self.host_version,
                force,
            )?;
            let forced = compatibility.is_forced();
            if let compat::Compatibility::Forced { warning } = compatibility {
                warnings.push(warning);
            }
            return Ok(Plan {
                name: package.name,
                version: package.version,
                source: PluginSource::Local,
                forced,
                previous_version: None,
                archive: ArchiveSource::Local(path),
            });
        }

        let request = PluginRequest::parse(spec)?;
        let meta = self.resolve_metadata(&request)?;
        let compatibility = compat::check(
            &meta.name,
            &meta.version,
            meta.host.as_deref(),
            &self.host_version,
            force,
        )?;
        let forced = compatibility.is_forced();
        if let compat::Compatibility::Forced { warning } = compatibility {
            warnings.push(warning);
        }
        Ok(Plan {
            name: meta.name.clone(),
            version: meta.version.clone(),
            source: self.registry_source(),
            forced,
            previous_version: None,
            archive: ArchiveSource::Remote(meta),
        })
    }

    fn resolve_metadata(&self, request: &PluginRequest) -> Result<PluginMetadata> {
        match &request.version {
            VersionSelector::Latest => self.registry.get_metadata(&request.name, None),
            VersionSelector::Exact(v) => self
                .registry
                .get_metadata(&request.name, Some(&v.to_string())),
            VersionSelector::Range(req) => {
                let versions = self.registry.list_versions(&request.name)?;
                let version = compat::max_satisfying(req, &versions).ok_or_else(|| {
                    PluginError::NotFound(format!(
                        "no published version of {} satisfies {req}",
                        request.name
                    ))
                })?;
                self.registry
                    .get_metadata(&request.name, Some(&version.to_string()))
            }
        }
    }

    /// Fetch every remote archive, then commit plans in order. A failed
    /// fetch aborts the batch before anything is committed.
    fn execute(
        &mut self,
        plans: Vec<Plan>,
        flags: InstallFlags,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<InstalledPlugin>> {
        let remote: Vec<&PluginMetadata> = plans
            .iter()
            .filter_map(|p| match &p.archive {
                ArchiveSource::Remote(meta) => Some(meta),
                ArchiveSource::Local(_) => None,
            })
            .collect();
        let mut fetched = fetch_all(
            &self.registry,
            &self.cache,
            &remote,
            flags.refresh,
            self.config.max_parallel_fetches,
        )
        .into_iter();

        let mut archives = Vec::with_capacity(plans.len());
        for plan in &plans {
            let archive = match &plan.archive {
                ArchiveSource::Local(path) => (path.clone(), false),
                ArchiveSource::Remote(meta) => {
                    let result = fetched.next().unwrap_or_else(|| {
                        Err(PluginError::Validation(format!(
                            "no archive fetched for {}",
                            meta.key()
                        )))
                    })?;
                    (result.path, result.source == FetchSource::Cache)
                }
            };
            archives.push(archive);
        }

        let deps = DependencyInstaller::new(&self.registry, &self.cache, flags.refresh);
        let mut installed = Vec::with_capacity(plans.len());
        for (plan, (archive_path, from_cache)) in plans.into_iter().zip(archives) {
            let archive_path = match &plan.archive {
                ArchiveSource::Remote(meta) => self.ensure_archive(meta, archive_path)?,
                ArchiveSource::Local(_) => archive_path,
            };
            let commands = &self.commands;
            let outcome = self.installer.install(
                &archive_path,
                &plan.name,
                &plan.version,
                &InstallOptions {
                    source: plan.source,
                    forced: plan.forced,
                },
                &deps,
                |package| {
                    if flags.force {
                        return Ok(());
                    }
                    let names = package.commands.iter().map(|c| c.name.as_str());
                    match commands.conflicts(&package.name, names).into_iter().next() {
                        Some((command, owner)) => {
                            Err(PluginError::CommandConflict { command, owner })
                        }
                        None => Ok(()),
                    }
                },
            )?;

            let descriptors =
                CommandDescriptor::from_package(&outcome.package, &outcome.record.install_path);
            warnings.extend(self.commands.register(&plan.name, descriptors, flags.force)?);

            installed.push(InstalledPlugin {
                name: outcome.record.name.clone(),
                version: outcome.record.version.clone(),
                previous_version: plan
                    .previous_version
                    .or(outcome.previous.map(|p| p.version)),
                source: outcome.record.source,
                forced: outcome.record.forced,
                commands: outcome.record.commands.clone(),
                dependencies: outcome.record.dependencies.clone(),
                from_cache,
            });
        }
        Ok(installed)
    }

    /// The cache may be cleared by another process between fetch and commit;
    /// download the archive again in that case.
    fn ensure_archive(&self, meta: &PluginMetadata, path: PathBuf) -> Result<PathBuf> {
        if path.is_file() {
            return Ok(path);
        }
        tracing::warn!(key = %meta.key(), "cached archive disappeared, fetching again");
        Ok(self.cache.fetch(&self.registry, meta, true)?.path)
    }

    // -----------------------------------------------------------------------
    // Update
    // -----------------------------------------------------------------------

    /// Move `name` (or every plugin) to the latest compatible version. When
    /// updating everything, incompatible or locally installed plugins are
    /// skipped with a warning; naming one turns that into an error.
    pub fn update(&mut self, name: Option<&str>, flags: InstallFlags) -> Result<UpdateReport> {
        let _lock = self.lock()?;
        let manifest = self.installer.manifest().load()?;
        let records: Vec<InstalledPluginRecord> = match name {
            Some(n) => {
                paths::validate_plugin_name(n)?;
                vec![manifest
                    .get(n)
                    .cloned()
                    .ok_or_else(|| PluginError::NotFound(format!("plugin {n} is not installed")))?]
            }
            None => manifest.plugins.into_values().collect(),
        };

        let mut report = UpdateReport::default();
        let mut plans = Vec::new();
        for record in records {
            if record.source == PluginSource::Local {
                let msg = format!(
                    "{} was installed from a local archive; install a newer archive to update it",
                    record.name
                );
                if name.is_some() {
                    return Err(PluginError::Validation(msg));
                }
                report.skipped.push(record.name);
                report.warnings.push(msg);
                continue;
            }

            let meta = self.registry.get_metadata(&record.name, None)?;
            let latest = compat::parse_version(&meta.version)?;
            let newer = compat::parse_version(&record.version)
                .map(|current| latest > current)
                .unwrap_or(true);
            if !newer {
                report.up_to_date.push(record.name);
                continue;
            }

            match compat::check(
                &meta.name,
                &meta.version,
                meta.host.as_deref(),
                &self.host_version,
                flags.force,
            ) {
                Ok(compatibility) => {
                    let forced = compatibility.is_forced();
                    if let compat::Compatibility::Forced { warning } = compatibility {
                        report.warnings.push(warning);
                    }
                    plans.push(Plan {
                        name: record.name,
                        version: meta.version.clone(),
                        source: record.source,
                        forced,
                        previous_version: Some(record.version),
                        archive: ArchiveSource::Remote(meta),
                    });
                }
                Err(e @ PluginError::IncompatibleVersion { .. }) if name.is_none() => {
                    report
                        .warnings
                        .push(format!("not updating {}: {e}", record.name));
                    report.skipped.push(record.name);
                }
                Err(e) => return Err(e),
            }
        }

        report.updated = self.execute(plans, flags, &mut report.warnings)?;
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Remove
    // -----------------------------------------------------------------------

    /// Uninstall `name`. Commands are deregistered before anything on disk
    /// changes. `confirmed` must be set by the caller (`--yes`, `--force` or
    /// an interactive prompt).
    pub fn remove(&mut self, name: &str, confirmed: bool) -> Result<RemoveReport> {
        paths::validate_plugin_name(name)?;
        if !confirmed {
            return Err(PluginError::ConfirmationRequired(format!(
                "remove plugin {name}"
            )));
        }
        let _lock = self.lock()?;
        let record = self
            .installer
            .manifest()
            .load()?
            .plugins
            .remove(name)
            .ok_or_else(|| PluginError::NotFound(format!("plugin {name} is not installed")))?;

        self.commands.deregister(name);
        let uninstalled = match self.installer.uninstall(name) {
            Ok(uninstalled) => uninstalled,
            Err(e) => {
                // The manifest still lists the plugin: bring its commands back.
                if let Ok(package) = self.installer.read_installed(&record) {
                    let dir = paths::plugin_dir(self.installer.root(), name);
                    let descriptors = CommandDescriptor::from_package(&package, &dir);
                    if let Err(re) = self.commands.register(name, descriptors, true) {
                        tracing::warn!(plugin = %name, "failed to restore commands: {re}");
                    }
                }
                return Err(e);
            }
        };

        Ok(RemoveReport {
            name: uninstalled.record.name,
            version: uninstalled.record.version,
            commands: uninstalled.record.commands,
            warnings: uninstalled.residual_warning.into_iter().collect(),
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Installed plugins in this manager's root, sorted by name.
    pub fn list(&self) -> Result<Vec<InstalledPluginRecord>> {
        Ok(self
            .installer
            .manifest()
            .load()?
            .plugins
            .into_values()
            .collect())
    }

    /// Installed record plus registry metadata. A plugin unknown to the
    /// registry is still reported when it is installed.
    pub fn info(&self, name: &str) -> Result<PluginInfo> {
        paths::validate_plugin_name(name)?;
        let installed = self.installer.manifest().load()?.plugins.remove(name);
        let metadata = match self.registry.get_metadata(name, None) {
            Ok(meta) => Some(meta),
            Err(PluginError::NotFound(_)) if installed.is_some() => None,
            Err(e) => return Err(e),
        };

        let update_available = match (&installed, &metadata) {
            (Some(record), Some(meta)) => {
                match (
                    compat::parse_version(&record.version),
                    compat::parse_version(&meta.version),
                ) {
                    (Ok(current), Ok(latest)) if latest > current => Some(meta.version.clone()),
                    _ => None,
                }
            }
            _ => None,
        };
        let active_commands = self
            .commands
            .commands_of(name)
            .iter()
            .map(|d| d.name.clone())
            .collect();

        Ok(PluginInfo {
            name: name.to_string(),
            installed,
            metadata,
            active_commands,
            update_available,
        })
    }

    pub fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        refresh: bool,
    ) -> Result<Vec<PluginMetadata>> {
        self.registry.search(query, filters, refresh)
    }

    /// Remove cached archives (all, or only `name`'s) and, with `search`,
    /// cached search responses too.
    pub fn cache_clear(&self, name: Option<&str>, search: bool) -> Result<CacheClearReport> {
        if let Some(n) = name {
            paths::validate_plugin_name(n)?;
        }
        let _lock = self.lock()?;
        let packages = self.cache.clear(name)?;
        let searches = if search {
            self.registry.clear_search_cache()?
        } else {
            0
        };
        tracing::info!(packages, searches, "cache cleared");
        Ok(CacheClearReport { packages, searches })
    }

    pub fn registry_stats(&self) -> Result<RegistryStats> {
        self.registry.stats()
    }

    pub fn registry_health(&self) -> Result<RegistryHealth> {
        self.registry.health()
    }

    pub fn registry_config(&self) -> RegistryConfigView {
        RegistryConfigView {
            registry_url: self.config.registry_url.clone(),
            api_key_configured: self.config.api_key.is_some(),
            timeout_secs: self.config.timeout.as_secs(),
            search_cache_ttl_secs: self.config.search_cache_ttl.as_secs(),
            settings_file: paths::settings_path(&self.config.xaheen_home),
            cache_dir: self.config.cache_dir.clone(),
            local_plugins_dir: self.config.local_plugins_dir.clone(),
            global_plugins_dir: self.config.global_plugins_dir.clone(),
            warnings: self.config.validate(),
        }
    }

    /// Persist a new registry URL in `<xaheenHome>/registry.yaml` and use it
    /// from now on.
    pub fn set_registry_url(&mut self, url: &str) -> Result<RegistrySettings> {
        let url = url.trim().trim_end_matches('/');
        validate_registry_url(url)?;
        let mut settings = RegistrySettings::load(&self.config.xaheen_home)?;
        settings.registry_url = Some(url.to_string());
        settings.save(&self.config.xaheen_home)?;

        self.config.registry_url = url.to_string();
        self.registry = RegistryClient::new(&self.config)?;
        tracing::info!(%url, "registry url updated");
        Ok(settings)
    }
}

/// Fetch `metas` through the cache on at most `max_parallel` scoped worker
/// threads. Results come back in input order.
fn fetch_all(
    registry: &RegistryClient,
    cache: &PackageCache,
    metas: &[&PluginMetadata],
    refresh: bool,
    max_parallel: usize,
) -> Vec<Result<Fetched>> {
    if metas.is_empty() {
        return Vec::new();
    }
    let workers = max_parallel.clamp(1, metas.len());
    let queue = Mutex::new((0..metas.len()).collect::<VecDeque<usize>>());
    let slots: Vec<Mutex<Option<Result<Fetched>>>> = metas.iter().map(|_| Mutex::new(None)).collect();

    std::thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| loop {
                let next = queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop_front();
                let Some(i) = next else {
                    break;
                };
                let result = cache.fetch(registry, metas[i], refresh);
                *slots[i].lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
            });
        }
    });

    slots
        .into_iter()
        .zip(metas)
        .map(|(slot, meta)| {
            slot.into_inner()
                .unwrap_or_else(PoisonError::into_inner)
                .unwrap_or_else(|| {
                    Err(PluginError::Validation(format!(
                        "fetch of {} did not complete",
                        meta.key()
                    )))
                })
        })
        .collect()
}
