//! Per-plugin dependency installation.
//!
//! Every plugin carries its own `deps/` directory; nothing is shared between
//! plugins. Requirements are resolved greedily to the highest published
//! version, breadth-first through the dependency tree. A second requirement
//! on an already-resolved dependency must accept the version picked first.

use crate::archive;
use crate::cache::PackageCache;
use crate::compat;
use crate::error::{PluginError, Result};
use crate::io;
use crate::paths;
use crate::registry::RegistryClient;
use crate::types::{cache_key, PackageManifest};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedDependency {
    pub name: String,
    pub version: String,
    /// Plugin or dependency that declared the requirement.
    pub required_by: String,
}

impl ResolvedDependency {
    pub fn key(&self) -> String {
        cache_key(&self.name, &self.version)
    }
}

pub struct DependencyInstaller<'a> {
    registry: &'a RegistryClient,
    cache: &'a PackageCache,
    refresh: bool,
}

impl<'a> DependencyInstaller<'a> {
    pub fn new(registry: &'a RegistryClient, cache: &'a PackageCache, refresh: bool) -> Self {
        Self {
            registry,
            cache,
            refresh,
        }
    }

    /// Install the dependencies of `manifest` into `<staged>/deps/`. On
    /// failure the partially populated `deps/` directory is removed.
    pub fn install(
        &self,
        manifest: &PackageManifest,
        staged: &Path,
    ) -> Result<Vec<ResolvedDependency>> {
        if manifest.dependencies.is_empty() {
            return Ok(Vec::new());
        }
        let deps_root = paths::deps_dir(staged);
        match self.install_into(manifest, &deps_root) {
            Ok(resolved) => Ok(resolved),
            Err(e) => {
                if let Err(cleanup) = io::remove_dir_if_exists(&deps_root) {
                    tracing::warn!(
                        path = %deps_root.display(),
                        "failed to remove partial deps directory: {cleanup}"
                    );
                }
                Err(e)
            }
        }
    }

    fn install_into(
        &self,
        manifest: &PackageManifest,
        deps_root: &Path,
    ) -> Result<Vec<ResolvedDependency>> {
        let mut queue: VecDeque<(String, String, String)> = manifest
            .dependencies
            .iter()
            .map(|(name, req)| (name.clone(), req.clone(), manifest.name.clone()))
            .collect();
        let mut picked: BTreeMap<String, semver::Version> = BTreeMap::new();
        let mut resolved = Vec::new();

        while let Some((name, raw_req, required_by)) = queue.pop_front() {
            paths::validate_plugin_name(&name)?;
            if name == manifest.name {
                return Err(PluginError::Validation(format!(
                    "{required_by} depends on {name}, which is the plugin being installed"
                )));
            }
            let req = compat::parse_range(&raw_req)?;

            if let Some(existing) = picked.get(&name) {
                if req.matches(existing) {
                    continue;
                }
                return Err(PluginError::Validation(format!(
                    "dependency conflict: {required_by} requires {name} {raw_req}, \
                     but {name}@{existing} was already selected"
                )));
            }

            let versions = self.registry.list_versions(&name)?;
            let version = compat::max_satisfying(&req, &versions)
                .cloned()
                .ok_or_else(|| {
                    PluginError::NotFound(format!(
                        "no published version of {name} satisfies {raw_req} (required by {required_by})"
                    ))
                })?;
            let version_str = version.to_string();

            tracing::debug!(dep = %name, version = %version_str, %required_by, "resolving dependency");
            let meta = self.registry.get_metadata(&name, Some(&version_str))?;
            let fetched = self.cache.fetch(self.registry, &meta, self.refresh)?;

            let dest = deps_root.join(&name);
            archive::unpack(&fetched.path, &dest, &name, &version_str)?;
            let dep_manifest = archive::read_package_manifest(&dest, &name, &version_str)?;
            archive::validate_package(&dep_manifest, &dest, &name, &version_str)?;

            for (child, child_req) in &dep_manifest.dependencies {
                queue.push_back((child.clone(), child_req.clone(), name.clone()));
            }
            picked.insert(name.clone(), version);
            resolved.push(ResolvedDependency {
                name,
                version: version_str,
                required_by,
            });
        }
        Ok(resolved)
    }
}
