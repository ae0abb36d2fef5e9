use crate::error::{PluginError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory and file names
// ---------------------------------------------------------------------------

pub const XAHEEN_DIR: &str = ".xaheen";
pub const PLUGINS_DIR: &str = "plugins";
pub const CACHE_DIR: &str = "cache";
pub const PACKAGES_DIR: &str = "packages";
pub const SEARCH_CACHE_DIR: &str = "search";
pub const DEPS_DIR: &str = "deps";

pub const MANIFEST_FILE: &str = "plugins.yaml";
pub const LOCK_FILE: &str = ".plugins.lock";
pub const SETTINGS_FILE: &str = "registry.yaml";
pub const PACKAGE_MANIFEST_FILE: &str = "xaheen-plugin.yaml";

pub const STAGING_PREFIX: &str = ".staging-";
pub const TRASH_PREFIX: &str = ".trash-";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// `<projectRoot>/.xaheen/plugins`
pub fn local_plugins_root(project_root: &Path) -> PathBuf {
    project_root.join(XAHEEN_DIR).join(PLUGINS_DIR)
}

/// `<xaheenHome>/plugins`
pub fn global_plugins_root(xaheen_home: &Path) -> PathBuf {
    xaheen_home.join(PLUGINS_DIR)
}

/// `<xaheenHome>/cache`
pub fn default_cache_dir(xaheen_home: &Path) -> PathBuf {
    xaheen_home.join(CACHE_DIR)
}

pub fn settings_path(xaheen_home: &Path) -> PathBuf {
    xaheen_home.join(SETTINGS_FILE)
}

pub fn manifest_path(plugins_root: &Path) -> PathBuf {
    plugins_root.join(MANIFEST_FILE)
}

pub fn lock_path(plugins_root: &Path) -> PathBuf {
    plugins_root.join(LOCK_FILE)
}

pub fn plugin_dir(plugins_root: &Path, name: &str) -> PathBuf {
    plugins_root.join(name)
}

pub fn deps_dir(plugin_dir: &Path) -> PathBuf {
    plugin_dir.join(DEPS_DIR)
}

pub fn packages_dir(cache_dir: &Path) -> PathBuf {
    cache_dir.join(PACKAGES_DIR)
}

pub fn search_cache_dir(cache_dir: &Path) -> PathBuf {
    cache_dir.join(SEARCH_CACHE_DIR)
}

/// `path` anchored at the current directory when relative. Paths stored in
/// the manifest must not depend on the caller's working directory.
pub fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Default `~/.xaheen`.
pub fn default_xaheen_home() -> Result<PathBuf> {
    home::home_dir()
        .map(|h| h.join(XAHEEN_DIR))
        .ok_or(PluginError::HomeNotFound)
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

/// Plugin and command names double as directory and file names, so they are
/// restricted to lowercase alphanumerics and inner hyphens.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 || !name_re().is_match(name) {
        return Err(PluginError::Validation(format!(
            "invalid {kind} name '{name}': must be lowercase alphanumeric with hyphens"
        )));
    }
    Ok(())
}

pub fn validate_plugin_name(name: &str) -> Result<()> {
    validate_name("plugin", name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
