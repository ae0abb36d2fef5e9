use crate::error::{PluginError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_REGISTRY_URL: &str = "https://registry.xaheen.dev/v1";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SEARCH_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_PARALLEL_FETCHES: usize = 4;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// PluginScope
// ---------------------------------------------------------------------------

/// Which plugins root an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginScope {
    Local,
    Global,
}

// ---------------------------------------------------------------------------
// RegistrySettings (persisted)
// ---------------------------------------------------------------------------

/// User-editable registry settings stored in `<xaheenHome>/registry.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_cache_ttl_secs: Option<u64>,
}

impl RegistrySettings {
    /// Missing file means defaults.
    pub fn load(xaheen_home: &Path) -> Result<Self> {
        let path = paths::settings_path(xaheen_home);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let settings: RegistrySettings = serde_yaml::from_str(&data)?;
        Ok(settings)
    }

    pub fn save(&self, xaheen_home: &Path) -> Result<()> {
        let path = paths::settings_path(xaheen_home);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }
}

/// Reject anything that is not an absolute http(s) URL.
pub fn validate_registry_url(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| PluginError::Validation(format!("invalid registry url '{url}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(PluginError::Validation(format!(
            "invalid registry url '{url}': unsupported scheme '{other}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// PluginConfig (resolved)
// ---------------------------------------------------------------------------

/// Explicit overrides, usually from CLI flags or their environment variables.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub registry_url: Option<String>,
    pub api_key: Option<String>,
    pub plugins_dir: Option<PathBuf>,
    pub global_plugins_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub xaheen_home: PathBuf,
    pub registry_url: String,
    pub api_key: Option<String>,
    pub local_plugins_dir: PathBuf,
    pub global_plugins_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub timeout: Duration,
    pub search_cache_ttl: Duration,
    pub lock_timeout: Duration,
    pub max_parallel_fetches: usize,
}

impl PluginConfig {
    /// Precedence: overrides, then persisted settings, then defaults.
    pub fn resolve(
        xaheen_home: &Path,
        project_root: &Path,
        settings: &RegistrySettings,
        overrides: Overrides,
    ) -> Self {
        let registry_url = overrides
            .registry_url
            .or_else(|| settings.registry_url.clone())
            .unwrap_or_else(|| DEFAULT_REGISTRY_URL.to_string());
        let xaheen_home = paths::absolute(xaheen_home);
        let project_root = paths::absolute(project_root);
        Self {
            registry_url: registry_url.trim_end_matches('/').to_string(),
            api_key: overrides.api_key.filter(|k| !k.trim().is_empty()),
            local_plugins_dir: overrides
                .plugins_dir
                .map_or_else(|| paths::local_plugins_root(&project_root), |p| paths::absolute(&p)),
            global_plugins_dir: overrides
                .global_plugins_dir
                .map_or_else(|| paths::global_plugins_root(&xaheen_home), |p| paths::absolute(&p)),
            cache_dir: overrides
                .cache_dir
                .map_or_else(|| paths::default_cache_dir(&xaheen_home), |p| paths::absolute(&p)),
            timeout: Duration::from_secs(settings.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            search_cache_ttl: Duration::from_secs(
                settings
                    .search_cache_ttl_secs
                    .unwrap_or(DEFAULT_SEARCH_CACHE_TTL_SECS),
            ),
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            max_parallel_fetches: DEFAULT_MAX_PARALLEL_FETCHES,
            xaheen_home,
        }
    }

    pub fn plugins_root(&self, scope: PluginScope) -> &Path {
        match scope {
            PluginScope::Local => &self.local_plugins_dir,
            PluginScope::Global => &self.global_plugins_dir,
        }
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if let Err(e) = validate_registry_url(&self.registry_url) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: e.to_string(),
            });
        } else if self.registry_url.starts_with("http://")
            && !self.registry_url.starts_with("http://127.0.0.1")
            && !self.registry_url.starts_with("http://localhost")
        {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "registry url '{}' is not https; archives are still checksum-verified",
                    self.registry_url
                ),
            });
        }

        if self.timeout.is_zero() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "timeout_secs must be greater than zero".to_string(),
            });
        }

        if self.max_parallel_fetches == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "max_parallel_fetches must be at least 1".to_string(),
            });
        }

        if self.local_plugins_dir == self.global_plugins_dir {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "local and global plugins directories are both {}",
                    self.local_plugins_dir.display()
                ),
            });
        }

        if self.api_key.is_none() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "XAHEEN_API_KEY is not set; publishing to the registry is unavailable"
                    .to_string(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
