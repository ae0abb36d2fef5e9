use crate::error::{PluginError, Result};
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Registry wire types
// ---------------------------------------------------------------------------

/// Plugin metadata as served by the registry. Never persisted outside the
/// search cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Semver range of supported host (CLI) versions.
    #[serde(default, alias = "hostVersion")]
    pub host: Option<String>,
    #[serde(default)]
    pub certified: bool,
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub downloads: u64,
    #[serde(default)]
    pub repository: Option<String>,
    /// Archive digest, `sha256:<hex>` or bare hex.
    #[serde(default)]
    pub checksum: Option<String>,
}

impl PluginMetadata {
    pub fn key(&self) -> String {
        cache_key(&self.name, &self.version)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    #[serde(default)]
    pub total_plugins: u64,
    #[serde(default)]
    pub total_downloads: u64,
    #[serde(default)]
    pub certified_plugins: u64,
    #[serde(default)]
    pub categories: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryHealth {
    pub url: String,
    pub status: String,
    pub healthy: bool,
    pub latency_ms: u64,
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Rating,
    Downloads,
    Name,
}

impl std::fmt::Display for SortKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SortKey::Rating => write!(f, "rating"),
            SortKey::Downloads => write!(f, "downloads"),
            SortKey::Name => write!(f, "name"),
        }
    }
}

impl std::str::FromStr for SortKey {
    type Err = PluginError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rating" => Ok(SortKey::Rating),
            "downloads" => Ok(SortKey::Downloads),
            "name" => Ok(SortKey::Name),
            _ => Err(PluginError::Validation(format!(
                "unknown sort key '{s}': expected rating, downloads or name"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl std::fmt::Display for SortOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SortOrder::Asc => write!(f, "asc"),
            SortOrder::Desc => write!(f, "desc"),
        }
    }
}

impl std::str::FromStr for SortOrder {
    type Err = PluginError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            _ => Err(PluginError::Validation(format!(
                "unknown sort order '{s}': expected asc or desc"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub category: Option<String>,
    pub author: Option<String>,
    pub certified: Option<bool>,
    pub min_rating: Option<f64>,
    pub sort: SortKey,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// In-archive package manifest
// ---------------------------------------------------------------------------

/// `xaheen-plugin.yaml` at the root of every plugin archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
    /// Dependency name → semver requirement.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

impl PackageManifest {
    pub fn command_names(&self) -> Vec<String> {
        self.commands.iter().map(|c| c.name.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Path of the executable, relative to the plugin directory.
    pub entry: String,
    /// Program used to run `entry`, e.g. `sh` or `node`.
    #[serde(default)]
    pub interpreter: Option<String>,
    #[serde(default)]
    pub options: Vec<OptionSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub takes_value: bool,
    #[serde(default)]
    pub required: bool,
}

// ---------------------------------------------------------------------------
// Installed state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginSource {
    Registry,
    Local,
    Global,
}

impl std::fmt::Display for PluginSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginSource::Registry => write!(f, "registry"),
            PluginSource::Local => write!(f, "local"),
            PluginSource::Global => write!(f, "global"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledPluginRecord {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub install_path: PathBuf,
    pub installed_at: DateTime<Utc>,
    #[serde(default)]
    pub commands: Vec<String>,
    pub source: PluginSource,
    #[serde(default)]
    pub forced: bool,
    /// Resolved dependencies as `name@version`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

impl InstalledPluginRecord {
    /// Equality ignoring the install timestamp.
    pub fn same_install(&self, other: &InstalledPluginRecord) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.install_path == other.install_path
            && self.commands == other.commands
            && self.source == other.source
            && self.forced == other.forced
            && self.dependencies == other.dependencies
    }
}

// ---------------------------------------------------------------------------
// Install requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum VersionSelector {
    Latest,
    Exact(semver::Version),
    Range(semver::VersionReq),
}

/// A parsed `name[@version]` argument.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginRequest {
    pub name: String,
    pub version: VersionSelector,
}

impl PluginRequest {
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let (name, version) = match spec.split_once('@') {
            Some((name, version)) => (name, Some(version)),
            None => (spec, None),
        };
        paths::validate_plugin_name(name)?;
        let version = match version {
            None => VersionSelector::Latest,
            Some("") | Some("latest") => VersionSelector::Latest,
            Some(v) => match semver::Version::parse(v) {
                Ok(exact) => VersionSelector::Exact(exact),
                Err(_) => VersionSelector::Range(semver::VersionReq::parse(v).map_err(|e| {
                    PluginError::Validation(format!("invalid version '{v}' for {name}: {e}"))
                })?),
            },
        };
        Ok(PluginRequest {
            name: name.to_string(),
            version,
        })
    }
}

impl std::fmt::Display for PluginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.version {
            VersionSelector::Latest => write!(f, "{}", self.name),
            VersionSelector::Exact(v) => write!(f, "{}@{v}", self.name),
            VersionSelector::Range(r) => write!(f, "{}@{r}", self.name),
        }
    }
}

/// Cache key for a plugin archive.
pub fn cache_key(name: &str, version: &str) -> String {
    format!("{name}@{version}")
}
