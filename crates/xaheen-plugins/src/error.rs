use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("incompatible version: {name}@{version} requires host {required}, running {host}")]
    IncompatibleVersion {
        name: String,
        version: String,
        required: String,
        host: String,
    },

    #[error("command conflict: '{command}' is already provided by plugin '{owner}'")]
    CommandConflict { command: String, owner: String },

    #[error("package corrupted: {name}@{version}: {reason}")]
    PackageCorrupted {
        name: String,
        version: String,
        reason: String,
    },

    #[error("unable to connect to plugin registry at {url}: {reason}")]
    Network { url: String, reason: String },

    /// The registry answered, but with a status other than success or 404.
    #[error("plugin registry returned HTTP {status} for {url}")]
    RegistryResponse { status: u16, url: String },

    #[error("timed out after {secs}s waiting for {url}")]
    Timeout { url: String, secs: u64 },

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("plugins directory is busy: another xaheen process holds {}", .0.display())]
    Busy(PathBuf),

    #[error("confirmation required: re-run with --yes to {0}")]
    ConfirmationRequired(String),

    #[error("home directory not found: set HOME or XAHEEN_HOME")]
    HomeNotFound,

    #[error(transparent)]
    Io(std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<std::io::Error> for PluginError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            PluginError::Permission(e.to_string())
        } else {
            PluginError::Io(e)
        }
    }
}

impl PluginError {
    /// True for failures talking to the registry.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            PluginError::Network { .. }
                | PluginError::RegistryResponse { .. }
                | PluginError::Timeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;
