use crate::root::resolve_root;
use crate::GlobalArgs;
use anyhow::Context;
use xaheen_plugins::config::{Overrides, PluginConfig, RegistrySettings};
use xaheen_plugins::paths;

/// Build the effective plugin configuration from global flags, the
/// persisted registry settings and defaults, in that order.
pub fn resolve_config(globals: &GlobalArgs) -> anyhow::Result<PluginConfig> {
    let home = match &globals.home {
        Some(h) => paths::absolute(h),
        None => paths::default_xaheen_home()?,
    };
    let root = resolve_root(globals.root.as_deref(), &home);
    let settings = RegistrySettings::load(&home)
        .with_context(|| format!("failed to read settings in {}", home.display()))?;

    let config = PluginConfig::resolve(
        &home,
        &root,
        &settings,
        Overrides {
            registry_url: globals.registry_url.clone(),
            api_key: globals.api_key.clone(),
            plugins_dir: globals.plugins_dir.clone(),
            global_plugins_dir: globals.global_plugins_dir.clone(),
            cache_dir: globals.cache_dir.clone(),
        },
    );
    tracing::debug!(
        root = %root.display(),
        registry = %config.registry_url,
        "configuration resolved"
    );
    Ok(config)
}
