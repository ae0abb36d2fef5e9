use crate::output::{print_json, print_table, print_warnings, truncate};
use anyhow::Context;
use clap::Subcommand;
use std::io::{BufRead, IsTerminal, Write};
use xaheen_plugins::config::WarnLevel;
use xaheen_plugins::manager::{InstallFlags, InstalledPlugin, PluginManager};
use xaheen_plugins::types::{SearchFilters, SortKey, SortOrder};

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum PluginSubcommand {
    /// Install plugins from the registry or from local archives
    Install {
        /// `name`, `name@version`, `name@<range>` or a path to a .tgz archive
        #[arg(required = true, value_name = "PLUGIN")]
        plugins: Vec<String>,
        /// Install into the global plugins directory
        #[arg(long)]
        global: bool,
        /// Install despite host incompatibility or command conflicts
        #[arg(long)]
        force: bool,
        /// Accepted for scripts shared with `remove`; install never prompts
        #[arg(long, short = 'y')]
        yes: bool,
        /// Download archives even when they are cached
        #[arg(long)]
        refresh: bool,
    },

    /// Remove an installed plugin
    #[command(alias = "uninstall")]
    Remove {
        name: String,
        /// Remove from the global plugins directory
        #[arg(long)]
        global: bool,
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
        /// Skip the confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// List installed plugins
    List {
        /// Show install paths, timestamps and dependencies
        #[arg(long)]
        detailed: bool,
        /// List the global plugins directory
        #[arg(long)]
        global: bool,
    },

    /// Show registry and install details for a plugin
    Info {
        name: String,
        /// Look in the global plugins directory
        #[arg(long)]
        global: bool,
    },

    /// Search the plugin registry
    Search {
        query: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        author: Option<String>,
        /// Only certified plugins
        #[arg(long)]
        certified: bool,
        #[arg(long, value_name = "RATING")]
        min_rating: Option<f64>,
        /// rating, downloads or name
        #[arg(long, default_value_t = SortKey::Rating)]
        sort: SortKey,
        /// asc or desc
        #[arg(long, default_value_t = SortOrder::Desc)]
        order: SortOrder,
        #[arg(long)]
        limit: Option<usize>,
        /// Bypass the search response cache
        #[arg(long)]
        refresh: bool,
    },

    /// Update one plugin, or every installed plugin, to the latest version
    Update {
        name: Option<String>,
        /// Update the global plugins directory
        #[arg(long)]
        global: bool,
        /// Update despite host incompatibility or command conflicts
        #[arg(long)]
        force: bool,
        /// Download archives even when they are cached
        #[arg(long)]
        refresh: bool,
    },

    /// Manage the local archive cache
    Cache {
        #[command(subcommand)]
        subcommand: CacheSubcommand,
    },

    /// Inspect and configure the plugin registry
    Registry {
        #[command(subcommand)]
        subcommand: RegistrySubcommand,
    },
}

#[derive(Subcommand)]
pub enum CacheSubcommand {
    /// Delete cached archives
    Clear {
        /// Only this plugin's archives
        name: Option<String>,
        /// Also delete cached search responses
        #[arg(long)]
        search: bool,
    },
}

#[derive(Subcommand)]
pub enum RegistrySubcommand {
    /// Show registry statistics
    Stats,
    /// Check that the registry is reachable and healthy
    Health,
    /// Show the effective registry configuration
    Config,
    /// Persist a new registry URL
    SetUrl { url: String },
}

impl PluginSubcommand {
    /// Whether the command targets the global plugins directory.
    pub fn is_global(&self) -> bool {
        match self {
            PluginSubcommand::Install { global, .. }
            | PluginSubcommand::Remove { global, .. }
            | PluginSubcommand::List { global, .. }
            | PluginSubcommand::Info { global, .. }
            | PluginSubcommand::Update { global, .. } => *global,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(manager: &mut PluginManager, subcmd: PluginSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        PluginSubcommand::Install {
            plugins,
            force,
            refresh,
            yes: _,
            global: _,
        } => install(manager, &plugins, InstallFlags { force, refresh }, json),
        PluginSubcommand::Remove {
            name, force, yes, ..
        } => remove(manager, &name, force || yes, json),
        PluginSubcommand::List { detailed, .. } => list(manager, detailed, json),
        PluginSubcommand::Info { name, .. } => info(manager, &name, json),
        PluginSubcommand::Search {
            query,
            category,
            author,
            certified,
            min_rating,
            sort,
            order,
            limit,
            refresh,
        } => {
            let filters = SearchFilters {
                category,
                author,
                certified: certified.then_some(true),
                min_rating,
                sort,
                order,
                limit,
            };
            search(manager, query.as_deref().unwrap_or(""), &filters, refresh, json)
        }
        PluginSubcommand::Update {
            name,
            force,
            refresh,
            ..
        } => update(manager, name.as_deref(), InstallFlags { force, refresh }, json),
        PluginSubcommand::Cache { subcommand } => match subcommand {
            CacheSubcommand::Clear { name, search } => {
                cache_clear(manager, name.as_deref(), search, json)
            }
        },
        PluginSubcommand::Registry { subcommand } => run_registry(manager, subcommand, json),
    }
}

// ---------------------------------------------------------------------------
// install / update
// ---------------------------------------------------------------------------

fn describe(p: &InstalledPlugin) -> String {
    let mut line = match &p.previous_version {
        Some(prev) if *prev != p.version => {
            format!("Updated {} {prev} -> {} ({})", p.name, p.version, p.source)
        }
        _ => format!("Installed {}@{} ({})", p.name, p.version, p.source),
    };
    if p.from_cache {
        line.push_str(" from cache");
    }
    if !p.commands.is_empty() {
        line.push_str(&format!("\n  commands: {}", p.commands.join(", ")));
    }
    if !p.dependencies.is_empty() {
        line.push_str(&format!("\n  dependencies: {}", p.dependencies.join(", ")));
    }
    line
}

fn install(
    manager: &mut PluginManager,
    specs: &[String],
    flags: InstallFlags,
    json: bool,
) -> anyhow::Result<()> {
    let report = manager.install(specs, flags)?;
    if json {
        return print_json(&report);
    }
    print_warnings(&report.warnings);
    for p in &report.installed {
        println!("{}", describe(p));
    }
    Ok(())
}

fn update(
    manager: &mut PluginManager,
    name: Option<&str>,
    flags: InstallFlags,
    json: bool,
) -> anyhow::Result<()> {
    let report = manager.update(name, flags)?;
    if json {
        return print_json(&report);
    }
    print_warnings(&report.warnings);
    for p in &report.updated {
        println!("{}", describe(p));
    }
    for n in &report.up_to_date {
        println!("{n} is up to date");
    }
    for n in &report.skipped {
        println!("{n} skipped");
    }
    if report.updated.is_empty() && report.up_to_date.is_empty() && report.skipped.is_empty() {
        println!("No plugins installed.");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// remove
// ---------------------------------------------------------------------------

/// Ask on the terminal. Without a TTY the answer is always no.
fn confirm(question: &str) -> anyhow::Result<bool> {
    if !std::io::stdin().is_terminal() {
        return Ok(false);
    }
    eprint!("{question} [y/N] ");
    std::io::stderr().flush()?;
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes" | "YES"))
}

fn remove(manager: &mut PluginManager, name: &str, skip_prompt: bool, json: bool) -> anyhow::Result<()> {
    let confirmed = skip_prompt || confirm(&format!("Remove plugin {name}?"))?;
    let report = manager.remove(name, confirmed)?;
    if json {
        return print_json(&report);
    }
    print_warnings(&report.warnings);
    println!("Removed {}@{}", report.name, report.version);
    if !report.commands.is_empty() {
        println!("  commands: {}", report.commands.join(", "));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// list / info
// ---------------------------------------------------------------------------

fn list(manager: &PluginManager, detailed: bool, json: bool) -> anyhow::Result<()> {
    let plugins = manager.list()?;
    if json {
        return print_json(&plugins);
    }
    if plugins.is_empty() {
        println!("No plugins installed.");
        return Ok(());
    }

    if detailed {
        let rows = plugins
            .iter()
            .map(|p| {
                vec![
                    p.name.clone(),
                    p.version.clone(),
                    p.source.to_string(),
                    p.commands.join(","),
                    p.dependencies.join(","),
                    p.installed_at.format("%Y-%m-%d %H:%M").to_string(),
                    if p.forced { "yes" } else { "" }.to_string(),
                    p.install_path.display().to_string(),
                ]
            })
            .collect();
        print_table(
            &[
                "NAME",
                "VERSION",
                "SOURCE",
                "COMMANDS",
                "DEPENDENCIES",
                "INSTALLED",
                "FORCED",
                "PATH",
            ],
            rows,
        );
    } else {
        let rows = plugins
            .iter()
            .map(|p| {
                vec![
                    p.name.clone(),
                    p.version.clone(),
                    p.source.to_string(),
                    p.commands.join(","),
                ]
            })
            .collect();
        print_table(&["NAME", "VERSION", "SOURCE", "COMMANDS"], rows);
    }
    Ok(())
}

fn info(manager: &PluginManager, name: &str, json: bool) -> anyhow::Result<()> {
    let info = manager.info(name)?;
    if json {
        return print_json(&info);
    }

    println!("Plugin: {}", info.name);
    if let Some(meta) = &info.metadata {
        if !meta.description.is_empty() {
            println!("Description: {}", meta.description);
        }
        println!("Latest: {}", meta.version);
        if !meta.author.is_empty() {
            println!("Author: {}", meta.author);
        }
        if !meta.category.is_empty() {
            println!("Category: {}", meta.category);
        }
        if let Some(host) = &meta.host {
            println!("Host: {host}");
        }
        println!(
            "Rating: {:.1}  Downloads: {}  Certified: {}",
            meta.rating,
            meta.downloads,
            if meta.certified { "yes" } else { "no" }
        );
        if let Some(repo) = &meta.repository {
            println!("Repository: {repo}");
        }
    } else {
        println!("Registry: not published");
    }

    match &info.installed {
        Some(record) => {
            println!(
                "Installed: {} ({}, {})",
                record.version,
                record.source,
                record.installed_at.format("%Y-%m-%d %H:%M")
            );
            println!("Path: {}", record.install_path.display());
            if record.forced {
                println!("Forced: yes");
            }
            if !record.dependencies.is_empty() {
                println!("Dependencies: {}", record.dependencies.join(", "));
            }
        }
        None => println!("Installed: no"),
    }
    if !info.active_commands.is_empty() {
        println!("Commands: {}", info.active_commands.join(", "));
    }
    if let Some(latest) = &info.update_available {
        println!("Update available: {latest} (run `xaheen plugin update {}`)", info.name);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// search
// ---------------------------------------------------------------------------

fn search(
    manager: &PluginManager,
    query: &str,
    filters: &SearchFilters,
    refresh: bool,
    json: bool,
) -> anyhow::Result<()> {
    let results = manager.search(query, filters, refresh)?;
    if json {
        return print_json(&results);
    }
    if results.is_empty() {
        println!("No plugins found.");
        return Ok(());
    }
    let rows = results
        .iter()
        .map(|m| {
            vec![
                m.name.clone(),
                m.version.clone(),
                format!("{:.1}", m.rating),
                m.downloads.to_string(),
                if m.certified { "yes" } else { "" }.to_string(),
                truncate(&m.description, 48),
            ]
        })
        .collect();
    print_table(
        &["NAME", "VERSION", "RATING", "DOWNLOADS", "CERTIFIED", "DESCRIPTION"],
        rows,
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// cache
// ---------------------------------------------------------------------------

fn cache_clear(
    manager: &PluginManager,
    name: Option<&str>,
    search: bool,
    json: bool,
) -> anyhow::Result<()> {
    let report = manager.cache_clear(name, search)?;
    if json {
        return print_json(&report);
    }
    println!("Removed {} cached archive(s)", report.packages);
    if search {
        println!("Removed {} cached search response(s)", report.searches);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// registry
// ---------------------------------------------------------------------------

fn run_registry(
    manager: &mut PluginManager,
    subcmd: RegistrySubcommand,
    json: bool,
) -> anyhow::Result<()> {
    match subcmd {
        RegistrySubcommand::Stats => registry_stats(manager, json),
        RegistrySubcommand::Health => registry_health(manager, json),
        RegistrySubcommand::Config => registry_config(manager, json),
        RegistrySubcommand::SetUrl { url } => {
            manager.set_registry_url(&url)?;
            if json {
                print_json(&serde_json::json!({ "registry_url": manager.config().registry_url }))
            } else {
                println!("Registry URL set to {}", manager.config().registry_url);
                Ok(())
            }
        }
    }
}

fn registry_stats(manager: &PluginManager, json: bool) -> anyhow::Result<()> {
    let stats = manager.registry_stats()?;
    if json {
        return print_json(&stats);
    }
    println!("Plugins: {}", stats.total_plugins);
    println!("Certified: {}", stats.certified_plugins);
    println!("Downloads: {}", stats.total_downloads);
    if !stats.categories.is_empty() {
        let rows = stats
            .categories
            .iter()
            .map(|(category, count)| vec![category.clone(), count.to_string()])
            .collect();
        println!();
        print_table(&["CATEGORY", "PLUGINS"], rows);
    }
    Ok(())
}

fn registry_health(manager: &PluginManager, json: bool) -> anyhow::Result<()> {
    let health = manager.registry_health()?;
    if json {
        print_json(&health)?;
    } else {
        println!(
            "{}: {} ({} ms)",
            health.url, health.status, health.latency_ms
        );
    }
    if !health.healthy {
        anyhow::bail!("registry at {} is unhealthy: {}", health.url, health.status);
    }
    Ok(())
}

fn registry_config(manager: &PluginManager, json: bool) -> anyhow::Result<()> {
    let view = manager.registry_config();
    if json {
        print_json(&view)?;
    } else {
        println!("Registry URL: {}", view.registry_url);
        println!(
            "API key: {}",
            if view.api_key_configured { "configured" } else { "not set" }
        );
        println!("Timeout: {}s", view.timeout_secs);
        println!("Search cache TTL: {}s", view.search_cache_ttl_secs);
        println!("Settings file: {}", view.settings_file.display());
        println!("Cache: {}", view.cache_dir.display());
        println!("Local plugins: {}", view.local_plugins_dir.display());
        println!("Global plugins: {}", view.global_plugins_dir.display());
        for w in &view.warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if view.warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("registry configuration has errors");
    }
    Ok(())
}
