mod cmd;
mod context;
mod dispatch;
mod output;
mod root;

use clap::{Args, Parser, Subcommand};
use cmd::plugin::PluginSubcommand;
use std::ffi::OsString;
use std::path::PathBuf;
use xaheen_plugins::config::PluginScope;
use xaheen_plugins::manager::PluginManager;

/// Version plugins are checked against.
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(
    name = "xaheen",
    about = "xaheen code generation CLI",
    version,
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    globals: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug)]
pub struct GlobalArgs {
    /// Project root (default: auto-detect from .xaheen/ or .git/)
    #[arg(long, global = true, env = "XAHEEN_ROOT")]
    pub root: Option<PathBuf>,

    /// Base directory for settings, global plugins and the cache (default: ~/.xaheen)
    #[arg(long, global = true, env = "XAHEEN_HOME")]
    pub home: Option<PathBuf>,

    /// Plugin registry base URL
    #[arg(long, global = true, env = "XAHEEN_REGISTRY_URL")]
    pub registry_url: Option<String>,

    /// Registry API key
    #[arg(long, global = true, env = "XAHEEN_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Local plugins directory (default: <root>/.xaheen/plugins)
    #[arg(long, global = true, env = "XAHEEN_PLUGINS_DIR")]
    pub plugins_dir: Option<PathBuf>,

    /// Global plugins directory (default: <home>/plugins)
    #[arg(long, global = true, env = "XAHEEN_GLOBAL_PLUGINS_DIR")]
    pub global_plugins_dir: Option<PathBuf>,

    /// Archive cache directory (default: <home>/cache)
    #[arg(long, global = true, env = "XAHEEN_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    pub json: bool,
}

/// Global arguments alone, resolved from the environment. Used when the
/// command line itself did not parse.
#[derive(Parser)]
struct EnvOnly {
    #[command(flatten)]
    globals: GlobalArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Install, update, remove and inspect plugins
    Plugin {
        #[command(subcommand)]
        subcommand: PluginSubcommand,
    },

    /// Commands contributed by installed plugins
    #[command(external_subcommand)]
    External(Vec<String>),
}

impl Commands {
    fn scope(&self) -> PluginScope {
        match self {
            Commands::Plugin { subcommand } if subcommand.is_global() => PluginScope::Global,
            _ => PluginScope::Local,
        }
    }
}

fn main() {
    let args: Vec<OsString> = std::env::args_os().collect();
    let parsed = Cli::try_parse_from(&args);
    let globals = match &parsed {
        Ok(cli) => cli.globals.clone(),
        Err(_) => EnvOnly::parse_from(["xaheen"]).globals,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(&args, parsed, &globals) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            // Print the full error chain (anyhow's alternate Display)
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run(
    args: &[OsString],
    parsed: Result<Cli, clap::Error>,
    globals: &GlobalArgs,
) -> anyhow::Result<i32> {
    let scope = parsed
        .as_ref()
        .map(|cli| cli.command.scope())
        .unwrap_or(PluginScope::Local);
    let config = context::resolve_config(globals)?;
    let mut manager = PluginManager::new(config, scope, HOST_VERSION)?;
    for warning in manager.activate_installed()? {
        tracing::warn!("{warning}");
    }

    let cli = match parsed {
        Ok(cli) => cli,
        // Help, version and usage errors: render them against the full
        // command tree so installed plugin commands are listed.
        Err(first) => match dispatch::command(manager.commands()).try_get_matches_from(args) {
            Err(e) => e.exit(),
            Ok(_) => first.exit(),
        },
    };

    match cli.command {
        Commands::Plugin { subcommand } => {
            cmd::plugin::run(&mut manager, subcommand, globals.json)?;
            Ok(0)
        }
        Commands::External(_) => dispatch::run(args, manager.into_commands()),
    }
}
