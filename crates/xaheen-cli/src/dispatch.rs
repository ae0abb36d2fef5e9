use crate::Cli;
use clap::{Arg, ArgAction, ArgMatches, CommandFactory};
use std::ffi::OsString;
use xaheen_plugins::commands::{CommandDescriptor, CommandRegistry, Invocation};

/// Positional arguments forwarded to a plugin command verbatim.
const TRAILING_ARGS: &str = "__args";

/// The host command tree with one subcommand per active plugin command.
pub fn command(registry: &CommandRegistry) -> clap::Command {
    registry
        .iter()
        .fold(Cli::command(), |cmd, descriptor| {
            cmd.subcommand(subcommand(descriptor))
        })
}

fn subcommand(descriptor: &CommandDescriptor) -> clap::Command {
    let about = if descriptor.description.is_empty() {
        format!("[plugin: {}]", descriptor.plugin)
    } else {
        format!("{} [plugin: {}]", descriptor.description, descriptor.plugin)
    };
    let mut cmd = clap::Command::new(descriptor.name.clone()).about(about);
    for opt in &descriptor.options {
        let arg = Arg::new(opt.name.clone())
            .long(opt.name.clone())
            .help(opt.description.clone());
        let arg = if opt.takes_value {
            arg.action(ArgAction::Set)
                .value_name("VALUE")
                .required(opt.required)
        } else {
            arg.action(ArgAction::SetTrue)
        };
        cmd = cmd.arg(arg);
    }
    cmd.arg(
        Arg::new(TRAILING_ARGS)
            .value_name("ARGS")
            .num_args(0..)
            .trailing_var_arg(true)
            .allow_hyphen_values(true),
    )
}

/// Translate parsed matches back into the host-agnostic invocation handed to
/// the plugin.
fn invocation(descriptor: &CommandDescriptor, matches: &ArgMatches) -> Invocation {
    let mut inv = Invocation::new(descriptor.name.clone());
    for opt in &descriptor.options {
        if opt.takes_value {
            if let Some(value) = matches.get_one::<String>(&opt.name) {
                inv.options.insert(opt.name.clone(), value.clone());
            }
        } else if matches.get_flag(&opt.name) {
            inv.flags.insert(opt.name.clone());
        }
    }
    inv.args = matches
        .get_many::<String>(TRAILING_ARGS)
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    inv
}

/// Parse `args` against the full command tree and run the plugin command
/// they name. Returns the plugin's exit code.
pub fn run(args: &[OsString], registry: CommandRegistry) -> anyhow::Result<i32> {
    let matches = match command(&registry).try_get_matches_from(args) {
        Ok(m) => m,
        Err(e) => e.exit(),
    };
    let Some((name, sub)) = matches.subcommand() else {
        anyhow::bail!("no command given");
    };
    let Some(descriptor) = registry.get(name) else {
        anyhow::bail!("unknown command '{name}'");
    };
    let inv = invocation(descriptor, sub);
    tracing::debug!(command = %name, plugin = %descriptor.plugin, "dispatching plugin command");
    Ok(registry.dispatch(&inv)?)
}
