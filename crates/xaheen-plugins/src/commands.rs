//! Live command surface contributed by installed plugins.
//!
//! The registry is a plain value owned by the plugin manager and handed to
//! the CLI dispatcher; there is no process-wide instance. A command name has
//! exactly one owner at a time.

use crate::error::{PluginError, Result};
use crate::paths;
use crate::types::{OptionSpec, PackageManifest};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

/// Parsed invocation of a plugin command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Invocation {
    pub command: String,
    /// Options that carry a value, by name.
    pub options: BTreeMap<String, String>,
    /// Boolean options that were passed.
    pub flags: BTreeSet<String>,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// Render as command-line arguments: `--name value` for options, then
    /// `--flag`, then positionals.
    pub fn to_args(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (name, value) in &self.options {
            out.push(format!("--{name}"));
            out.push(value.clone());
        }
        for flag in &self.flags {
            out.push(format!("--{flag}"));
        }
        out.extend(self.args.iter().cloned());
        out
    }
}

/// Entry point of a plugin command. Returns the command's exit code.
pub trait PluginHandler: Send + Sync + std::fmt::Debug {
    fn execute(&self, invocation: &Invocation) -> Result<i32>;
}

/// Runs a command's entry as a subprocess inside the plugin directory.
#[derive(Debug, Clone)]
pub struct ProcessHandler {
    plugin_dir: PathBuf,
    entry: PathBuf,
    interpreter: Option<String>,
}

impl ProcessHandler {
    pub fn new(plugin_dir: &Path, entry: &str, interpreter: Option<&str>) -> Self {
        Self {
            plugin_dir: plugin_dir.to_path_buf(),
            entry: plugin_dir.join(entry),
            interpreter: interpreter.map(str::to_string),
        }
    }
}

impl PluginHandler for ProcessHandler {
    fn execute(&self, invocation: &Invocation) -> Result<i32> {
        let mut cmd = match &self.interpreter {
            Some(interp) => {
                let mut c = Command::new(interp);
                c.arg(&self.entry);
                c
            }
            None => Command::new(&self.entry),
        };
        cmd.current_dir(&self.plugin_dir)
            .env("XAHEEN_PLUGIN_DIR", &self.plugin_dir)
            .env("XAHEEN_PLUGIN_DEPS", paths::deps_dir(&self.plugin_dir))
            .env("XAHEEN_PLUGIN_COMMAND", &invocation.command)
            .args(invocation.to_args());

        tracing::debug!(command = %invocation.command, entry = %self.entry.display(), "running plugin command");
        let status = cmd.status().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PluginError::NotFound(format!(
                    "entry for command '{}' could not be started: {}",
                    invocation.command,
                    self.entry.display()
                ))
            } else {
                PluginError::from(e)
            }
        })?;
        // Killed by a signal: no code, report generic failure.
        Ok(status.code().unwrap_or(1))
    }
}

#[derive(Debug, Clone)]
pub struct CommandDescriptor {
    pub name: String,
    pub plugin: String,
    pub description: String,
    pub options: Vec<OptionSpec>,
    pub handler: Arc<dyn PluginHandler>,
}

impl CommandDescriptor {
    /// One descriptor per command in `package`, backed by a subprocess
    /// handler rooted at `plugin_dir`.
    pub fn from_package(package: &PackageManifest, plugin_dir: &Path) -> Vec<CommandDescriptor> {
        package
            .commands
            .iter()
            .map(|spec| CommandDescriptor {
                name: spec.name.clone(),
                plugin: package.name.clone(),
                description: spec.description.clone(),
                options: spec.options.clone(),
                handler: Arc::new(ProcessHandler::new(
                    plugin_dir,
                    &spec.entry,
                    spec.interpreter.as_deref(),
                )),
            })
            .collect()
    }
}

/// Names owned by the host CLI itself.
pub const RESERVED_COMMANDS: &[&str] = &["plugin", "help"];

/// Owner reported for conflicts with [`RESERVED_COMMANDS`].
pub const HOST_OWNER: &str = "xaheen";

/// Long options the host defines on every command.
pub const RESERVED_OPTIONS: &[&str] = &[
    "help",
    "version",
    "json",
    "root",
    "home",
    "registry-url",
    "api-key",
    "plugins-dir",
    "global-plugins-dir",
    "cache-dir",
];

#[derive(Debug)]
pub struct CommandRegistry {
    commands: BTreeMap<String, CommandDescriptor>,
    reserved: BTreeSet<String>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::with_reserved(RESERVED_COMMANDS.iter().copied())
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reserved<'a>(reserved: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            commands: BTreeMap::new(),
            reserved: reserved.into_iter().map(str::to_string).collect(),
        }
    }

    /// `(command, owner)` for every name in `commands` already owned by a
    /// plugin other than `plugin`.
    pub fn conflicts<'a>(
        &self,
        plugin: &str,
        commands: impl IntoIterator<Item = &'a str>,
    ) -> Vec<(String, String)> {
        commands
            .into_iter()
            .filter_map(|name| {
                if self.reserved.contains(name) {
                    return Some((name.to_string(), HOST_OWNER.to_string()));
                }
                self.commands
                    .get(name)
                    .filter(|d| d.plugin != plugin)
                    .map(|d| (name.to_string(), d.plugin.clone()))
            })
            .collect()
    }

    /// Register all of `plugin`'s commands. Without `force` a single conflict
    /// registers nothing. With `force` the current owner keeps the name and
    /// each conflict comes back as a warning.
    pub fn register(
        &mut self,
        plugin: &str,
        descriptors: Vec<CommandDescriptor>,
        force: bool,
    ) -> Result<Vec<String>> {
        let conflicts = self.conflicts(plugin, descriptors.iter().map(|d| d.name.as_str()));
        if let Some((command, owner)) = conflicts.first() {
            if !force {
                return Err(PluginError::CommandConflict {
                    command: command.clone(),
                    owner: owner.clone(),
                });
            }
        }

        // Drop names this plugin no longer provides.
        self.commands
            .retain(|_, d| d.plugin != plugin || descriptors.iter().any(|n| n.name == d.name));

        let mut warnings = Vec::new();
        for descriptor in descriptors {
            if let Some((_, owner)) = conflicts.iter().find(|(c, _)| *c == descriptor.name) {
                let warning = format!(
                    "command '{}' from {plugin} is shadowed: already provided by plugin '{owner}'",
                    descriptor.name
                );
                tracing::warn!("{warning}");
                warnings.push(warning);
                continue;
            }
            tracing::debug!(command = %descriptor.name, %plugin, "registered command");
            self.commands.insert(descriptor.name.clone(), descriptor);
        }
        Ok(warnings)
    }

    /// Remove every command owned by `plugin`. Returns the removed names.
    pub fn deregister(&mut self, plugin: &str) -> Vec<String> {
        let names: Vec<String> = self
            .commands
            .values()
            .filter(|d| d.plugin == plugin)
            .map(|d| d.name.clone())
            .collect();
        for name in &names {
            self.commands.remove(name);
        }
        if !names.is_empty() {
            tracing::debug!(%plugin, count = names.len(), "deregistered commands");
        }
        names
    }

    pub fn get(&self, command: &str) -> Option<&CommandDescriptor> {
        self.commands.get(command)
    }

    pub fn is_registered(&self, plugin: &str) -> bool {
        self.commands.values().any(|d| d.plugin == plugin)
    }

    pub fn commands_of(&self, plugin: &str) -> Vec<&CommandDescriptor> {
        self.commands.values().filter(|d| d.plugin == plugin).collect()
    }

    /// All live commands sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = &CommandDescriptor> {
        self.commands.values()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn dispatch(&self, invocation: &Invocation) -> Result<i32> {
        let descriptor = self.get(&invocation.command).ok_or_else(|| {
            PluginError::NotFound(format!("no plugin provides command '{}'", invocation.command))
        })?;
        descriptor.handler.execute(invocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Recorder {
        seen: Mutex<Vec<Invocation>>,
    }

    impl PluginHandler for Recorder {
        fn execute(&self, invocation: &Invocation) -> Result<i32> {
            self.seen.lock().unwrap().push(invocation.clone());
            Ok(0)
        }
    }

    fn descriptor(plugin: &str, name: &str, handler: Arc<dyn PluginHandler>) -> CommandDescriptor {
        CommandDescriptor {
            name: name.to_string(),
            plugin: plugin.to_string(),
            description: String::new(),
            options: Vec::new(),
            handler,
        }
    }

    fn noop(plugin: &str, name: &str) -> CommandDescriptor {
        descriptor(plugin, name, Arc::new(Recorder::default()))
    }

    #[test]
    fn register_and_dispatch() {
        let recorder = Arc::new(Recorder::default());
        let mut reg = CommandRegistry::new();
        reg.register("auth", vec![descriptor("auth", "auth", recorder.clone())], false)
            .unwrap();

        let mut inv = Invocation::new("auth");
        inv.args.push("login".into());
        assert_eq!(reg.dispatch(&inv).unwrap(), 0);
        assert_eq!(recorder.seen.lock().unwrap()[0].args, ["login"]);

        let err = reg.dispatch(&Invocation::new("nope")).unwrap_err();
        assert!(matches!(err, PluginError::NotFound(_)));
    }

    #[test]
    fn conflict_without_force_registers_nothing() {
        let mut reg = CommandRegistry::new();
        reg.register("auth", vec![noop("auth", "login")], false).unwrap();

        let err = reg
            .register("sso", vec![noop("sso", "sso"), noop("sso", "login")], false)
            .unwrap_err();
        assert!(matches!(err, PluginError::CommandConflict { ref owner, .. } if owner == "auth"));
        assert!(!reg.is_registered("sso"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn force_keeps_first_registrant() {
        let mut reg = CommandRegistry::new();
        reg.register("auth", vec![noop("auth", "login")], false).unwrap();

        let warnings = reg
            .register("sso", vec![noop("sso", "sso"), noop("sso", "login")], true)
            .unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("login"));
        assert_eq!(reg.get("login").unwrap().plugin, "auth");
        assert_eq!(reg.get("sso").unwrap().plugin, "sso");
    }

    #[test]
    fn host_commands_are_reserved() {
        let mut reg = CommandRegistry::new();
        let err = reg
            .register("evil", vec![noop("evil", "plugin")], false)
            .unwrap_err();
        assert!(matches!(err, PluginError::CommandConflict { ref owner, .. } if owner == HOST_OWNER));
        assert!(reg.is_empty());
    }

    #[test]
    fn reregistering_replaces_own_commands() {
        let mut reg = CommandRegistry::new();
        reg.register("auth", vec![noop("auth", "login"), noop("auth", "logout")], false)
            .unwrap();
        reg.register("auth", vec![noop("auth", "login")], false).unwrap();
        assert_eq!(reg.len(), 1);
        assert!(reg.get("logout").is_none());
    }

    #[test]
    fn deregister_removes_only_that_plugin() {
        let mut reg = CommandRegistry::new();
        reg.register("auth", vec![noop("auth", "login"), noop("auth", "logout")], false)
            .unwrap();
        reg.register("deploy", vec![noop("deploy", "deploy")], false).unwrap();

        let mut removed = reg.deregister("auth");
        removed.sort();
        assert_eq!(removed, ["login", "logout"]);
        assert!(!reg.is_registered("auth"));
        assert_eq!(reg.commands_of("deploy").len(), 1);
        assert!(reg.deregister("auth").is_empty());
    }

    #[test]
    fn invocation_renders_options_then_flags_then_args() {
        let mut inv = Invocation::new("gen");
        inv.options.insert("provider".into(), "github".into());
        inv.flags.insert("dry-run".into());
        inv.args.push("out".into());
        assert_eq!(inv.to_args(), ["--provider", "github", "--dry-run", "out"]);
    }

    #[cfg(unix)]
    #[test]
    fn process_handler_runs_entry_in_plugin_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("bin")).unwrap();
        std::fs::write(
            dir.path().join("bin/gen.sh"),
            "printf '%s|%s|%s\\n' \"$XAHEEN_PLUGIN_COMMAND\" \"$*\" \"$(basename \"$PWD\")\" > out.txt\nexit 3\n",
        )
        .unwrap();

        let handler = ProcessHandler::new(dir.path(), "bin/gen.sh", Some("sh"));
        let mut inv = Invocation::new("gen");
        inv.options.insert("name".into(), "api".into());
        inv.args.push("extra".into());

        assert_eq!(handler.execute(&inv).unwrap(), 3);
        let out = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        let base = dir.path().file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(out.trim(), format!("gen|--name api extra|{base}"));
    }

    #[test]
    fn missing_entry_is_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let handler = ProcessHandler::new(dir.path(), "bin/missing", None);
        let err = handler.execute(&Invocation::new("missing")).unwrap_err();
        assert!(matches!(err, PluginError::NotFound(_)), "{err}");
    }
}
