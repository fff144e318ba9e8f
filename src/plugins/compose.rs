//! Attach installed plugins to the CLI command tree.
//!
//! Each plugin becomes a subcommand named after the plugin and each declared
//! command a nested subcommand, so two plugins may both declare `install`
//! without clashing: `devstrap apt install git`, `devstrap brew install git`.
//! Arguments after the command are captured raw and forwarded unparsed.

use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing::warn;

use super::types::{InstalledPlugin, PluginCommand};

/// Top-level names owned by the runtime itself.
pub const RESERVED_COMMANDS: &[&str] = &["plugin", "help", "version", "status"];

const RAW_ARGS: &str = "args";

/// A resolved plugin invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInvocation {
    pub plugin: String,
    /// `[command, raw args...]`, or just the raw args for a plugin that
    /// declares no commands.
    pub args: Vec<String>,
}

/// Add one subcommand tree per plugin to `root`. Returns the augmented tree
/// and a warning for every plugin or command that was skipped.
pub fn register_commands(root: Command, plugins: &[InstalledPlugin]) -> (Command, Vec<String>) {
    let mut warnings = Vec::new();
    let taken: Vec<String> = root
        .get_subcommands()
        .map(|c| c.get_name().to_string())
        .collect();

    let mut root = root;
    for plugin in plugins {
        let name = plugin.name();
        if RESERVED_COMMANDS.contains(&name) || taken.iter().any(|t| t == name) {
            let message = format!(
                "plugin '{}' clashes with a built-in command and was not registered",
                name
            );
            warn!(plugin = %name, "{}", message);
            warnings.push(message);
            continue;
        }
        root = root.subcommand(plugin_command(plugin, &mut warnings));
    }

    (root, warnings)
}

fn plugin_command(plugin: &InstalledPlugin, warnings: &mut Vec<String>) -> Command {
    let about = if plugin.description().is_empty() {
        format!("{} plugin", plugin.name())
    } else {
        plugin.description().to_string()
    };
    let mut cmd = Command::new(plugin.name().to_string())
        .about(about)
        .version(plugin.version().to_string());

    let mut registered = 0;
    for command in plugin.commands() {
        if command.name == "help" {
            let message = format!(
                "command 'help' of plugin '{}' is reserved and was not registered",
                plugin.name()
            );
            warn!(plugin = %plugin.name(), "{}", message);
            warnings.push(message);
            continue;
        }
        cmd = cmd.subcommand(command_for(command));
        registered += 1;
    }

    if registered > 0 {
        cmd.subcommand_required(true).arg_required_else_help(true)
    } else {
        cmd.arg(raw_args())
    }
}

fn command_for(command: &PluginCommand) -> Command {
    let mut cmd = Command::new(command.name.clone())
        .about(command.description.clone())
        .arg(raw_args());

    if let Some(usage) = command.usage.as_deref() {
        cmd = cmd.override_usage(usage.to_string());
    }
    if !command.flags.is_empty() {
        let mut help = String::from("Flags:\n");
        for flag in &command.flags {
            help.push_str("  ");
            help.push_str(&flag.help_line());
            help.push('\n');
        }
        cmd = cmd.after_help(help);
    }
    cmd
}

fn raw_args() -> Arg {
    Arg::new(RAW_ARGS)
        .action(ArgAction::Append)
        .num_args(0..)
        .trailing_var_arg(true)
        .allow_hyphen_values(true)
        .value_name("ARGS")
}

/// Turn parsed matches into a plugin invocation, if the selected top-level
/// subcommand is one of `plugins`.
pub fn resolve_invocation(
    matches: &ArgMatches,
    plugins: &[InstalledPlugin],
) -> Option<PluginInvocation> {
    let (name, sub) = matches.subcommand()?;
    let plugin = plugins.iter().find(|p| p.name() == name)?;

    let mut args = Vec::new();
    match sub.subcommand() {
        Some((command, command_matches)) => {
            args.push(command.to_string());
            args.extend(raw_values(command_matches));
        }
        None => args.extend(raw_values(sub)),
    }

    Some(PluginInvocation {
        plugin: plugin.name().to_string(),
        args,
    })
}

fn raw_values(matches: &ArgMatches) -> Vec<String> {
    matches
        .try_get_many::<String>(RAW_ARGS)
        .ok()
        .flatten()
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}
