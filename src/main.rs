mod cli;

use std::process::ExitCode;

use anyhow::Context;
use clap::{CommandFactory, FromArgMatches, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use devstrap::plugins::{register_commands, resolve_invocation};
use devstrap::security::validate_plugin_name;
use devstrap::{Bootstrap, Config, DevstrapError};

#[derive(Parser)]
#[command(name = "devstrap")]
#[command(about = "Bootstrap a developer machine with platform-aware plugins", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage plugins
    Plugin {
        #[command(subcommand)]
        action: PluginAction,
    },
    /// Show platform, cache and plugin status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum PluginAction {
    /// List installed plugins
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Search the plugin registry
    Search {
        /// Matches name, description and tags; empty lists everything
        query: Option<String>,
    },
    /// Install a plugin from the registry
    Install { name: String },
    /// Remove an installed plugin
    Remove { name: String },
    /// Refresh the registry and reinstall outdated plugins
    Update {
        /// Reinstall only this plugin
        name: Option<String>,
    },
    /// Show details of a plugin
    Info { name: String },
    /// Show the configured registry
    Registry,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().collect();
    let early = cli::logging::EarlyFlags::scan(&args);
    cli::logging::init(early.verbose, early.json);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let devstrap_err = err.downcast_ref::<DevstrapError>();
            let code = devstrap_err.map(DevstrapError::exit_code).unwrap_or(1);
            // The plugin already reported its own failure.
            if !matches!(devstrap_err, Some(DevstrapError::PluginExit { .. })) {
                eprintln!("Error: {:#}", err);
            }
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

/// Plugin name named by a built-in `plugin` subcommand, if any.
fn requested_plugin_name(cli: &Cli) -> Option<&str> {
    match &cli.command {
        Some(Commands::Plugin { action }) => match action {
            PluginAction::Install { name }
            | PluginAction::Remove { name }
            | PluginAction::Info { name } => Some(name.as_str()),
            PluginAction::Update { name } => name.as_deref(),
            _ => None,
        },
        _ => None,
    }
}

async fn run(args: Vec<String>) -> anyhow::Result<()> {
    // Checks that need neither the network nor the plugin directory.
    if let Ok(cli) = Cli::try_parse_from(&args) {
        if let Some(Commands::Version) = cli.command {
            println!("devstrap {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        if let Some(name) = requested_plugin_name(&cli) {
            validate_plugin_name(name).map_err(DevstrapError::from)?;
        }
    }

    let config = Config::load().context("Failed to load configuration")?;
    let bootstrap = Bootstrap::new(config).context("Failed to set up devstrap")?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let summary = bootstrap.initialize(&cancel).await?;
    let plugins = bootstrap.manager().list_plugins().await;

    let (command, warnings) = register_commands(Cli::command(), &plugins);
    for warning in &warnings {
        debug!("{}", warning);
    }
    let matches = command.get_matches_from(&args);

    if let Some(invocation) = resolve_invocation(&matches, &plugins) {
        bootstrap
            .manager()
            .execute_plugin_with_cancel(&invocation.plugin, &invocation.args, &cancel)
            .await?;
        return Ok(());
    }

    let cli = Cli::from_arg_matches(&matches)?;
    debug!(verbose = cli.verbose, log_format = ?cli.log_format, "Parsed command line");
    match cli.command {
        None => {
            let (mut help, _) = register_commands(Cli::command(), &plugins);
            help.print_help()?;
        }
        Some(Commands::Version) => {
            println!("devstrap {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Status { json }) => {
            cli::status::cmd_status(&bootstrap, &summary, json).await?;
        }
        Some(Commands::Plugin { action }) => match action {
            PluginAction::List { json } => {
                cli::plugin::cmd_list(&bootstrap, &summary, json).await?
            }
            PluginAction::Search { query } => {
                cli::plugin::cmd_search(&bootstrap, query.as_deref().unwrap_or("")).await?
            }
            PluginAction::Install { name } => {
                cli::plugin::cmd_install(&bootstrap, &name, &cancel).await?
            }
            PluginAction::Remove { name } => cli::plugin::cmd_remove(&bootstrap, &name).await?,
            PluginAction::Update { name } => {
                cli::plugin::cmd_update(&bootstrap, name.as_deref(), &cancel).await?
            }
            PluginAction::Info { name } => cli::plugin::cmd_info(&bootstrap, &name).await?,
            PluginAction::Registry => cli::plugin::cmd_registry(&bootstrap).await?,
        },
    }

    Ok(())
}
