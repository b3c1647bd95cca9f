//! labterm
//!
//! Line-mode client for remote lab terminals.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use client::commands::{CommandError, SessionCommand};
use client::config::{default_config_path, Config, LogConfig};
use client::{EventKind, PhoenixSocket, Preferences, Session, SessionEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// labterm - remote lab terminal over Phoenix channels.
#[derive(Parser, Debug)]
#[command(name = "labterm")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Open an interactive terminal session
    Open {
        /// Lab to open (overrides lab.lab_slug)
        lab: Option<String>,

        /// Without a lab, open a temporary workspace instead of home
        #[arg(long)]
        temporary: bool,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Configuration subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration (token redacted)
    Show,

    /// Print the configuration file path
    Path,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

/// What one line typed at the prompt asks for.
#[derive(Debug, PartialEq, Eq)]
enum ReplAction {
    Quit,
    Command(SessionCommand),
    Input(String),
    Invalid(CommandError),
}

/// Lines starting with `:` are commands; anything else is shell input.
fn parse_repl_line(line: &str) -> ReplAction {
    let Some(command) = line.strip_prefix(':') else {
        return ReplAction::Input(format!("{}\r", line));
    };
    match command.trim() {
        "q" | "quit" | "exit" => ReplAction::Quit,
        _ => match SessionCommand::parse(command) {
            Ok(command) => ReplAction::Command(command),
            Err(e) => ReplAction::Invalid(e),
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    // Load configuration
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    match cli.command {
        Commands::Open { lab, temporary } => {
            if let Some(lab) = lab {
                config.lab.lab_slug = Some(lab);
            }
            if temporary {
                config.lab.open_on_home = false;
            }
            config.validate()?;

            let _guard = init_tracing(&config.log, cli.verbose)?;
            tracing::info!("Using config file: {:?}", config_path);
            run_session(&config).await?;
        }
        Commands::Config(command) => run_config_command(command, &config, &config_path)?,
    }

    Ok(())
}

/// Initialize tracing. Logs go to stderr unless `log.file` is set, since
/// stdout carries terminal output.
fn init_tracing(log: &LogConfig, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { log.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let Some(file) = &log.file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    };

    let dir = file
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = file
        .file_name()
        .with_context(|| format!("log.file has no file name: {}", file.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

/// Run an interactive session until `:quit`, end of input, or Ctrl-C.
async fn run_session(config: &Config) -> anyhow::Result<()> {
    let session_config = config
        .session_config()
        .context("Cannot open a session without credentials (set auth.token and auth.username)")?;

    let socket = Arc::new(PhoenixSocket::new(config.socket_config()));
    let prefs = Arc::new(Preferences::new(config.lab.open_on_home));
    let session = Arc::new(Session::with_preferences(session_config, socket, prefs));
    let channel = session.channel_name();

    session.on(EventKind::Message, |event| {
        if let SessionEvent::Message(bytes) = event {
            let mut stdout = std::io::stdout().lock();
            if let Err(e) = stdout.write_all(bytes).and_then(|_| stdout.flush()) {
                tracing::warn!(error = %e, "Failed to write terminal output");
            }
        }
    });
    session.on(EventKind::Open, move |_| {
        eprintln!("[connected to {}]", channel);
    });
    session.on(EventKind::Close, |_| {
        eprintln!("[session closed; :reset to reconnect]");
    });
    session.on(EventKind::Error, |event| {
        if let SessionEvent::Error(payload) = event {
            eprintln!("[session error: {}; :reset to reconnect]", payload);
        }
    });
    session.on(EventKind::JoinError, |event| {
        if let SessionEvent::JoinError(payload) = event {
            eprintln!("[could not join session: {}]", payload);
        }
    });

    // Listeners go in before the join so the first reply is never missed.
    session.start();
    session.connect();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    tracing::debug!("End of input");
                    break;
                };
                match parse_repl_line(&line) {
                    ReplAction::Quit => break,
                    ReplAction::Command(command) => command.dispatch(session.as_ref()),
                    ReplAction::Input(input) => session.send(input),
                    ReplAction::Invalid(e) => eprintln!("[{}]", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl-C");
                break;
            }
        }
    }

    session.shutdown();
    Ok(())
}

fn run_config_command(command: ConfigCommands, config: &Config, path: &Path) -> anyhow::Result<()> {
    match command {
        ConfigCommands::Show => {
            let mut shown = config.clone();
            if !shown.auth.token.is_empty() {
                shown.auth.token = "<redacted>".to_string();
            }
            print!("{}", shown.to_toml()?);
        }
        ConfigCommands::Path => println!("{}", path.display()),
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists: {} (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save(path)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}
