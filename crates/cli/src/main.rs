//! fanwatch CLI - fanwatch command

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cli_lib::{exit_code, MonitorConfig};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;

mod cmd;

const DEFAULT_CONFIG: &str = "/etc/fanwatch/fanwatch.toml";

/// fanwatch - File activity monitor built on fanotify
#[derive(Parser)]
#[command(name = "fanwatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor the configured paths until interrupted
    Run {
        /// Config file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Validate a config file
    Check {
        /// Config file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Show archived alerts and denials
    Journal {
        /// Config file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// Number of entries to show (default: 20)
        #[arg(long, default_value = "20")]
        limit: usize,

        /// Apply the retention policy instead of listing
        #[arg(long)]
        prune: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{:#}", err), "fanwatch failed");
            eprintln!("Error: {:#}", err);
            ExitCode::from(exit_code(&err))
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let flags = LogFlags {
        verbose: cli.verbose,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Run { config } => {
            let config = MonitorConfig::load(&config)?;
            let _guard = init_logging(flags, Some(&config))?;
            cmd::run::run(config, flags.verbose > 0).await
        }
        Commands::Check { config } => {
            let _guard = init_logging(flags, None)?;
            cmd::check::run(&config).await
        }
        Commands::Journal { config, limit, prune } => {
            let config = MonitorConfig::load(&config)?;
            let _guard = init_logging(flags, None)?;
            cmd::journal::run(config, limit, prune).await
        }
    }
}

#[derive(Clone, Copy)]
struct LogFlags {
    verbose: u8,
    quiet: bool,
}

/// Install the fmt subscriber. Flags win over the config's level; a config
/// log file replaces stderr.
fn init_logging(flags: LogFlags, config: Option<&MonitorConfig>) -> Result<Option<WorkerGuard>> {
    let level = if flags.quiet {
        Level::ERROR
    } else {
        match flags.verbose {
            0 => match config {
                Some(config) => config.log_level()?,
                None => Level::WARN,
            },
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let file = config.and_then(|config| config.logging.file.as_deref());
    match file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("Log file has no file name: {}", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}
