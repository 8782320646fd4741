//! Strategy guard CLI.
//!
//! Operator tooling around the strategy loader:
//! - `analyze` - static analysis verdict for a strategy file
//! - `run` - load a file through the full pipeline and execute it
//! - `audit` - query and verify an audit log
//! - `config` - show the effective configuration
//!
//! # Examples
//!
//! ```bash
//! stratguard analyze breakout.py --strict
//! stratguard run breakout.py --class Breakout --data prices.json
//! stratguard --format json audit /var/log/stratguard/audit.jsonl --verify
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use stratguard_cli::commands::{self, audit::AuditQuery, run::RunArgs};
use stratguard_cli::{ExitCode, OutputFormat};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Sandboxed loading and execution of trading strategies.
#[derive(Parser, Debug)]
#[command(name = "stratguard")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Pretty)]
    format: OutputFormat,

    /// Configuration file
    #[arg(long, global = true, env = "STRATGUARD_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyze a strategy file and print the sanitizer verdict.
    ///
    /// Exits with 3 when a loader in the chosen mode would reject the code.
    Analyze {
        /// Strategy source file
        file: PathBuf,

        /// Admit only code without findings
        #[arg(long, conflicts_with = "lenient")]
        strict: bool,

        /// Admit low and medium risk code with warnings
        #[arg(long)]
        lenient: bool,
    },

    /// Load a strategy and execute one operation over a price file.
    Run {
        /// Strategy source file, or JSON parameters with `--source-type builtin`
        file: PathBuf,

        /// Class to load
        #[arg(long = "class")]
        class_name: String,

        /// JSON price file: an array of closes or an object of OHLCV columns
        #[arg(long)]
        data: PathBuf,

        /// Operation to run
        #[arg(long, default_value = "generate_signals")]
        op: String,

        /// Strategy id recorded in the audit log (default: file stem)
        #[arg(long)]
        id: Option<String>,

        /// Source type: ai, custom or builtin
        #[arg(long, default_value = "custom")]
        source_type: String,

        /// Admit only code without findings
        #[arg(long, conflicts_with = "lenient")]
        strict: bool,

        /// Admit low and medium risk code with warnings
        #[arg(long)]
        lenient: bool,
    },

    /// Query an audit log file.
    Audit {
        /// JSON Lines audit log
        log: PathBuf,

        /// Only events of this type (e.g. security_violation)
        #[arg(long)]
        event_type: Option<String>,

        /// Only events about this strategy or execution id
        #[arg(long)]
        subject: Option<String>,

        /// Only events with this outcome label
        #[arg(long)]
        outcome: Option<String>,

        /// Show at most the last N matches
        #[arg(long)]
        limit: Option<usize>,

        /// Verify the hash chain over the whole file; exits with 5 if broken
        #[arg(long)]
        verify: bool,
    },

    /// Show the configuration source, and the full configuration with --show.
    Config {
        /// Print every setting
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;
    let exit_code = execute_command(cli).await?;
    std::process::exit(exit_code.as_i32());
}

/// Logs to stderr so stdout stays parseable with `--format json`.
fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    Ok(())
}

async fn execute_command(cli: Cli) -> Result<ExitCode> {
    let (config, source) = commands::load_config(cli.config.as_deref())?;
    let format = cli.format;

    match cli.command {
        Commands::Analyze {
            file,
            strict,
            lenient,
        } => {
            let strict_mode = commands::resolve_strictness(&config, strict, lenient);
            commands::analyze::run(&file, strict_mode, &config, format)
        }
        Commands::Run {
            file,
            class_name,
            data,
            op,
            id,
            source_type,
            strict,
            lenient,
        } => {
            let args = RunArgs {
                file,
                class_name,
                data,
                op,
                id,
                source_type,
                strict_mode: commands::resolve_strictness(&config, strict, lenient),
            };
            commands::run::run(args, &config, format).await
        }
        Commands::Audit {
            log,
            event_type,
            subject,
            outcome,
            limit,
            verify,
        } => {
            let query = AuditQuery {
                event_type,
                subject,
                outcome,
                limit,
                verify,
            };
            commands::audit::run(&log, &query, format)
        }
        Commands::Config { show } => commands::config::run(&config, &source, show, format),
    }
}
