// Stagehand CLI
//
// Design Decision: The binary owns the Engine lifecycle; every command that
// builds an engine shuts it down explicitly before exiting.
// Design Decision: Flags override environment variables, which override defaults.

mod commands;
mod output;
mod telemetry;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use stagehand_exec::EngineConfig;

use telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(about = "Stagehand - Run editor processes through a bounded, circuit-protected pool")]
#[command(version)]
pub struct Cli {
    /// Output format
    #[arg(long, short, global = true, default_value = "text", value_parser = ["text", "json", "yaml"])]
    pub output: String,

    #[command(flatten)]
    pub engine: EngineArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Engine settings; each falls back to its environment variable
#[derive(Args, Debug)]
pub struct EngineArgs {
    /// Maximum concurrent processes
    #[arg(long, global = true, env = "STAGEHAND_MAX_WORKERS")]
    pub max_workers: Option<usize>,

    /// Maximum queued tasks
    #[arg(long, global = true, env = "STAGEHAND_MAX_QUEUE_SIZE")]
    pub max_queue_size: Option<usize>,

    /// Default per-task timeout in milliseconds (0 disables)
    #[arg(long, global = true, env = "STAGEHAND_DEFAULT_TIMEOUT_MS")]
    pub default_timeout_ms: Option<u64>,

    /// Failures within the window that open the circuit
    #[arg(long, global = true, env = "STAGEHAND_CB_FAILURE_THRESHOLD")]
    pub failure_threshold: Option<u32>,

    /// How long running tasks get to finish on shutdown, in milliseconds
    #[arg(
        long,
        global = true,
        env = "STAGEHAND_SHUTDOWN_GRACE_MS",
        default_value_t = 5000
    )]
    pub shutdown_grace_ms: u64,
}

impl EngineArgs {
    /// Environment config with flag overrides applied
    pub fn resolve(&self) -> Result<EngineConfig> {
        let mut config =
            EngineConfig::from_env().context("Failed to read engine configuration")?;

        if let Some(n) = self.max_workers {
            config.pool.max_workers = n;
        }
        if let Some(n) = self.max_queue_size {
            config.pool.max_queue_size = n;
        }
        if let Some(ms) = self.default_timeout_ms {
            config.pool.default_timeout = std::time::Duration::from_millis(ms);
        }
        if let Some(n) = self.failure_threshold {
            config.circuit_breaker.failure_threshold = n;
        }

        config.validate().context("Invalid engine configuration")?;
        Ok(config)
    }

    pub fn shutdown_grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a command through the engine and print the results
    Run {
        /// Executable to run
        command: String,

        /// Arguments, passed to the executable as-is
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Working directory for the process
        #[arg(long)]
        cwd: Option<std::path::PathBuf>,

        /// Timeout in milliseconds (overrides the default)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Submit the command this many times concurrently
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        repeat: u32,
    },

    /// Check whether an invocation would pass the injection check
    Check {
        /// Executable to check
        command: String,

        /// Arguments to check
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Print the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let dotenv = dotenvy::dotenv();

    init_telemetry(TelemetryConfig::from_env());
    if let Ok(path) = dotenv {
        tracing::debug!(path = %path.display(), "Loaded environment file");
    }

    let cli = Cli::parse();
    let output_format = output::OutputFormat::from_str(&cli.output);

    match cli.command {
        Commands::Run {
            command,
            args,
            cwd,
            timeout_ms,
            repeat,
        } => {
            let request = commands::run::RunRequest {
                command,
                args,
                cwd,
                timeout_ms,
                repeat,
            };
            commands::run::run(&cli.engine, request, output_format).await
        }
        Commands::Check { command, args } => {
            commands::check::run(&command, &args, output_format)
        }
        Commands::Config => commands::config::run(&cli.engine, output_format),
    }
}
