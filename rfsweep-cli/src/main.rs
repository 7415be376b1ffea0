//! rfsweep CLI: runs declarative train/render sweeps.
//!
//! Reads a sweep file, launches each enabled experiment's stages in order and
//! exits with the status of the last program it ran.

mod commands;
mod run;

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// rfsweep: sequential experiment sweeps for radiance-field editing
#[derive(Parser, Debug)]
#[command(name = "rfsweep", version, about, long_about = None)]
struct Cli {
    /// GPU index for experiments that do not set their own
    #[arg(short = 'g', long = "gpu_num", visible_alias = "gpu")]
    gpu: Option<u32>,

    /// Hugging Face auth token passed to both stages
    #[arg(short = 'a', long = "hf_auth_token", visible_alias = "hf-auth-token")]
    hf_auth_token: Option<String>,

    /// Sweep file (defaults to sweep.toml in the workspace, if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Workspace directory the external programs run in
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Stop at the first failing stage
    #[arg(long)]
    fail_fast: bool,

    /// Per-stage timeout in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Capture child output into the report instead of the terminal
    #[arg(long)]
    capture: bool,

    /// Print the planned commands without launching anything
    #[arg(long)]
    dry_run: bool,

    /// Write a JSON report of the sweep to this path
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a starter sweep file into the workspace
    Init,
    /// Show the merged configuration
    Show,
}

/// Default sweep file looked up in the workspace.
const DEFAULT_SWEEP_FILE: &str = "sweep.toml";

impl Cli {
    fn sweep_file(&self, workspace: &Path) -> Option<PathBuf> {
        match &self.config {
            Some(path) => Some(path.clone()),
            None => {
                let default = workspace.join(DEFAULT_SWEEP_FILE);
                default.exists().then_some(default)
            }
        }
    }

    /// Apply flag overrides on top of the layered configuration.
    fn apply_overrides(&self, config: &mut rfsweep_core::SweepConfig) {
        if let Some(gpu) = self.gpu {
            config.gpu_id = gpu;
        }
        if let Some(token) = &self.hf_auth_token {
            config.auth_token = rfsweep_core::AuthToken::new(token.clone());
        }
        if self.fail_fast {
            config.policy = rfsweep_core::FailurePolicy::FailFast;
        }
        if let Some(secs) = self.timeout {
            config.stage_timeout_secs = Some(secs);
        }
        if self.capture {
            config.capture_output = true;
        }
    }
}

/// Canonical workspace path; the directory must already exist.
fn resolve_workspace(path: &Path) -> anyhow::Result<PathBuf> {
    let workspace = path
        .canonicalize()
        .with_context(|| format!("Workspace {} does not exist", path.display()))?;
    anyhow::ensure!(
        workspace.is_dir(),
        "Workspace {} is not a directory",
        path.display()
    );
    Ok(workspace)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let mut cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "rfsweep", "rfsweep")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "rfsweep.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = resolve_workspace(&cli.workspace)?;
    let sweep_file = cli.sweep_file(&workspace);

    if let Some(command) = cli.command.take() {
        return commands::handle_command(command, &workspace, sweep_file.as_deref()).await;
    }

    let mut config = rfsweep_core::load_config(Some(&workspace), sweep_file.as_deref())
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    cli.apply_overrides(&mut config);

    let request = run::RunRequest {
        config,
        workspace,
        dry_run: cli.dry_run,
        report_path: cli.report.clone(),
        quiet: cli.quiet,
    };
    let code = run::run(request).await?;

    // Flush the file log before exiting with the sweep's status.
    drop(guard);
    std::process::exit(code);
}
