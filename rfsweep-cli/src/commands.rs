//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::DEFAULT_SWEEP_FILE;
use rfsweep_core::{AuthToken, SweepConfig};
use std::path::Path;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    sweep_file: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, workspace, sweep_file).await,
    }
}

async fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    sweep_file: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let sweep_path = workspace.join(DEFAULT_SWEEP_FILE);
            if sweep_path.exists() {
                println!("Sweep file already exists at: {}", sweep_path.display());
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&SweepConfig::template())?;
            std::fs::write(&sweep_path, &toml_str)?;
            println!("Created starter sweep file at: {}", sweep_path.display());
            Ok(())
        }
        ConfigAction::Show => {
            let config = rfsweep_core::load_config(Some(workspace), sweep_file)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let toml_str = toml::to_string_pretty(&redacted(config))?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

/// Replace every configured token so the config can be printed.
fn redacted(mut config: SweepConfig) -> SweepConfig {
    let mask = |token: &AuthToken| {
        if token.is_empty() {
            AuthToken::default()
        } else {
            AuthToken::new("<redacted>")
        }
    };
    config.auth_token = mask(&config.auth_token);
    for entry in &mut config.experiments {
        entry.auth_token = entry.auth_token.as_ref().map(mask);
    }
    config
}
