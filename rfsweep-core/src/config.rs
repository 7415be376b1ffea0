//! Configuration system for rfsweep.
//!
//! Uses `figment` for layered configuration: defaults -> user config ->
//! workspace config -> sweep file -> environment. CLI flags are applied on top
//! by the binary. The user config lives at `~/.config/rfsweep/config.toml`,
//! the workspace config at `.rfsweep/config.toml`.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::experiment::{AuthToken, ExperimentConfig, ExperimentEntry};

/// What the sweep does after a stage exits non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Report the failure and move on to the next experiment.
    #[default]
    Continue,
    /// Stop the sweep at the first failing stage.
    FailFast,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Continue => write!(f, "continue"),
            FailurePolicy::FailFast => write!(f, "fail_fast"),
        }
    }
}

/// Roots of the on-disk layout shared with the trainer and renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Root of training logs and checkpoints.
    pub logs_root: PathBuf,
    /// Root of rendered output.
    pub renders_root: PathBuf,
    /// Root of the per-scene input datasets.
    pub data_root: PathBuf,
    /// Log name of the pretrained model each scene's edits start from.
    pub reference_log_name: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            logs_root: PathBuf::from("logs/rf"),
            renders_root: PathBuf::from("output_renders"),
            data_root: PathBuf::from("data"),
            reference_log_name: "ref".into(),
        }
    }
}

/// External training program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub program: String,
    /// Arguments placed before the generated ones (typically the script path).
    pub args: Vec<String>,
    /// Enable the trainer's experiment-tracking upload.
    pub log_wandb: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            program: "python".into(),
            args: vec!["edit_pretrained_relu_field.py".into()],
            log_wandb: false,
        }
    }
}

/// External rendering program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Save every n-th rendered frame.
    pub save_frequency: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            program: "python".into(),
            args: vec!["render_sh_based_voxel_grid_attn.py".into()],
            save_frequency: 1,
        }
    }
}

/// Top-level sweep configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Naming prefix inserted into log and render paths; empty for none.
    pub sweep_name: String,
    /// GPU used by entries that do not set their own.
    pub gpu_id: u32,
    /// Token used by entries that do not set their own.
    pub auth_token: AuthToken,
    pub policy: FailurePolicy,
    /// Per-stage timeout; absent or zero means no timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_timeout_secs: Option<u64>,
    /// Capture child stdout/stderr into the report instead of inheriting.
    pub capture_output: bool,
    pub layout: LayoutConfig,
    pub trainer: TrainerConfig,
    pub renderer: RendererConfig,
    pub experiments: Vec<ExperimentEntry>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            sweep_name: String::new(),
            gpu_id: 0,
            auth_token: AuthToken::default(),
            policy: FailurePolicy::Continue,
            stage_timeout_secs: None,
            capture_output: false,
            layout: LayoutConfig::default(),
            trainer: TrainerConfig::default(),
            renderer: RendererConfig::default(),
            experiments: Vec::new(),
        }
    }
}

impl SweepConfig {
    /// Resolve every entry against the sweep-level GPU and token, in file order.
    pub fn resolve_experiments(&self) -> Vec<ExperimentConfig> {
        self.experiments
            .iter()
            .map(|entry| entry.resolve(self.gpu_id, &self.auth_token))
            .collect()
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// A starter sweep file with one example experiment.
    pub fn template() -> Self {
        let example = ExperimentConfig::new(
            "dog2",
            "a render of a dog with a party hat",
            "party_hat2",
            9,
        )
        .with_hyperparameter("learning_rate", 0.03);
        let mut entry = ExperimentEntry::from(&example);
        entry.gpu_id = None;
        Self {
            experiments: vec![entry],
            ..Self::default()
        }
    }
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "rfsweep", "rfsweep")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Path of the workspace-level configuration file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".rfsweep").join("config.toml")
}

/// Load the layered configuration.
///
/// `sweep_file`, when given, must exist; the user and workspace files are
/// optional.
pub fn load_config(
    workspace: Option<&Path>,
    sweep_file: Option<&Path>,
) -> Result<SweepConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(SweepConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = sweep_file {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    // RFSWEEP_AUTH_TOKEN, RFSWEEP_LAYOUT__LOGS_ROOT, etc.
    figment = figment.merge(Env::prefixed("RFSWEEP_").split("__"));

    figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })
}
