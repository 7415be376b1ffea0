//! Pipeline stages and their argument schemas.
//!
//! Each stage has a fixed schema: required fields become short positional-style
//! flags, optional knobs become named `--flag value` pairs. Everything is
//! validated before a process is started.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::config::{RendererConfig, TrainerConfig};
use crate::device::StageEnv;
use crate::error::ConfigError;
use crate::experiment::{AuthToken, ExperimentConfig};
use crate::paths::PathConvention;

/// One phase of the external pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Train,
    Render,
}

impl Stage {
    /// Checkpoint that must exist before the stage can start.
    pub fn input_path(self, paths: &PathConvention) -> &Path {
        match self {
            Stage::Train => &paths.reference_checkpoint,
            Stage::Render => &paths.checkpoint,
        }
    }

    /// Directory the stage writes into.
    pub fn output_dir(self, paths: &PathConvention) -> &Path {
        match self {
            Stage::Train => &paths.log_dir,
            Stage::Render => &paths.render_dir,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Train => write!(f, "train"),
            Stage::Render => write!(f, "render"),
        }
    }
}

/// Trainer flags owned by the schema; hyperparameters may not shadow them.
const RESERVED_TRAIN_FLAGS: &[&str] = &[
    "data_path",
    "output_path",
    "ref_model_path",
    "prompt",
    "hf_auth_token",
    "edit_idx",
    "object_idx",
    "do_refinement",
    "directional_dataset",
    "log_wandb",
];

/// A fully marshalled external program call.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub stage: Stage,
    pub program: String,
    pub args: Vec<String>,
    pub env: StageEnv,
    /// Position of the auth token value in `args`, masked when displayed.
    secret_arg: Option<usize>,
}

impl Invocation {
    /// A call carrying no secret arguments.
    pub fn new(
        stage: Stage,
        program: impl Into<String>,
        args: Vec<String>,
        env: StageEnv,
    ) -> Self {
        Self {
            stage,
            program: program.into(),
            args,
            env,
            secret_arg: None,
        }
    }

    /// Shell-like rendering for logs and dry runs, with the token masked.
    pub fn display_line(&self) -> String {
        let mut parts: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{k}={}", quote(v)))
            .collect();
        parts.push(quote(&self.program));
        for (i, arg) in self.args.iter().enumerate() {
            if Some(i) == self.secret_arg {
                parts.push("***".into());
            } else {
                parts.push(quote(arg));
            }
        }
        parts.join(" ")
    }
}

fn quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Incremental argument list builder.
#[derive(Debug, Default)]
struct ArgBuilder {
    args: Vec<String>,
    secret_arg: Option<usize>,
}

impl ArgBuilder {
    fn with_prefix(prefix: &[String]) -> Self {
        Self {
            args: prefix.to_vec(),
            secret_arg: None,
        }
    }

    fn flag(mut self, name: &str, value: impl ToString) -> Self {
        self.args.push(name.to_string());
        self.args.push(value.to_string());
        self
    }

    fn path(self, name: &str, value: &Path) -> Self {
        let value = value.to_string_lossy().into_owned();
        self.flag(name, value)
    }

    fn optional(self, name: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(v) => self.flag(name, v),
            None => self,
        }
    }

    /// Python-style boolean, as the external CLIs parse it.
    fn boolean(self, name: &str, value: bool) -> Self {
        self.flag(name, if value { "True" } else { "False" })
    }

    fn secret(mut self, name: &str, token: &AuthToken) -> Self {
        if token.is_empty() {
            return self;
        }
        self.args.push(name.to_string());
        self.secret_arg = Some(self.args.len());
        self.args.push(token.expose().to_string());
        self
    }

    fn finish(self, stage: Stage, program: &str, env: StageEnv) -> Invocation {
        Invocation {
            stage,
            program: program.to_string(),
            args: self.args,
            env,
            secret_arg: self.secret_arg,
        }
    }
}

fn validate_common(config: &ExperimentConfig, program: &str) -> Result<(), ConfigError> {
    if program.trim().is_empty() {
        return Err(ConfigError::MissingField {
            field: "program".into(),
        });
    }
    if config.prompt.trim().is_empty() {
        return Err(ConfigError::MissingField {
            field: "prompt".into(),
        });
    }
    Ok(())
}

fn validate_hyperparameters(config: &ExperimentConfig) -> Result<(), ConfigError> {
    for (key, value) in &config.hyperparameters {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ConfigError::InvalidHyperparameter {
                key: key.clone(),
                reason: "keys may only contain ASCII letters, digits and '_'".into(),
            });
        }
        if RESERVED_TRAIN_FLAGS.contains(&key.as_str()) {
            return Err(ConfigError::InvalidHyperparameter {
                key: key.clone(),
                reason: "set by the experiment fields, not as a hyperparameter".into(),
            });
        }
        if !value.is_finite() {
            return Err(ConfigError::InvalidHyperparameter {
                key: key.clone(),
                reason: format!("value {value} is not finite"),
            });
        }
    }
    Ok(())
}

/// Build the trainer call for an experiment.
pub fn train_invocation(
    config: &ExperimentConfig,
    paths: &PathConvention,
    trainer: &TrainerConfig,
) -> Result<Invocation, ConfigError> {
    validate_common(config, &trainer.program)?;
    validate_hyperparameters(config)?;

    let mut builder = ArgBuilder::with_prefix(&trainer.args)
        .path("-d", &paths.data_dir)
        .path("-o", &paths.log_dir)
        .path("-i", &paths.reference_checkpoint)
        .flag("-p", &config.prompt)
        .flag("-eidx", config.epoch_index)
        .optional("-oidx", config.object_index)
        .secret("-a", &config.auth_token)
        .boolean("--do_refinement", config.refine)
        .boolean("--directional_dataset", config.directional)
        .boolean("--log_wandb", trainer.log_wandb);

    for (key, value) in &config.hyperparameters {
        builder = builder.flag(&format!("--{key}"), value);
    }

    Ok(builder.finish(Stage::Train, &trainer.program, StageEnv::for_gpu(config.gpu_id)))
}

/// Build the renderer call for an experiment.
pub fn render_invocation(
    config: &ExperimentConfig,
    paths: &PathConvention,
    renderer: &RendererConfig,
) -> Result<Invocation, ConfigError> {
    validate_common(config, &renderer.program)?;
    if renderer.save_frequency == 0 {
        return Err(ConfigError::Invalid {
            message: "renderer.save_frequency must be at least 1".into(),
        });
    }

    let builder = ArgBuilder::with_prefix(&renderer.args)
        .path("-i", &paths.checkpoint)
        .path("-o", &paths.render_dir)
        .path("-d", &paths.data_dir)
        .flag("-p", &config.prompt)
        .flag("-eidx", config.epoch_index)
        .flag("--save_freq", renderer.save_frequency)
        .secret("-a", &config.auth_token)
        .boolean("--directional_dataset", config.directional);

    Ok(builder.finish(Stage::Render, &renderer.program, StageEnv::for_gpu(config.gpu_id)))
}

/// Build the call for any stage.
pub fn build_invocation(
    stage: Stage,
    config: &ExperimentConfig,
    paths: &PathConvention,
    trainer: &TrainerConfig,
    renderer: &RendererConfig,
) -> Result<Invocation, ConfigError> {
    match stage {
        Stage::Train => train_invocation(config, paths, trainer),
        Stage::Render => render_invocation(config, paths, renderer),
    }
}
