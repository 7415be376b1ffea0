//! Experiment configurations: the on-disk entries of a sweep file and the
//! resolved, immutable records the orchestrator consumes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::stage::Stage;

/// Named numeric hyperparameters forwarded to the trainer as `--<key> <value>`.
///
/// A sorted map so argument order is stable across runs.
pub type Hyperparameters = BTreeMap<String, f64>;

/// Hugging Face auth token forwarded to the external programs.
///
/// The value never appears in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw token, for building argument lists only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("AuthToken(<empty>)")
        } else {
            f.write_str("AuthToken(<redacted>)")
        }
    }
}

impl From<&str> for AuthToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AuthToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifies an experiment in logs and failure reports as `scene/log_name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ExperimentId {
    pub scene: String,
    pub log_name: String,
}

impl ExperimentId {
    pub fn new(scene: impl Into<String>, log_name: impl Into<String>) -> Self {
        Self {
            scene: scene.into(),
            log_name: log_name.into(),
        }
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scene, self.log_name)
    }
}

fn default_true() -> bool {
    true
}

fn default_stages() -> Vec<Stage> {
    vec![Stage::Train, Stage::Render]
}

/// One `[[experiments]]` record of a sweep file.
///
/// `gpu_id` and `auth_token` fall back to the sweep-level values when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentEntry {
    pub scene: String,
    pub prompt: String,
    pub log_name: String,
    pub epoch_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_id: Option<u32>,
    #[serde(default)]
    pub directional: bool,
    /// Run the trainer's refinement pass and consume the refined checkpoint.
    #[serde(default = "default_true")]
    pub refine: bool,
    /// Disabled entries stay in the file but are skipped by the sweep.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_stages")]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub hyperparameters: Hyperparameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<AuthToken>,
}

impl ExperimentEntry {
    /// Resolve the entry against sweep-level defaults.
    pub fn resolve(&self, default_gpu: u32, default_token: &AuthToken) -> ExperimentConfig {
        ExperimentConfig {
            scene: self.scene.clone(),
            prompt: self.prompt.clone(),
            log_name: self.log_name.clone(),
            epoch_index: self.epoch_index,
            object_index: self.object_index,
            gpu_id: self.gpu_id.unwrap_or(default_gpu),
            directional: self.directional,
            refine: self.refine,
            enabled: self.enabled,
            stages: self.stages.clone(),
            hyperparameters: self.hyperparameters.clone(),
            auth_token: self
                .auth_token
                .clone()
                .unwrap_or_else(|| default_token.clone()),
        }
    }
}

impl From<&ExperimentConfig> for ExperimentEntry {
    fn from(config: &ExperimentConfig) -> Self {
        Self {
            scene: config.scene.clone(),
            prompt: config.prompt.clone(),
            log_name: config.log_name.clone(),
            epoch_index: config.epoch_index,
            object_index: config.object_index,
            gpu_id: Some(config.gpu_id),
            directional: config.directional,
            refine: config.refine,
            enabled: config.enabled,
            stages: config.stages.clone(),
            hyperparameters: config.hyperparameters.clone(),
            auth_token: None,
        }
    }
}

/// A fully resolved experiment, consumed once per run.
///
/// Built from an [`ExperimentEntry`] or with [`ExperimentConfig::new`] and the
/// `with_*` builders; the orchestrator only ever borrows it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentConfig {
    pub scene: String,
    pub prompt: String,
    pub log_name: String,
    pub epoch_index: u32,
    pub object_index: Option<u32>,
    pub gpu_id: u32,
    pub directional: bool,
    pub refine: bool,
    pub enabled: bool,
    pub stages: Vec<Stage>,
    pub hyperparameters: Hyperparameters,
    #[serde(skip)]
    pub auth_token: AuthToken,
}

impl ExperimentConfig {
    pub fn new(
        scene: impl Into<String>,
        prompt: impl Into<String>,
        log_name: impl Into<String>,
        epoch_index: u32,
    ) -> Self {
        Self {
            scene: scene.into(),
            prompt: prompt.into(),
            log_name: log_name.into(),
            epoch_index,
            object_index: None,
            gpu_id: 0,
            directional: false,
            refine: true,
            enabled: true,
            stages: default_stages(),
            hyperparameters: Hyperparameters::new(),
            auth_token: AuthToken::default(),
        }
    }

    pub fn with_gpu(mut self, gpu_id: u32) -> Self {
        self.gpu_id = gpu_id;
        self
    }

    pub fn with_object_index(mut self, object_index: u32) -> Self {
        self.object_index = Some(object_index);
        self
    }

    pub fn with_directional(mut self, directional: bool) -> Self {
        self.directional = directional;
        self
    }

    pub fn with_refine(mut self, refine: bool) -> Self {
        self.refine = refine;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_stages(mut self, stages: &[Stage]) -> Self {
        self.stages = stages.to_vec();
        self
    }

    pub fn with_hyperparameter(mut self, key: impl Into<String>, value: f64) -> Self {
        self.hyperparameters.insert(key.into(), value);
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<AuthToken>) -> Self {
        self.auth_token = token.into();
        self
    }

    pub fn id(&self) -> ExperimentId {
        ExperimentId::new(&self.scene, &self.log_name)
    }
}
