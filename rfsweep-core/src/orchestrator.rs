//! Sweep orchestrator: runs experiment stages one at a time, in order.
//!
//! Each stage is a single blocking external call. The orchestrator resolves
//! paths, checks the stage's input checkpoint, marshals arguments, launches
//! through a [`Launcher`] and records a [`RunResult`]. Failures are attributed
//! to `scene/log_name` and handled per [`FailurePolicy`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{FailurePolicy, LayoutConfig, RendererConfig, SweepConfig, TrainerConfig};
use crate::error::{ConfigError, RunError, StageError, SweepError};
use crate::experiment::{ExperimentConfig, ExperimentId};
use crate::launcher::{LaunchOptions, Launcher};
use crate::paths::{PathConvention, build_paths_with};
use crate::stage::{Invocation, Stage, build_invocation};

/// Exit code reported when the operator interrupts a sweep.
pub const CANCELLED_EXIT_CODE: i32 = 130;

/// Settings shared by every stage of a sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepOptions {
    pub sweep_name: String,
    /// Directory the external programs run in; layout paths are relative to it.
    pub workspace: PathBuf,
    pub layout: LayoutConfig,
    pub trainer: TrainerConfig,
    pub renderer: RendererConfig,
    pub policy: FailurePolicy,
    pub stage_timeout: Option<Duration>,
    pub capture_output: bool,
}

impl SweepOptions {
    pub fn from_config(config: &SweepConfig, workspace: PathBuf) -> Self {
        Self {
            sweep_name: config.sweep_name.clone(),
            workspace,
            layout: config.layout.clone(),
            trainer: config.trainer.clone(),
            renderer: config.renderer.clone(),
            policy: config.policy,
            stage_timeout: config.stage_timeout(),
            capture_output: config.capture_output,
        }
    }
}

/// Outcome of one launched stage.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub config: ExperimentConfig,
    pub stage: Stage,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    pub timed_out: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Everything a sweep did, in order.
#[derive(Debug, Default, Serialize)]
pub struct SweepReport {
    pub results: Vec<RunResult>,
    pub failures: Vec<RunError>,
    /// Experiments skipped because they are disabled.
    pub skipped: Vec<ExperimentId>,
    pub cancelled: bool,
}

impl SweepReport {
    /// Exit code of the last launched program, 0 if none ran, 130 if cancelled.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            return CANCELLED_EXIT_CODE;
        }
        self.results.last().map(|r| r.exit_code).unwrap_or(0)
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    pub fn launched(&self) -> usize {
        self.results.len()
    }

    /// Write the report as pretty JSON, creating parent directories.
    pub fn write_json(&self, path: &Path) -> Result<(), SweepError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// One planned stage of a dry run.
#[derive(Debug)]
pub struct PlannedStage {
    pub id: ExperimentId,
    /// `None` when the experiment failed validation before any stage.
    pub stage: Option<Stage>,
    pub invocation: Result<Invocation, ConfigError>,
}

/// Drives experiment sweeps against external programs.
pub struct Orchestrator {
    launcher: Arc<dyn Launcher>,
    options: SweepOptions,
    cancellation: CancellationToken,
}

impl Orchestrator {
    pub fn new(launcher: Arc<dyn Launcher>, options: SweepOptions) -> Self {
        Self {
            launcher,
            options,
            cancellation: CancellationToken::new(),
        }
    }

    /// Token that aborts the sweep and kills the in-flight stage when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Paths for `config` under this sweep's name and layout.
    pub fn build_paths(&self, config: &ExperimentConfig) -> Result<PathConvention, ConfigError> {
        build_paths_with(config, &self.options.sweep_name, &self.options.layout)
    }

    /// Checks that apply to the experiment as a whole, then its paths.
    fn prepare(&self, config: &ExperimentConfig) -> Result<PathConvention, ConfigError> {
        if config.stages.is_empty() {
            return Err(ConfigError::Invalid {
                message: format!("experiment {} has no stages", config.id()),
            });
        }
        self.build_paths(config)
    }

    fn invocation(
        &self,
        stage: Stage,
        config: &ExperimentConfig,
        paths: &PathConvention,
    ) -> Result<Invocation, ConfigError> {
        build_invocation(
            stage,
            config,
            paths,
            &self.options.trainer,
            &self.options.renderer,
        )
    }

    /// Run one stage of one experiment and wait for it.
    ///
    /// A non-zero exit is returned as a [`RunResult`]; errors cover invalid
    /// arguments, a missing input checkpoint, launch failure and cancellation.
    pub async fn run_stage(
        &self,
        stage: Stage,
        config: &ExperimentConfig,
        paths: &PathConvention,
    ) -> Result<RunResult, SweepError> {
        let invocation = self.invocation(stage, config, paths)?;

        let input = stage.input_path(paths);
        if !self.options.workspace.join(input).exists() {
            return Err(StageError::MissingInput {
                stage,
                path: input.to_path_buf(),
            }
            .into());
        }

        info!(
            scene = %config.scene,
            log_name = %config.log_name,
            stage = %stage,
            gpu = config.gpu_id,
            "Launching stage"
        );
        debug!(command = %invocation.display_line(), "Stage command");

        let launch_options = LaunchOptions {
            current_dir: self.options.workspace.clone(),
            timeout: self.options.stage_timeout,
            capture: self.options.capture_output,
        };
        let started_at = Utc::now();
        let clock = Instant::now();
        let output = self
            .launcher
            .launch(&invocation, &launch_options, &self.cancellation)
            .await?;
        let duration_ms = clock.elapsed().as_millis() as u64;

        if output.exit_code == 0 && !output.timed_out {
            info!(
                scene = %config.scene,
                log_name = %config.log_name,
                stage = %stage,
                duration_ms,
                "Stage finished"
            );
        }

        Ok(RunResult {
            config: config.clone(),
            stage,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            timed_out: output.timed_out,
            started_at,
            duration_ms,
        })
    }

    /// Run every enabled experiment's stages in list order.
    ///
    /// Configuration and missing-input errors end only the affected
    /// experiment. A failing stage skips the rest of its experiment and, under
    /// [`FailurePolicy::FailFast`], the rest of the sweep.
    pub async fn run_sweep(&self, configs: &[ExperimentConfig]) -> SweepReport {
        let mut report = SweepReport::default();
        info!(
            sweep = %self.options.sweep_name,
            experiments = configs.len(),
            policy = %self.options.policy,
            "Starting sweep"
        );

        'sweep: for config in configs {
            let id = config.id();
            if self.cancellation.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if !config.enabled {
                debug!(experiment = %id, "Skipping disabled experiment");
                report.skipped.push(id);
                continue;
            }

            let paths = match self.prepare(config) {
                Ok(paths) => paths,
                Err(e) => {
                    error!(experiment = %id, error = %e, "Invalid experiment configuration");
                    report.failures.push(RunError::new(id, e));
                    continue;
                }
            };

            for &stage in &config.stages {
                match self.run_stage(stage, config, &paths).await {
                    Ok(result) if result.success() => report.results.push(result),
                    Ok(result) => {
                        let failure = if result.timed_out {
                            StageError::Timeout {
                                stage,
                                timeout_secs: self
                                    .options
                                    .stage_timeout
                                    .map(|t| t.as_secs())
                                    .unwrap_or_default(),
                            }
                        } else {
                            StageError::SubprocessFailure {
                                stage,
                                exit_code: result.exit_code,
                            }
                        };
                        error!(experiment = %id, error = %failure, "Stage failed");
                        report.results.push(result);
                        report.failures.push(RunError::new(id, failure));
                        if self.options.policy == FailurePolicy::FailFast {
                            break 'sweep;
                        }
                        continue 'sweep;
                    }
                    Err(e @ SweepError::Stage(StageError::Cancelled { .. })) => {
                        warn!(experiment = %id, "Sweep cancelled");
                        report.failures.push(RunError::new(id, e));
                        report.cancelled = true;
                        break 'sweep;
                    }
                    Err(e @ SweepError::Stage(StageError::Spawn { .. })) => {
                        error!(experiment = %id, error = %e, "Stage could not be launched");
                        report.failures.push(RunError::new(id, e));
                        if self.options.policy == FailurePolicy::FailFast {
                            break 'sweep;
                        }
                        continue 'sweep;
                    }
                    Err(e) => {
                        error!(experiment = %id, error = %e, "Experiment aborted");
                        report.failures.push(RunError::new(id, e));
                        continue 'sweep;
                    }
                }
            }
        }

        info!(
            launched = report.launched(),
            failures = report.failures.len(),
            skipped = report.skipped.len(),
            cancelled = report.cancelled,
            "Sweep finished"
        );
        report
    }

    /// Resolve every enabled experiment's stage calls without launching
    /// anything or checking inputs.
    pub fn plan(&self, configs: &[ExperimentConfig]) -> Vec<PlannedStage> {
        let mut planned = Vec::new();
        for config in configs.iter().filter(|c| c.enabled) {
            let id = config.id();
            let paths = match self.prepare(config) {
                Ok(paths) => paths,
                Err(e) => {
                    planned.push(PlannedStage {
                        id,
                        stage: None,
                        invocation: Err(e),
                    });
                    continue;
                }
            };
            for &stage in &config.stages {
                planned.push(PlannedStage {
                    id: id.clone(),
                    stage: Some(stage),
                    invocation: self.invocation(stage, config, &paths),
                });
            }
        }
        planned
    }
}
