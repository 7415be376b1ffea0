//! # rfsweep Core
//!
//! Core library for rfsweep experiment sweeps.
//! Provides the experiment model, the on-disk path layout, stage argument
//! marshalling, process launching, layered configuration and the sequential
//! sweep orchestrator.

pub mod config;
pub mod device;
pub mod error;
pub mod experiment;
pub mod launcher;
pub mod orchestrator;
pub mod paths;
pub mod stage;

// Re-export commonly used types at the crate root.
pub use config::{
    FailurePolicy, LayoutConfig, RendererConfig, SweepConfig, TrainerConfig, load_config,
};
pub use device::{DEVICE_ENV_VAR, StageEnv};
pub use error::{ConfigError, ErrorKind, Result, RunError, StageError, SweepError};
pub use experiment::{AuthToken, ExperimentConfig, ExperimentEntry, ExperimentId, Hyperparameters};
pub use launcher::{LaunchOptions, Launcher, MockLauncher, ProcessLauncher, ProcessOutput};
pub use orchestrator::{
    CANCELLED_EXIT_CODE, Orchestrator, PlannedStage, RunResult, SweepOptions, SweepReport,
};
pub use paths::{PathConvention, build_paths, build_paths_with};
pub use stage::{Invocation, Stage, build_invocation, render_invocation, train_invocation};
