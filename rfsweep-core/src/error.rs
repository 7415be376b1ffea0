//! Error types for the rfsweep core.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering configuration, stage execution and per-experiment attribution.

use std::path::PathBuf;

use serde::ser::{Serialize, SerializeStruct, Serializer};

use crate::experiment::ExperimentId;
use crate::stage::Stage;

/// Top-level error type for the rfsweep core library.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },

    #[error("Unsafe path segment in {field}: {value:?}")]
    UnsafePathSegment { field: &'static str, value: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid hyperparameter '{key}': {reason}")]
    InvalidHyperparameter { key: String, reason: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Errors from launching or supervising a single stage.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("{stage} stage exited with status {exit_code}")]
    SubprocessFailure { stage: Stage, exit_code: i32 },

    #[error("{stage} stage timed out after {timeout_secs}s")]
    Timeout { stage: Stage, timeout_secs: u64 },

    #[error("Missing input for {stage} stage: {path}")]
    MissingInput { stage: Stage, path: PathBuf },

    #[error("Failed to launch '{program}' for {stage} stage: {message}")]
    Spawn {
        stage: Stage,
        program: String,
        message: String,
    },

    #[error("{stage} stage was cancelled")]
    Cancelled { stage: Stage },
}

/// Coarse classification of a failure, used in reports and exit handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    SubprocessFailure,
    MissingInput,
    Spawn,
    Cancelled,
    Io,
}

impl SweepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SweepError::Config(_) => ErrorKind::Config,
            SweepError::Stage(StageError::SubprocessFailure { .. })
            | SweepError::Stage(StageError::Timeout { .. }) => ErrorKind::SubprocessFailure,
            SweepError::Stage(StageError::MissingInput { .. }) => ErrorKind::MissingInput,
            SweepError::Stage(StageError::Spawn { .. }) => ErrorKind::Spawn,
            SweepError::Stage(StageError::Cancelled { .. }) => ErrorKind::Cancelled,
            SweepError::Io(_) | SweepError::Serialization(_) => ErrorKind::Io,
        }
    }

    /// The stage the error happened in, when it is tied to one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            SweepError::Stage(
                StageError::SubprocessFailure { stage, .. }
                | StageError::Timeout { stage, .. }
                | StageError::MissingInput { stage, .. }
                | StageError::Spawn { stage, .. }
                | StageError::Cancelled { stage },
            ) => Some(*stage),
            _ => None,
        }
    }
}

/// A failure attributed to one experiment configuration.
#[derive(Debug, thiserror::Error)]
#[error("[{id}] {error}")]
pub struct RunError {
    pub id: ExperimentId,
    pub error: SweepError,
}

impl RunError {
    pub fn new(id: ExperimentId, error: impl Into<SweepError>) -> Self {
        Self {
            id,
            error: error.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

impl Serialize for RunError {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("RunError", 4)?;
        state.serialize_field("id", &self.id.to_string())?;
        state.serialize_field("kind", &self.kind())?;
        state.serialize_field("stage", &self.error.stage())?;
        state.serialize_field("message", &self.error.to_string())?;
        state.end()
    }
}

/// A type alias for results using the top-level `SweepError`.
pub type Result<T> = std::result::Result<T, SweepError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> ExperimentId {
        ExperimentId::new("dog2", "party_hat2")
    }

    #[test]
    fn test_error_display_config() {
        let err = SweepError::Config(ConfigError::UnsafePathSegment {
            field: "scene",
            value: "../dog2".into(),
        });
        assert_eq!(
            err.to_string(),
            "Configuration error: Unsafe path segment in scene: \"../dog2\""
        );
    }

    #[test]
    fn test_error_display_stage() {
        let err = SweepError::Stage(StageError::SubprocessFailure {
            stage: Stage::Train,
            exit_code: 3,
        });
        assert_eq!(err.to_string(), "Stage error: train stage exited with status 3");
    }

    #[test]
    fn test_run_error_carries_experiment_id() {
        let err = RunError::new(
            id(),
            StageError::MissingInput {
                stage: Stage::Render,
                path: PathBuf::from("logs/rf/dog2/party_hat2/saved_models/model_final.pth"),
            },
        );
        assert!(err.to_string().starts_with("[dog2/party_hat2] "));
        assert_eq!(err.kind(), ErrorKind::MissingInput);
        assert_eq!(err.error.stage(), Some(Stage::Render));
    }

    #[test]
    fn test_timeout_counts_as_subprocess_failure() {
        let err = SweepError::from(StageError::Timeout {
            stage: Stage::Train,
            timeout_secs: 30,
        });
        assert_eq!(err.kind(), ErrorKind::SubprocessFailure);
        assert_eq!(err.to_string(), "Stage error: train stage timed out after 30s");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SweepError = io_err.into();
        assert!(matches!(err, SweepError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.stage(), None);
    }

    #[test]
    fn test_run_error_serializes_summary() {
        let err = RunError::new(
            id(),
            StageError::SubprocessFailure {
                stage: Stage::Train,
                exit_code: 1,
            },
        );
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["id"], "dog2/party_hat2");
        assert_eq!(json["kind"], "subprocess_failure");
        assert_eq!(json["stage"], "train");
    }
}
