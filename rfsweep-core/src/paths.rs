//! On-disk layout shared with the external trainer and renderer.
//!
//! ```text
//! logs/rf/[<sweep>/]<scene>/<log_name>/saved_models/model_final[_refined].pth
//! output_renders/[<sweep>/]<scene>/<log_name>[_attn_wgt]/
//! ```
//!
//! Every path here is a pure function of the experiment, the sweep name and
//! the layout roots, so re-running a sweep lands in the same places.

use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::LayoutConfig;
use crate::error::ConfigError;
use crate::experiment::ExperimentConfig;

pub const SAVED_MODELS_DIR: &str = "saved_models";
pub const CHECKPOINT_FILE: &str = "model_final.pth";
pub const REFINED_CHECKPOINT_FILE: &str = "model_final_refined.pth";
/// Suffix of render directories produced from refined (attention-weighted) models.
pub const ATTN_RENDER_SUFFIX: &str = "_attn_wgt";

/// Paths derived for one experiment. Never stored, always recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathConvention {
    /// Scene dataset read by both stages.
    pub data_dir: PathBuf,
    /// Pretrained model the training stage edits.
    pub reference_checkpoint: PathBuf,
    /// Training output directory.
    pub log_dir: PathBuf,
    /// Trained checkpoint the rendering stage consumes.
    pub checkpoint: PathBuf,
    /// Rendering output directory.
    pub render_dir: PathBuf,
}

/// Build paths with the default layout roots.
pub fn build_paths(
    config: &ExperimentConfig,
    sweep_name: &str,
) -> Result<PathConvention, ConfigError> {
    build_paths_with(config, sweep_name, &LayoutConfig::default())
}

/// Build paths under the given layout roots.
pub fn build_paths_with(
    config: &ExperimentConfig,
    sweep_name: &str,
    layout: &LayoutConfig,
) -> Result<PathConvention, ConfigError> {
    validate_segment("scene", &config.scene)?;
    validate_segment("log_name", &config.log_name)?;
    validate_segment("layout.reference_log_name", &layout.reference_log_name)?;
    if !sweep_name.is_empty() {
        validate_segment("sweep_name", sweep_name)?;
    }

    let swept = |root: &Path| -> PathBuf {
        if sweep_name.is_empty() {
            root.join(&config.scene)
        } else {
            root.join(sweep_name).join(&config.scene)
        }
    };

    let log_dir = swept(&layout.logs_root).join(&config.log_name);
    let checkpoint_file = if config.refine {
        REFINED_CHECKPOINT_FILE
    } else {
        CHECKPOINT_FILE
    };
    let checkpoint = log_dir.join(SAVED_MODELS_DIR).join(checkpoint_file);

    let render_name = if config.refine {
        format!("{}{}", config.log_name, ATTN_RENDER_SUFFIX)
    } else {
        config.log_name.clone()
    };
    let render_dir = swept(&layout.renders_root).join(render_name);

    // Pretrained models are shared across sweeps.
    let reference_checkpoint = layout
        .logs_root
        .join(&config.scene)
        .join(&layout.reference_log_name)
        .join(SAVED_MODELS_DIR)
        .join(CHECKPOINT_FILE);

    Ok(PathConvention {
        data_dir: layout.data_root.join(&config.scene),
        reference_checkpoint,
        log_dir,
        checkpoint,
        render_dir,
    })
}

/// Reject values that would escape or restructure the layout when used as a
/// single path component.
pub fn validate_segment(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let unsafe_segment = value.is_empty()
        || value == "."
        || value.contains("..")
        || value.contains(['/', '\\', '\0'])
        || value.trim() != value;
    if unsafe_segment {
        return Err(ConfigError::UnsafePathSegment {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}
