//! Sweep execution for the default command.

use anyhow::Context;
use rfsweep_core::{
    Orchestrator, PlannedStage, ProcessLauncher, SweepConfig, SweepOptions, SweepReport,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything the default command needs after flags are applied.
#[derive(Debug)]
pub struct RunRequest {
    pub config: SweepConfig,
    pub workspace: PathBuf,
    pub dry_run: bool,
    pub report_path: Option<PathBuf>,
    pub quiet: bool,
}

/// Run (or plan) the configured sweep and return the process exit code.
pub async fn run(request: RunRequest) -> anyhow::Result<i32> {
    let experiments = request.config.resolve_experiments();
    let options = SweepOptions::from_config(&request.config, request.workspace.clone());
    let orchestrator = Orchestrator::new(Arc::new(ProcessLauncher), options);

    if experiments.is_empty() {
        warn!("No experiments configured; nothing to run");
    }

    if request.dry_run {
        print!("{}", render_plan(&orchestrator.plan(&experiments)));
        return Ok(0);
    }

    spawn_signal_handler(orchestrator.cancellation_token());
    let report = orchestrator.run_sweep(&experiments).await;

    if !request.quiet {
        print!("{}", render_summary(&report));
    }
    if let Some(path) = &request.report_path {
        report
            .write_json(path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "Wrote sweep report");
    }

    Ok(report.exit_code())
}

/// Cancel the sweep on Ctrl-C or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Interrupt received, stopping sweep");
        token.cancel();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn render_plan(plan: &[PlannedStage]) -> String {
    let mut out = String::new();
    for planned in plan {
        let label = match planned.stage {
            Some(stage) => format!("[{}] {}:", planned.id, stage),
            None => format!("[{}]", planned.id),
        };
        match &planned.invocation {
            Ok(invocation) => {
                out.push_str(&format!("{} {}\n", label, invocation.display_line()));
            }
            Err(e) => {
                out.push_str(&format!("{} error: {}\n", label, e));
            }
        }
    }
    out
}

fn render_summary(report: &SweepReport) -> String {
    let mut out = format!(
        "Sweep finished: {} stage(s) launched, {} failure(s), {} skipped{}\n",
        report.launched(),
        report.failures.len(),
        report.skipped.len(),
        if report.cancelled { ", cancelled" } else { "" }
    );
    for failure in &report.failures {
        out.push_str(&format!("  {}\n", failure));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfsweep_core::{ExperimentConfig, ExperimentEntry, RunError, Stage, StageError};
    use std::path::Path;
    use tempfile::TempDir;

    fn request(config: SweepConfig, workspace: &Path) -> RunRequest {
        RunRequest {
            config,
            workspace: workspace.to_path_buf(),
            dry_run: false,
            report_path: None,
            quiet: true,
        }
    }

    fn entry(scene: &str, log_name: &str) -> ExperimentEntry {
        ExperimentEntry::from(&ExperimentConfig::new(scene, "a prompt", log_name, 0))
    }

    #[tokio::test]
    async fn test_empty_sweep_exits_zero() {
        let dir = TempDir::new().unwrap();
        let code = run(request(SweepConfig::default(), dir.path())).await.unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_dry_run_launches_nothing() {
        let dir = TempDir::new().unwrap();
        let config = SweepConfig {
            experiments: vec![entry("dog2", "party_hat2")],
            ..SweepConfig::default()
        };
        let mut req = request(config, dir.path());
        req.dry_run = true;

        let code = run(req).await.unwrap();

        assert_eq!(code, 0);
        assert!(!dir.path().join("logs").exists());
    }

    #[tokio::test]
    async fn test_report_written_with_missing_input() {
        let dir = TempDir::new().unwrap();
        let report_path = dir.path().join("reports").join("sweep.json");
        let config = SweepConfig {
            experiments: vec![entry("dog2", "party_hat2")],
            ..SweepConfig::default()
        };
        let mut req = request(config, dir.path());
        req.report_path = Some(report_path.clone());

        let code = run(req).await.unwrap();

        assert_eq!(code, 0);
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
        assert_eq!(json["failures"][0]["id"], "dog2/party_hat2");
        assert_eq!(json["failures"][0]["kind"], "missing_input");
        assert_eq!(json["failures"][0]["stage"], "train");
        assert_eq!(json["results"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_render_plan() {
        let dir = TempDir::new().unwrap();
        let options = SweepOptions {
            workspace: dir.path().to_path_buf(),
            ..SweepOptions::default()
        };
        let orchestrator = Orchestrator::new(Arc::new(ProcessLauncher), options);
        let configs = [
            ExperimentConfig::new("dog2", "a prompt", "party_hat2", 9).with_auth_token("hf_x"),
            ExperimentConfig::new("dog/2", "a prompt", "bad", 0),
        ];

        let text = render_plan(&orchestrator.plan(&configs));

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("[dog2/party_hat2] train: CUDA_VISIBLE_DEVICES=0 python"));
        assert!(lines[1].starts_with("[dog2/party_hat2] render: "));
        assert!(lines[2].starts_with("[dog/2/bad] error: "));
        assert!(!text.contains("hf_x"));
    }

    #[test]
    fn test_render_summary_lists_failures() {
        let mut report = SweepReport::default();
        report.failures.push(RunError::new(
            rfsweep_core::ExperimentId::new("dog2", "a"),
            StageError::SubprocessFailure {
                stage: Stage::Train,
                exit_code: 1,
            },
        ));
        report.cancelled = true;

        let text = render_summary(&report);

        assert!(text.starts_with("Sweep finished: 0 stage(s) launched, 1 failure(s), 0 skipped, cancelled"));
        assert!(text.contains("  [dog2/a] Stage error: train stage exited with status 1"));
    }
}
