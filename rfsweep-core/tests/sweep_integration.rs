//! Integration tests for sweeps against real child processes.
//!
//! The trainer and renderer are stood in for by `sh -c` scripts that read the
//! generated arguments positionally and write the files the next stage needs.
#![cfg(unix)]

use rfsweep_core::config::{FailurePolicy, RendererConfig, TrainerConfig};
use rfsweep_core::error::ErrorKind;
use rfsweep_core::experiment::{ExperimentConfig, ExperimentId};
use rfsweep_core::launcher::ProcessLauncher;
use rfsweep_core::orchestrator::{Orchestrator, SweepOptions};
use rfsweep_core::paths::build_paths;
use rfsweep_core::stage::Stage;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// $4 is the training output directory (`-d data -o log_dir ...`).
const TRAIN_SCRIPT: &str = r#"
case "$4" in *fail*) exit 3 ;; esac
mkdir -p "$4/saved_models"
printf '%s' "$CUDA_VISIBLE_DEVICES" > "$4/gpu"
touch "$4/saved_models/model_final_refined.pth"
echo "prompt=$8"
"#;

/// $4 is the render output directory (`-i ckpt -o render_dir ...`).
const RENDER_SCRIPT: &str = r#"
mkdir -p "$4"
printf '%s\n' "$@" > "$4/args"
"#;

fn sh(script: &str, name: &str) -> Vec<String> {
    vec!["-c".into(), script.into(), name.into()]
}

fn options(workspace: &Path, sweep_name: &str) -> SweepOptions {
    SweepOptions {
        sweep_name: sweep_name.into(),
        workspace: workspace.to_path_buf(),
        trainer: TrainerConfig {
            program: "sh".into(),
            args: sh(TRAIN_SCRIPT, "trainer"),
            log_wandb: false,
        },
        renderer: RendererConfig {
            program: "sh".into(),
            args: sh(RENDER_SCRIPT, "renderer"),
            save_frequency: 1,
        },
        ..SweepOptions::default()
    }
}

/// Place the pretrained checkpoint each experiment's training reads.
fn seed_reference(workspace: &Path, config: &ExperimentConfig) {
    let reference = workspace.join(build_paths(config, "").unwrap().reference_checkpoint);
    std::fs::create_dir_all(reference.parent().unwrap()).unwrap();
    std::fs::write(reference, b"pretrained").unwrap();
}

fn party_hat() -> ExperimentConfig {
    ExperimentConfig::new("dog2", "a render of a dog with a party hat", "party_hat2", 9)
}

#[tokio::test]
async fn test_train_then_render() {
    let dir = TempDir::new().unwrap();
    let config = party_hat().with_gpu(2);
    seed_reference(dir.path(), &config);
    let orch = Orchestrator::new(Arc::new(ProcessLauncher), options(dir.path(), "hats"));

    let report = orch.run_sweep(std::slice::from_ref(&config)).await;

    assert!(report.is_success(), "failures: {:?}", report.failures);
    assert_eq!(report.results.len(), 2);
    assert_eq!(report.results[0].stage, Stage::Train);
    assert_eq!(report.results[1].stage, Stage::Render);
    assert_eq!(report.exit_code(), 0);

    let log_dir = dir.path().join("logs/rf/hats/dog2/party_hat2");
    assert_eq!(std::fs::read_to_string(log_dir.join("gpu")).unwrap(), "2");

    let render_dir = dir.path().join("output_renders/hats/dog2/party_hat2_attn_wgt");
    let args = std::fs::read_to_string(render_dir.join("args")).unwrap();
    let args: Vec<&str> = args.lines().collect();
    assert_eq!(
        &args[..6],
        &[
            "-i",
            "logs/rf/hats/dog2/party_hat2/saved_models/model_final_refined.pth",
            "-o",
            "output_renders/hats/dog2/party_hat2_attn_wgt",
            "-d",
            "data/dog2",
        ]
    );
    assert!(args.windows(2).any(|w| w == ["-eidx", "9"]));
}

#[tokio::test]
async fn test_failure_does_not_stop_later_experiments() {
    let dir = TempDir::new().unwrap();
    let configs = [
        party_hat().with_stages(&[Stage::Train]),
        ExperimentConfig::new("dog2", "a dog in a raincoat", "raincoat_fail", 3),
        ExperimentConfig::new("dog2", "a dog with sunglasses", "sunglasses", 3),
    ];
    seed_reference(dir.path(), &configs[0]);
    let orch = Orchestrator::new(Arc::new(ProcessLauncher), options(dir.path(), ""));

    let report = orch.run_sweep(&configs).await;

    let launched: Vec<(String, Stage)> = report
        .results
        .iter()
        .map(|r| (r.config.log_name.clone(), r.stage))
        .collect();
    assert_eq!(
        launched,
        vec![
            ("party_hat2".to_string(), Stage::Train),
            ("raincoat_fail".to_string(), Stage::Train),
            ("sunglasses".to_string(), Stage::Train),
            ("sunglasses".to_string(), Stage::Render),
        ]
    );
    assert_eq!(report.results[1].exit_code, 3);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].id, ExperimentId::new("dog2", "raincoat_fail"));
    assert_eq!(report.failures[0].kind(), ErrorKind::SubprocessFailure);
    assert_eq!(report.exit_code(), 0);
    assert!(
        !dir.path()
            .join("output_renders/dog2/raincoat_fail_attn_wgt")
            .exists()
    );
}

#[tokio::test]
async fn test_fail_fast_exit_code_is_failing_stage() {
    let dir = TempDir::new().unwrap();
    let configs = [
        ExperimentConfig::new("dog2", "a dog in a raincoat", "raincoat_fail", 3),
        party_hat(),
    ];
    seed_reference(dir.path(), &configs[0]);
    let mut opts = options(dir.path(), "");
    opts.policy = FailurePolicy::FailFast;
    let orch = Orchestrator::new(Arc::new(ProcessLauncher), opts);

    let report = orch.run_sweep(&configs).await;

    assert_eq!(report.results.len(), 1);
    assert_eq!(report.exit_code(), 3);
    assert!(!dir.path().join("logs/rf/dog2/party_hat2").exists());
}

#[tokio::test]
async fn test_captured_output_is_recorded() {
    let dir = TempDir::new().unwrap();
    let config = party_hat().with_stages(&[Stage::Train]);
    seed_reference(dir.path(), &config);
    let mut opts = options(dir.path(), "");
    opts.capture_output = true;
    let orch = Orchestrator::new(Arc::new(ProcessLauncher), opts);

    let report = orch.run_sweep(&[config]).await;

    let stdout = report.results[0].stdout.as_deref().unwrap_or_default();
    assert!(stdout.contains("prompt=a render of a dog with a party hat"));
}

#[tokio::test]
async fn test_missing_reference_launches_nothing() {
    let dir = TempDir::new().unwrap();
    let orch = Orchestrator::new(Arc::new(ProcessLauncher), options(dir.path(), ""));

    let report = orch.run_sweep(&[party_hat()]).await;

    assert!(report.results.is_empty());
    assert_eq!(report.failures[0].kind(), ErrorKind::MissingInput);
    assert_eq!(report.exit_code(), 0);
    assert!(!dir.path().join("logs/rf/dog2/party_hat2").exists());
}

#[tokio::test]
async fn test_stage_timeout() {
    let dir = TempDir::new().unwrap();
    let config = party_hat();
    seed_reference(dir.path(), &config);
    let mut opts = options(dir.path(), "");
    opts.trainer.args = sh("exec sleep 30", "trainer");
    opts.stage_timeout = Some(Duration::from_secs(1));
    let orch = Orchestrator::new(Arc::new(ProcessLauncher), opts);

    let report = orch.run_sweep(&[config]).await;

    assert_eq!(report.results.len(), 1);
    assert!(report.results[0].timed_out);
    assert_eq!(report.failures[0].kind(), ErrorKind::SubprocessFailure);
}

#[tokio::test]
async fn test_cancel_kills_running_stage() {
    let dir = TempDir::new().unwrap();
    let configs = vec![party_hat(), party_hat().with_stages(&[Stage::Train])];
    seed_reference(dir.path(), &configs[0]);
    let mut opts = options(dir.path(), "");
    opts.trainer.args = sh("exec sleep 30", "trainer");
    let orch = Arc::new(Orchestrator::new(Arc::new(ProcessLauncher), opts));
    let token = orch.cancellation_token();

    let handle = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.run_sweep(&configs).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    token.cancel();

    let report = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("sweep did not stop after cancellation")
        .unwrap();
    assert!(report.cancelled);
    assert!(report.results.is_empty());
    assert_eq!(report.exit_code(), 130);
}

#[test]
fn test_report_serializes_without_token() {
    let config = party_hat().with_auth_token("hf_secret");
    let dir = TempDir::new().unwrap();
    let orch = Orchestrator::new(Arc::new(ProcessLauncher), options(dir.path(), ""));
    let plan = orch.plan(std::slice::from_ref(&config));
    let json = serde_json::to_string(&config).unwrap();
    assert!(!json.contains("hf_secret"));
    let line = plan[0].invocation.as_ref().unwrap().display_line();
    assert!(!line.contains("hf_secret"));
    assert!(line.contains("-a ***"));
}
