//! Preview lifecycle against real host processes
//!
//! Shell scripts stand in for install and dev server commands, so these
//! scenarios only run where `sh` and `sleep` exist.
#![cfg(unix)]

use stagehand_core::config::{CommandSpec, PreviewConfig};
use stagehand_core::errors::PreviewError;
use stagehand_core::lifecycle::PreviewPhase;
use stagehand_core::local::LocalSandbox;
use stagehand_core::session::{GenerationSession, TargetKind};
use stagehand_core::steps::StepRecord;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn sh(script: &str) -> CommandSpec {
    CommandSpec::new("sh", ["-c", script])
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn session_in(
    dir: &TempDir,
    ports: Vec<u16>,
    config: PreviewConfig,
) -> (Arc<LocalSandbox>, GenerationSession<LocalSandbox>) {
    let sandbox = Arc::new(LocalSandbox::new(dir.path().join("work"), ports).unwrap());
    let mut session = GenerationSession::new(Arc::clone(&sandbox), config, TargetKind::Frontend);
    session.push_steps(vec![
        StepRecord::create_file(1, "package.json", r#"{"name":"demo"}"#),
        StepRecord::create_file(2, "src/main.ts", "console.log('hi')"),
    ]);
    session.apply_pending().unwrap();
    (sandbox, session)
}

#[tokio::test]
async fn test_install_timeout_terminates_install() {
    let dir = TempDir::new().unwrap();
    let config = PreviewConfig {
        install_command: sh("sleep 3; touch leaked"),
        start_command: sh("exit 0"),
        install_timeout_secs: 1,
        ..PreviewConfig::default()
    };
    let (sandbox, mut session) = session_in(&dir, Vec::new(), config);
    let mut binding = session.binding();

    session.mount().await.unwrap();
    let view = binding.settled().await;
    assert_eq!(
        session.controller().state().error,
        Some(PreviewError::InstallTimeout { secs: 1 })
    );
    assert_eq!(view.phase, PreviewPhase::Error);
    assert_eq!(sandbox.running_processes(), 0);

    // The killed script never reaches its last command
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(!sandbox.root().join("leaked").exists());
    session.teardown().await;
}

#[tokio::test]
async fn test_retry_after_start_timeout_ignores_previous_server() {
    let port = free_port();
    let dir = TempDir::new().unwrap();
    let config = PreviewConfig {
        install_command: sh("sleep 1"),
        // First run keeps serving past its budget; later runs exit at once
        start_command: sh("if [ -f started ]; then exit 7; fi; touch started; exec sleep 30"),
        install_timeout_secs: 10,
        start_timeout_secs: 1,
        ..PreviewConfig::default()
    };
    let (sandbox, mut session) = session_in(&dir, vec![port], config);
    let mut binding = session.binding();

    session.mount().await.unwrap();
    binding.settled().await;
    assert_eq!(
        session.controller().state().error,
        Some(PreviewError::StartTimeout { secs: 1 })
    );
    assert_eq!(sandbox.running_processes(), 0);

    // The port opens after the first server was stopped; nothing spawned
    // by the next attempt listens on it
    let _listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap();
    binding.retry();
    session.evaluate();

    let view = binding.settled().await;
    assert_eq!(view.phase, PreviewPhase::Error);
    assert!(view.url.is_none());
    assert_eq!(
        session.controller().state().error,
        Some(PreviewError::ServerExitedEarly { code: 7 })
    );
    session.teardown().await;
}

#[tokio::test]
async fn test_failed_start_leaves_no_process_behind() {
    let dir = TempDir::new().unwrap();
    let config = PreviewConfig {
        install_command: sh("exit 0"),
        start_command: sh("echo 'Error: boom' >&2; exit 2"),
        ..PreviewConfig::default()
    };
    let (sandbox, mut session) = session_in(&dir, Vec::new(), config);
    let mut binding = session.binding();

    session.mount().await.unwrap();
    binding.settled().await;
    let state = session.controller().state();
    assert_eq!(state.error, Some(PreviewError::ServerExitedEarly { code: 2 }));
    assert!(state.output_excerpt.contains("Error: boom"));
    assert_eq!(sandbox.running_processes(), 0);
}
