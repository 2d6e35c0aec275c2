//! Preview command implementation
//!
//! Implements `stagehand preview`: materialises a step batch with the local
//! sandbox, drives install and dev server startup, and prints a JSON result
//! on stdout. Progress goes to stderr (spinner on a TTY, logs otherwise).

use crate::ui::spinner::PreviewSpinner;
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use stagehand_core::config::{CommandSpec, PreviewConfig};
use stagehand_core::lifecycle::PreviewPhase;
use stagehand_core::local::LocalSandbox;
use stagehand_core::preview::{PreviewBinding, PreviewView};
use stagehand_core::sandbox::Sandbox;
use stagehand_core::session::{GenerationSession, TargetKind};
use stagehand_core::steps::load_steps;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Preview command arguments
#[derive(Debug, Clone)]
pub struct PreviewArgs {
    pub steps: PathBuf,
    pub workdir: Option<PathBuf>,
    pub target: TargetKind,
    pub ports: Vec<u16>,
    pub install_command: Option<String>,
    pub start_command: Option<String>,
    pub install_timeout: Option<u64>,
    pub start_timeout: Option<u64>,
    pub retries: u32,
    pub detach: bool,
    /// Render progress with a spinner instead of log lines
    pub spinner: bool,
}

/// JSON document printed on stdout
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewResult {
    pub phase: PreviewPhase,
    pub url: Option<String>,
    pub error: Option<String>,
}

impl From<&PreviewView> for PreviewResult {
    fn from(view: &PreviewView) -> Self {
        Self {
            phase: view.phase,
            url: view.url.clone(),
            error: view.error_message.clone(),
        }
    }
}

/// Returned when the preview settles in Error; the binary exits with code 2
#[derive(Debug)]
pub struct PreviewFailedExit(pub String);

impl std::fmt::Display for PreviewFailedExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Preview failed: {}", self.0)
    }
}

impl std::error::Error for PreviewFailedExit {}

fn parse_command_line(field: &str, line: &str) -> Result<CommandSpec> {
    let words =
        shell_words::split(line).with_context(|| format!("Invalid {} '{}'", field, line))?;
    let mut words = words.into_iter();
    let program = words
        .next()
        .ok_or_else(|| anyhow!("{} must not be empty", field))?;
    Ok(CommandSpec::new(program, words))
}

/// Layer command-line overrides on top of the file configuration
fn apply_overrides(mut config: PreviewConfig, args: &PreviewArgs) -> Result<PreviewConfig> {
    if !args.ports.is_empty() {
        config.ready_ports = args.ports.clone();
    }
    if let Some(line) = &args.install_command {
        config.install_command = parse_command_line("--install-command", line)?;
    }
    if let Some(line) = &args.start_command {
        config.start_command = parse_command_line("--start-command", line)?;
    }
    if let Some(secs) = args.install_timeout {
        config.install_timeout_secs = secs;
    }
    if let Some(secs) = args.start_timeout {
        config.start_timeout_secs = secs;
    }
    config.validate()?;
    Ok(config)
}

/// Execute the preview command
#[instrument(skip(args, config))]
pub async fn execute_preview(args: PreviewArgs, config: PreviewConfig) -> Result<()> {
    let config = apply_overrides(config, &args)?;
    let workdir = match &args.workdir {
        Some(dir) => dir.clone(),
        None => LocalSandbox::default_workdir()
            .ok_or_else(|| anyhow!("No cache directory available; pass --workdir"))?,
    };
    debug!("Preview workdir: {}", workdir.display());

    let steps = load_steps(&args.steps)?;
    let sandbox = Arc::new(LocalSandbox::new(&workdir, config.ready_ports.clone())?);
    let mut session = GenerationSession::new(sandbox, config, args.target);
    session.push_steps(steps);
    session.apply_pending()?;
    if session.tree().is_empty() {
        bail!("Step batch {} produced no files", args.steps.display());
    }

    let mut spinner = args.spinner.then(PreviewSpinner::new);
    session.mount().await?;
    info!("Project materialised under {}", workdir.display());

    let mut binding = session.binding();
    let mut attempts_left = args.retries;
    let view = loop {
        let view = follow(&mut binding, spinner.as_mut()).await;
        if view.phase == PreviewPhase::Error && attempts_left > 0 {
            attempts_left -= 1;
            warn!(
                "Preview failed ({}); retrying, {} attempts left",
                view.error_message.as_deref().unwrap_or("unknown error"),
                attempts_left
            );
            binding.retry();
            session.evaluate();
            continue;
        }
        break view;
    };
    drop(spinner);

    print_result(&PreviewResult::from(&view))?;

    if view.phase == PreviewPhase::Error {
        session.teardown().await;
        let message = view.error_message.unwrap_or_else(|| "unknown error".to_string());
        return Err(PreviewFailedExit(message).into());
    }

    if !args.detach {
        info!("Serving preview; press Ctrl-C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
    }
    session.teardown().await;
    Ok(())
}

/// Wait for the current attempt to settle, rendering every change
async fn follow<S: Sandbox + 'static>(
    binding: &mut PreviewBinding<S>,
    mut spinner: Option<&mut PreviewSpinner>,
) -> PreviewView {
    let mut last_phase = None;
    let mut view = binding.view();
    loop {
        match spinner.as_deref_mut() {
            Some(spinner) => spinner.update(&view),
            None if last_phase != Some(view.phase) => {
                info!("Preview phase: {}", view.phase);
            }
            None => {}
        }
        last_phase = Some(view.phase);
        if view.phase.is_settled() {
            return view;
        }
        view = binding.changed().await;
    }
}

fn print_result(result: &PreviewResult) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, result).context("Failed to serialize preview result")?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}
