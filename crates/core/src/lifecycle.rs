//! Preview lifecycle controller
//!
//! Drives one generation session's sandbox from mounted files to a reachable
//! dev server:
//!
//! ```text
//! Idle -> Installing -> Starting -> Ready
//!   \          \            \
//!    +----------+------------+--> Error --(retry)--> Idle
//! ```
//!
//! Triggers arrive through [`PreviewController::evaluate`] and may repeat or
//! overlap freely; a single `started` guard plus a per-attempt generation
//! number keep at most one attempt alive. Each attempt is one tokio task that
//! runs its phases sequentially, so only one phase timer is ever armed.
//!
//! Only structured signals (exit codes, readiness notifications, timer
//! expiry) drive transitions. Output matching the error pattern merely
//! updates the diagnostic message.

use crate::config::{CommandSpec, PreviewConfig};
use crate::errors::PreviewError;
use crate::sandbox::{ProcessHandle, Sandbox, ServerReady, UNKNOWN_EXIT_CODE};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

pub const DIAGNOSTIC_INITIALIZING: &str = "Initializing sandbox...";
pub const DIAGNOSTIC_WAITING_FOR_FILES: &str = "Waiting for files to be mounted...";
pub const DIAGNOSTIC_INSTALLING: &str = "Installing dependencies...";
pub const DIAGNOSTIC_STARTING: &str = "Starting development server...";
pub const DIAGNOSTIC_SERVER_ERROR: &str = "Server error detected. Check the output.";

/// How long a process killed at a phase deadline gets to confirm its exit
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle phase of a preview
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewPhase {
    #[default]
    Idle,
    Installing,
    Starting,
    Ready,
    Error,
}

impl PreviewPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreviewPhase::Idle => "idle",
            PreviewPhase::Installing => "installing",
            PreviewPhase::Starting => "starting",
            PreviewPhase::Ready => "ready",
            PreviewPhase::Error => "error",
        }
    }

    /// Ready and Error end an attempt
    pub fn is_settled(&self) -> bool {
        matches!(self, PreviewPhase::Ready | PreviewPhase::Error)
    }
}

impl fmt::Display for PreviewPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published to observers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleState {
    pub phase: PreviewPhase,
    /// Address of the running server, set only in Ready
    pub url: Option<String>,
    /// Advisory progress or heuristic message
    pub diagnostic_message: Option<String>,
    /// Failure of the current attempt, set only in Error
    pub error: Option<PreviewError>,
    /// Tail of the process output, bounded by `excerptLimit`
    pub output_excerpt: String,
}

impl LifecycleState {
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

/// External conditions gating the Idle -> Installing transition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub sandbox_ready: bool,
    pub files_mounted: bool,
    pub previewable: bool,
    /// Failure reported while the sandbox was booting
    pub sandbox_error: Option<String>,
}

impl Preconditions {
    /// Everything satisfied
    pub fn ready() -> Self {
        Self {
            sandbox_ready: true,
            files_mounted: true,
            previewable: true,
            sandbox_error: None,
        }
    }
}

#[derive(Debug, Default)]
struct Session {
    started: bool,
    generation: u64,
    latched: Option<PreviewError>,
    task: Option<JoinHandle<()>>,
    torn_down: bool,
}

impl Session {
    /// Abort the live attempt and invalidate anything it might still write
    fn cancel_attempt(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.generation += 1;
    }
}

#[derive(Debug)]
struct Shared {
    session: Mutex<Session>,
    state: watch::Sender<LifecycleState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn phase(&self) -> PreviewPhase {
        self.state.borrow().phase
    }

    /// Apply `update` when `generation` is still the live attempt
    fn publish<F>(&self, generation: u64, update: F) -> bool
    where
        F: FnOnce(&mut LifecycleState),
    {
        let session = self.lock();
        if session.generation != generation {
            debug!("Dropping state update from stale attempt {}", generation);
            return false;
        }
        self.state.send_modify(update);
        true
    }
}

struct ControllerInner<S: Sandbox + 'static> {
    sandbox: Arc<S>,
    config: Arc<PreviewConfig>,
    error_regex: Option<Regex>,
    shared: Arc<Shared>,
}

impl<S: Sandbox + 'static> Drop for ControllerInner<S> {
    fn drop(&mut self) {
        self.shared.lock().cancel_attempt();
    }
}

/// State machine for one session's preview.
///
/// Cloning yields another handle to the same controller. The live attempt is
/// aborted once the last handle is dropped.
pub struct PreviewController<S: Sandbox + 'static> {
    inner: Arc<ControllerInner<S>>,
}

impl<S: Sandbox + 'static> Clone for PreviewController<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Sandbox + 'static> PreviewController<S> {
    pub fn new(sandbox: Arc<S>, config: PreviewConfig) -> Self {
        let error_regex = match config.error_regex() {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!("Server output scanning disabled: {}", e);
                None
            }
        };
        let (state, _) = watch::channel(LifecycleState::default());

        Self {
            inner: Arc::new(ControllerInner {
                sandbox,
                config: Arc::new(config),
                error_regex,
                shared: Arc::new(Shared {
                    session: Mutex::new(Session::default()),
                    state,
                }),
            }),
        }
    }

    pub fn config(&self) -> &PreviewConfig {
        &self.inner.config
    }

    pub fn sandbox(&self) -> &Arc<S> {
        &self.inner.sandbox
    }

    /// Current state snapshot
    pub fn state(&self) -> LifecycleState {
        self.inner.shared.state.borrow().clone()
    }

    pub fn phase(&self) -> PreviewPhase {
        self.inner.shared.phase()
    }

    /// Whether an attempt holds the single-flight guard
    pub fn is_started(&self) -> bool {
        self.inner.shared.lock().started
    }

    /// Receive every state change
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.inner.shared.state.subscribe()
    }

    /// Re-check preconditions and start an attempt when they all hold.
    ///
    /// Safe to call repeatedly. Must be called from within a Tokio runtime
    /// because a satisfied evaluation spawns the attempt task.
    #[instrument(skip(self))]
    pub fn evaluate(&self, preconditions: &Preconditions) {
        let shared = &self.inner.shared;
        let mut session = shared.lock();

        if session.torn_down {
            debug!("Controller torn down; ignoring evaluation");
            return;
        }

        if let Some(fault) = session.latched.clone() {
            if shared.phase() != PreviewPhase::Error {
                shared.state.send_modify(|state| set_error(state, fault));
            }
            return;
        }

        let fault = if !preconditions.previewable {
            Some(PreviewError::UnsupportedTarget)
        } else {
            preconditions
                .sandbox_error
                .as_ref()
                .map(|message| PreviewError::SandboxInitFailure {
                    message: message.clone(),
                })
        };
        if let Some(fault) = fault {
            error!("Preview unavailable: {}", fault);
            session.cancel_attempt();
            if fault.is_latched() {
                session.latched = Some(fault.clone());
            }
            shared.state.send_modify(|state| set_error(state, fault));
            return;
        }

        let phase = shared.phase();
        if session.started || phase != PreviewPhase::Idle {
            debug!("Attempt already in flight or settled (phase: {})", phase);
            return;
        }

        if !preconditions.sandbox_ready {
            set_diagnostic(&shared.state, DIAGNOSTIC_INITIALIZING);
            return;
        }
        if !preconditions.files_mounted {
            set_diagnostic(&shared.state, DIAGNOSTIC_WAITING_FOR_FILES);
            return;
        }

        session.started = true;
        session.generation += 1;
        let generation = session.generation;
        shared.state.send_modify(|state| {
            *state = LifecycleState {
                phase: PreviewPhase::Installing,
                diagnostic_message: Some(DIAGNOSTIC_INSTALLING.to_string()),
                ..Default::default()
            };
        });
        info!("Starting preview attempt {}", generation);

        let attempt = Attempt {
            generation,
            sandbox: Arc::clone(&self.inner.sandbox),
            config: Arc::clone(&self.inner.config),
            error_regex: self.inner.error_regex.clone(),
            shared: Arc::clone(shared),
        };
        session.task = Some(tokio::spawn(attempt.run()));
    }

    /// Leave Error for Idle; a no-op in every other phase.
    ///
    /// Does not re-poll: the caller re-supplies preconditions through
    /// [`evaluate`](Self::evaluate).
    pub fn retry(&self) {
        let shared = &self.inner.shared;
        let mut session = shared.lock();
        if shared.phase() != PreviewPhase::Error {
            debug!("Retry ignored outside the error phase");
            return;
        }
        info!("Retrying preview");
        session.cancel_attempt();
        session.started = false;
        shared.state.send_replace(LifecycleState::default());
    }

    /// Return to Idle from any phase and forget latched faults
    pub fn reset(&self) {
        let shared = &self.inner.shared;
        let mut session = shared.lock();
        info!("Resetting preview controller");
        session.cancel_attempt();
        session.started = false;
        session.latched = None;
        session.torn_down = false;
        shared.state.send_replace(LifecycleState::default());
    }

    /// Abort the live attempt and release the sandbox
    pub async fn teardown(&self) {
        {
            let mut session = self.inner.shared.lock();
            if session.torn_down {
                return;
            }
            session.cancel_attempt();
            session.started = false;
            session.torn_down = true;
        }
        info!("Tearing down preview sandbox");
        self.inner.sandbox.teardown().await;
    }
}

fn set_error(state: &mut LifecycleState, error: PreviewError) {
    state.phase = PreviewPhase::Error;
    state.url = None;
    state.error = Some(error);
}

fn set_diagnostic(state: &watch::Sender<LifecycleState>, message: &str) {
    state.send_if_modified(|state| {
        if state.diagnostic_message.as_deref() == Some(message) {
            return false;
        }
        state.diagnostic_message = Some(message.to_string());
        true
    });
}

/// Keep only the last `limit` bytes, cutting on a char boundary
fn append_excerpt(excerpt: &mut String, text: &str, limit: usize) {
    excerpt.push_str(text);
    if excerpt.len() > limit {
        let mut cut = excerpt.len() - limit;
        while !excerpt.is_char_boundary(cut) {
            cut += 1;
        }
        excerpt.drain(..cut);
    }
}

/// One attempt from manifest check to Ready
struct Attempt<S: Sandbox + 'static> {
    generation: u64,
    sandbox: Arc<S>,
    config: Arc<PreviewConfig>,
    error_regex: Option<Regex>,
    shared: Arc<Shared>,
}

impl<S: Sandbox + 'static> Attempt<S> {
    async fn run(self) {
        if let Err(err) = self.drive().await {
            self.fail(err);
        }
    }

    async fn drive(&self) -> Result<(), PreviewError> {
        self.check_manifest().await?;

        let mut ready = self.sandbox.subscribe_server_ready();
        self.install().await?;

        let moved_on = self.shared.publish(self.generation, |state| {
            state.phase = PreviewPhase::Starting;
            state.diagnostic_message = Some(DIAGNOSTIC_STARTING.to_string());
        });
        if !moved_on {
            return Ok(());
        }

        let server = self.start(&mut ready).await?;
        self.drain(server).await;
        Ok(())
    }

    fn fail(&self, err: PreviewError) {
        let mut session = self.shared.lock();
        if session.generation != self.generation {
            debug!("Stale attempt {} failed: {}", self.generation, err);
            return;
        }
        if err.clears_guard() {
            session.started = false;
        }
        if err.is_latched() {
            session.latched = Some(err.clone());
        }
        error!("Preview attempt {} failed: {}", self.generation, err);
        self.shared.state.send_modify(|state| set_error(state, err));
    }

    #[instrument(skip(self), fields(attempt = self.generation))]
    async fn check_manifest(&self) -> Result<(), PreviewError> {
        let name = &self.config.manifest_name;
        let root_problem = match self.sandbox.read_file(name).await {
            Ok(content) if !content.trim().is_empty() => {
                debug!("Found {} at the project root", name);
                return Ok(());
            }
            Ok(_) => format!("{} at the project root is empty", name),
            Err(e) => format!("{} is not readable at the project root ({})", name, e),
        };
        debug!("{}", root_problem);

        let entries = self
            .sandbox
            .read_dir(".")
            .await
            .map_err(|e| PreviewError::ManifestMissing {
                reason: format!("{}; listing the project root failed: {}", root_problem, e),
            })?;

        for dir in entries.iter().filter(|entry| entry.is_directory) {
            let candidate = format!("{}/{}", dir.name, name);
            if let Ok(content) = self.sandbox.read_file(&candidate).await {
                if !content.trim().is_empty() {
                    warn!("{} found in subdirectory '{}'", name, dir.name);
                    return Err(PreviewError::ManifestMisplaced {
                        dir: dir.name.clone(),
                    });
                }
            }
        }

        let listing = entries
            .iter()
            .map(|entry| entry.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        Err(PreviewError::ManifestMissing {
            reason: format!("{}; root contains [{}]", root_problem, listing),
        })
    }

    async fn spawn(&self, command: &CommandSpec) -> Result<ProcessHandle, PreviewError> {
        info!("Running '{}'", command);
        self.sandbox
            .spawn(&command.program, &command.args)
            .await
            .map_err(|e| PreviewError::SpawnFailed {
                command: command.to_string(),
                message: e.to_string(),
            })
    }

    #[instrument(skip(self), fields(attempt = self.generation))]
    async fn install(&self) -> Result<(), PreviewError> {
        let mut handle = self.spawn(&self.config.install_command).await?;
        let deadline = tokio::time::sleep(self.config.install_timeout());
        tokio::pin!(deadline);
        let mut output_open = true;

        loop {
            tokio::select! {
                biased;
                chunk = handle.output.recv(), if output_open => match chunk {
                    Some(chunk) => self.consume(&chunk, false),
                    None => output_open = false,
                },
                code = &mut handle.exit => {
                    self.flush(&mut handle, false);
                    let code = code.unwrap_or(UNKNOWN_EXIT_CODE);
                    if code != 0 {
                        return Err(PreviewError::InstallFailed { code });
                    }
                    info!("Dependencies installed");
                    return Ok(());
                }
                _ = &mut deadline => {
                    self.stop(&mut handle).await;
                    return Err(PreviewError::InstallTimeout {
                        secs: self.config.install_timeout_secs,
                    });
                }
            }
        }
    }

    #[instrument(skip_all, fields(attempt = self.generation))]
    async fn start(
        &self,
        ready: &mut broadcast::Receiver<ServerReady>,
    ) -> Result<ProcessHandle, PreviewError> {
        let mut handle = self.spawn(&self.config.start_command).await?;
        let deadline = tokio::time::sleep(self.config.start_timeout());
        tokio::pin!(deadline);
        let mut output_open = true;
        let mut ready_open = true;

        loop {
            tokio::select! {
                biased;
                event = ready.recv(), if ready_open => match event {
                    Ok(ServerReady { port, url }) => {
                        info!("Dev server ready on port {} at {}", port, url);
                        self.shared.publish(self.generation, |state| {
                            state.phase = PreviewPhase::Ready;
                            state.url = Some(url);
                            state.diagnostic_message = None;
                        });
                        return Ok(handle);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Skipped {} readiness notifications", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Sandbox stopped publishing readiness notifications");
                        ready_open = false;
                    }
                },
                chunk = handle.output.recv(), if output_open => match chunk {
                    Some(chunk) => self.consume(&chunk, true),
                    None => output_open = false,
                },
                code = &mut handle.exit => {
                    self.flush(&mut handle, true);
                    return Err(PreviewError::ServerExitedEarly {
                        code: code.unwrap_or(UNKNOWN_EXIT_CODE),
                    });
                }
                _ = &mut deadline => {
                    self.stop(&mut handle).await;
                    return Err(PreviewError::StartTimeout {
                        secs: self.config.start_timeout_secs,
                    });
                }
            }
        }
    }

    /// Keep logging server output after Ready; exits change nothing
    async fn drain(&self, mut handle: ProcessHandle) {
        let mut output_open = true;
        loop {
            tokio::select! {
                chunk = handle.output.recv(), if output_open => match chunk {
                    Some(chunk) => self.consume(&chunk, false),
                    None => output_open = false,
                },
                code = &mut handle.exit => {
                    self.flush(&mut handle, false);
                    warn!(
                        "Dev server exited with code {} after becoming ready",
                        code.unwrap_or(UNKNOWN_EXIT_CODE)
                    );
                    return;
                }
            }
        }
    }

    /// Kill a process at its phase deadline and wait for the runtime to confirm
    async fn stop(&self, handle: &mut ProcessHandle) {
        handle.kill();
        if tokio::time::timeout(KILL_GRACE, &mut handle.exit).await.is_err() {
            warn!("Process did not confirm termination within {:?}", KILL_GRACE);
        }
    }

    fn flush(&self, handle: &mut ProcessHandle, scan: bool) {
        while let Ok(chunk) = handle.output.try_recv() {
            self.consume(&chunk, scan);
        }
    }

    fn consume(&self, chunk: &[u8], scan: bool) {
        let text = String::from_utf8_lossy(chunk);
        debug!(target: "stagehand::process", "{}", text.trim_end());

        let flagged = scan
            && self
                .error_regex
                .as_ref()
                .is_some_and(|regex| regex.is_match(&text));
        if flagged {
            warn!("Possible server error in output");
        }

        let limit = self.config.excerpt_limit;
        self.shared.publish(self.generation, |state| {
            append_excerpt(&mut state.output_excerpt, &text, limit);
            if flagged {
                state.diagnostic_message = Some(DIAGNOSTIC_SERVER_ERROR.to_string());
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountDescription;
    use crate::sandbox::mock::{MockProcessResponse, MockSandbox};
    use serde_json::json;
    use std::time::Duration;

    fn project_with_manifest() -> MountDescription {
        serde_json::from_value(json!({
            "package.json": { "file": { "contents": "{\"name\":\"demo\"}" } },
            "src": { "directory": { "app.ts": { "file": { "contents": "x" } } } }
        }))
        .unwrap()
    }

    async fn mounted_sandbox(description: MountDescription) -> Arc<MockSandbox> {
        let sandbox = MockSandbox::new();
        sandbox.mount(&description).await.unwrap();
        Arc::new(sandbox)
    }

    async fn settle(controller: &PreviewController<MockSandbox>) -> LifecycleState {
        let mut rx = controller.subscribe();
        let state = rx
            .wait_for(|state| state.phase.is_settled())
            .await
            .unwrap()
            .clone();
        state
    }

    #[test]
    fn test_excerpt_keeps_tail_on_char_boundary() {
        let mut excerpt = String::new();
        append_excerpt(&mut excerpt, "abcdef", 4);
        assert_eq!(excerpt, "cdef");

        let mut excerpt = String::new();
        append_excerpt(&mut excerpt, "aé", 2);
        assert_eq!(excerpt, "é");

        let mut excerpt = "xy".to_string();
        append_excerpt(&mut excerpt, "z", 0);
        assert!(excerpt.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_target_never_installs() {
        let sandbox = mounted_sandbox(project_with_manifest()).await;
        let controller = PreviewController::new(Arc::clone(&sandbox), PreviewConfig::default());

        controller.evaluate(&Preconditions {
            previewable: false,
            ..Preconditions::ready()
        });

        let state = controller.state();
        assert_eq!(state.phase, PreviewPhase::Error);
        assert_eq!(state.error, Some(PreviewError::UnsupportedTarget));
        assert!(sandbox.spawn_history().is_empty());

        // Latched: later satisfied preconditions do not start an attempt
        controller.evaluate(&Preconditions::ready());
        assert_eq!(controller.phase(), PreviewPhase::Error);
        assert!(sandbox.spawn_history().is_empty());
    }

    #[tokio::test]
    async fn test_sandbox_init_failure_is_latched_until_reset() {
        let sandbox = mounted_sandbox(project_with_manifest()).await;
        let controller = PreviewController::new(Arc::clone(&sandbox), PreviewConfig::default());

        controller.evaluate(&Preconditions {
            sandbox_error: Some("boot failed".to_string()),
            ..Preconditions::ready()
        });
        assert_eq!(
            controller.state().error_message().unwrap(),
            "Sandbox initialization failed: boot failed"
        );

        controller.retry();
        assert_eq!(controller.phase(), PreviewPhase::Idle);
        controller.evaluate(&Preconditions::ready());
        assert_eq!(controller.phase(), PreviewPhase::Error);

        controller.reset();
        controller.evaluate(&Preconditions::ready());
        assert_eq!(controller.phase(), PreviewPhase::Installing);
    }

    #[tokio::test]
    async fn test_idle_diagnostics_follow_missing_preconditions() {
        let sandbox = mounted_sandbox(project_with_manifest()).await;
        let controller = PreviewController::new(sandbox, PreviewConfig::default());

        controller.evaluate(&Preconditions {
            previewable: true,
            ..Default::default()
        });
        assert_eq!(controller.phase(), PreviewPhase::Idle);
        assert_eq!(
            controller.state().diagnostic_message.as_deref(),
            Some(DIAGNOSTIC_INITIALIZING)
        );

        controller.evaluate(&Preconditions {
            sandbox_ready: true,
            previewable: true,
            ..Default::default()
        });
        assert_eq!(
            controller.state().diagnostic_message.as_deref(),
            Some(DIAGNOSTIC_WAITING_FOR_FILES)
        );
        assert!(!controller.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_failure_clears_guard() {
        let sandbox = mounted_sandbox(project_with_manifest()).await;
        sandbox.set_response(
            "npm install",
            MockProcessResponse::exits(1, Duration::from_secs(10)),
        );
        let controller = PreviewController::new(Arc::clone(&sandbox), PreviewConfig::default());

        let started_at = tokio::time::Instant::now();
        controller.evaluate(&Preconditions::ready());
        assert_eq!(controller.phase(), PreviewPhase::Installing);
        assert!(controller.is_started());

        let state = settle(&controller).await;
        assert_eq!(state.phase, PreviewPhase::Error);
        assert_eq!(state.error, Some(PreviewError::InstallFailed { code: 1 }));
        assert!(state.error_message().unwrap().contains('1'));
        assert!(started_at.elapsed() >= Duration::from_secs(10));
        assert!(started_at.elapsed() < Duration::from_secs(180));
        assert!(!controller.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_timeout() {
        let sandbox = mounted_sandbox(project_with_manifest()).await;
        sandbox.set_response("npm install", MockProcessResponse::hangs());
        let controller = PreviewController::new(Arc::clone(&sandbox), PreviewConfig::default());

        controller.evaluate(&Preconditions::ready());
        let state = settle(&controller).await;
        assert_eq!(state.error, Some(PreviewError::InstallTimeout { secs: 180 }));
        assert!(!controller.is_started());
        // The start command was never spawned
        assert_eq!(sandbox.spawn_history().len(), 1);
        // The hung install was terminated before Error was published
        assert_eq!(sandbox.killed(), vec!["npm install"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout_allows_reentry() {
        let sandbox = mounted_sandbox(project_with_manifest()).await;
        sandbox.set_response("npm run dev", MockProcessResponse::hangs());
        let controller = PreviewController::new(Arc::clone(&sandbox), PreviewConfig::default());

        controller.evaluate(&Preconditions::ready());
        let state = settle(&controller).await;
        assert_eq!(state.error, Some(PreviewError::StartTimeout { secs: 120 }));
        assert!(!controller.is_started());
        assert_eq!(sandbox.killed(), vec!["npm run dev"]);

        controller.retry();
        controller.evaluate(&Preconditions::ready());
        assert_eq!(controller.phase(), PreviewPhase::Installing);
        assert!(controller.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_reaches_ready() {
        let sandbox = mounted_sandbox(project_with_manifest()).await;
        sandbox.set_response(
            "npm run dev",
            MockProcessResponse::serves(5173, Duration::from_secs(3))
                .with_output(["VITE v5 ready"]),
        );
        let controller = PreviewController::new(Arc::clone(&sandbox), PreviewConfig::default());

        controller.evaluate(&Preconditions::ready());
        let state = settle(&controller).await;
        assert_eq!(state.phase, PreviewPhase::Ready);
        assert_eq!(state.url.as_deref(), Some("http://localhost:5173"));
        assert!(state.output_excerpt.contains("VITE v5 ready"));
        assert!(state.error.is_none());

        // Ready is terminal; more triggers change nothing
        controller.evaluate(&Preconditions::ready());
        assert_eq!(controller.phase(), PreviewPhase::Ready);
        assert_eq!(sandbox.spawn_history().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_registered_before_spawn() {
        let sandbox = mounted_sandbox(project_with_manifest()).await;
        sandbox.set_response(
            "npm run dev",
            MockProcessResponse::serves(5173, Duration::ZERO),
        );
        let controller = PreviewController::new(Arc::clone(&sandbox), PreviewConfig::default());

        controller.evaluate(&Preconditions::ready());
        assert_eq!(settle(&controller).await.phase, PreviewPhase::Ready);

        let history = sandbox.spawn_history();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|call| call.ready_listeners >= 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_exit_before_readiness() {
        let sandbox = mounted_sandbox(project_with_manifest()).await;
        sandbox.set_response(
            "npm run dev",
            MockProcessResponse::exits(0, Duration::from_secs(2)),
        );
        let controller = PreviewController::new(Arc::clone(&sandbox), PreviewConfig::default());

        controller.evaluate(&Preconditions::ready());
        let state = settle(&controller).await;
        assert_eq!(state.error, Some(PreviewError::ServerExitedEarly { code: 0 }));
        assert!(!controller.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_output_is_advisory() {
        let sandbox = mounted_sandbox(project_with_manifest()).await;
        sandbox.set_response(
            "npm run dev",
            MockProcessResponse::serves(3000, Duration::from_secs(5))
                .with_output(["Error: something odd"]),
        );
        let controller = PreviewController::new(Arc::clone(&sandbox), PreviewConfig::default());
        let mut rx = controller.subscribe();

        controller.evaluate(&Preconditions::ready());
        let flagged = rx
            .wait_for(|state| {
                state.diagnostic_message.as_deref() == Some(DIAGNOSTIC_SERVER_ERROR)
            })
            .await
            .unwrap()
            .clone();
        assert_eq!(flagged.phase, PreviewPhase::Starting);

        assert_eq!(settle(&controller).await.phase, PreviewPhase::Ready);
    }

    #[tokio::test]
    async fn test_misplaced_manifest_names_directory() {
        let description = serde_json::from_value(json!({
            "app": { "directory": { "package.json": { "file": { "contents": "{}" } } } },
            "README.md": { "file": { "contents": "hi" } }
        }))
        .unwrap();
        let sandbox = mounted_sandbox(description).await;
        let controller = PreviewController::new(Arc::clone(&sandbox), PreviewConfig::default());

        controller.evaluate(&Preconditions::ready());
        let state = settle(&controller).await;
        assert_eq!(
            state.error,
            Some(PreviewError::ManifestMisplaced {
                dir: "app".to_string()
            })
        );
        assert!(state.error_message().unwrap().contains("'app'"));
        assert!(sandbox.spawn_history().is_empty());

        // Manifest errors hold the guard until an explicit retry
        assert!(controller.is_started());
        controller.retry();
        assert!(!controller.is_started());
    }

    #[tokio::test]
    async fn test_missing_manifest() {
        let description = serde_json::from_value(json!({
            "src": { "directory": { "main.tsx": { "file": { "contents": "x" } } } },
            "package.json": { "file": { "contents": "   " } }
        }))
        .unwrap();
        let sandbox = mounted_sandbox(description).await;
        let controller = PreviewController::new(Arc::clone(&sandbox), PreviewConfig::default());

        controller.evaluate(&Preconditions::ready());
        match settle(&controller).await.error {
            Some(PreviewError::ManifestMissing { reason }) => {
                assert!(reason.contains("empty"));
                assert!(reason.contains("src"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        struct NoSpawn(MockSandbox);

        #[async_trait::async_trait]
        impl Sandbox for NoSpawn {
            async fn mount(
                &self,
                description: &MountDescription,
            ) -> Result<(), crate::errors::SandboxError> {
                self.0.mount(description).await
            }
            async fn spawn(
                &self,
                command: &str,
                _args: &[String],
            ) -> Result<ProcessHandle, crate::errors::SandboxError> {
                Err(crate::errors::SandboxError::Spawn {
                    command: command.to_string(),
                    message: "not found".to_string(),
                })
            }
            fn subscribe_server_ready(&self) -> broadcast::Receiver<ServerReady> {
                self.0.subscribe_server_ready()
            }
            async fn read_file(&self, path: &str) -> Result<String, crate::errors::SandboxError> {
                self.0.read_file(path).await
            }
            async fn read_dir(
                &self,
                path: &str,
            ) -> Result<Vec<crate::sandbox::DirEntry>, crate::errors::SandboxError> {
                self.0.read_dir(path).await
            }
        }

        let inner = MockSandbox::new();
        inner.mount(&project_with_manifest()).await.unwrap();
        let controller = PreviewController::new(Arc::new(NoSpawn(inner)), PreviewConfig::default());

        controller.evaluate(&Preconditions::ready());
        let mut rx = controller.subscribe();
        let state = rx
            .wait_for(|state| state.phase.is_settled())
            .await
            .unwrap()
            .clone();
        assert!(matches!(
            state.error,
            Some(PreviewError::SpawnFailed { ref command, .. }) if command == "npm install"
        ));
        assert!(!controller.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_attempt_cannot_write_after_reset() {
        let sandbox = mounted_sandbox(project_with_manifest()).await;
        sandbox.set_response(
            "npm install",
            MockProcessResponse::exits(1, Duration::from_secs(30)),
        );
        let controller = PreviewController::new(Arc::clone(&sandbox), PreviewConfig::default());

        controller.evaluate(&Preconditions::ready());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(controller.phase(), PreviewPhase::Installing);

        controller.reset();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(controller.state(), LifecycleState::default());
        assert_eq!(sandbox.killed(), vec!["npm install"]);

        sandbox.set_response("npm install", MockProcessResponse::default());
        sandbox.set_response("npm run dev", MockProcessResponse::serves(8080, Duration::ZERO));
        controller.evaluate(&Preconditions::ready());
        assert_eq!(settle(&controller).await.phase, PreviewPhase::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_triggers_start_one_attempt() {
        let sandbox = mounted_sandbox(project_with_manifest()).await;
        sandbox.set_response("npm install", MockProcessResponse::hangs());
        let controller = PreviewController::new(Arc::clone(&sandbox), PreviewConfig::default());

        for _ in 0..5 {
            controller.evaluate(&Preconditions::ready());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sandbox.spawn_history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_cancels_attempt() {
        let sandbox = mounted_sandbox(project_with_manifest()).await;
        sandbox.set_response("npm install", MockProcessResponse::hangs());
        let controller = PreviewController::new(Arc::clone(&sandbox), PreviewConfig::default());

        controller.evaluate(&Preconditions::ready());
        controller.teardown().await;
        controller.teardown().await;
        assert!(sandbox.is_torn_down());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(controller.phase(), PreviewPhase::Installing);
        assert!(!controller.is_started());
    }
}
