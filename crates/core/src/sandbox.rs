//! Sandbox runtime capability
//!
//! The lifecycle controller treats the sandbox as an opaque runtime that can
//! mount a [`MountDescription`], spawn named commands, stream their output,
//! report exit codes and announce when a server becomes reachable.
//!
//! Two implementations ship with the crate: [`crate::local::LocalSandbox`]
//! runs commands on the host, and [`mock::MockSandbox`] replays scripted
//! responses for tests.

use crate::errors::SandboxError;
use crate::mount::MountDescription;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};

/// Exit code reported when a process disappears without reporting one
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Readiness notification: a spawned server is listening
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReady {
    pub port: u16,
    pub url: String,
}

/// A directory listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    pub is_directory: bool,
}

/// Output stream and exit signal of one spawned process.
///
/// Dropping the handle terminates the process if it is still running.
#[derive(Debug)]
pub struct ProcessHandle {
    /// Combined stdout/stderr chunks, in arrival order
    pub output: mpsc::Receiver<Bytes>,
    /// Resolves once with the exit code
    pub exit: oneshot::Receiver<i32>,
    kill: Option<oneshot::Sender<()>>,
}

/// Runtime side of a [`ProcessHandle`]
#[derive(Debug)]
pub struct ProcessFeed {
    pub output: mpsc::Sender<Bytes>,
    pub exit: oneshot::Sender<i32>,
    /// Resolves when the handle asks for termination or is dropped
    pub killed: oneshot::Receiver<()>,
}

impl ProcessHandle {
    /// Create a handle plus the feed a runtime drives
    pub fn channel(capacity: usize) -> (ProcessHandle, ProcessFeed) {
        let (output_tx, output) = mpsc::channel(capacity);
        let (exit_tx, exit) = oneshot::channel();
        let (kill_tx, killed) = oneshot::channel();
        (
            ProcessHandle {
                output,
                exit,
                kill: Some(kill_tx),
            },
            ProcessFeed {
                output: output_tx,
                exit: exit_tx,
                killed,
            },
        )
    }

    /// Ask the runtime to terminate the process; later calls do nothing
    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// Capability interface of an ephemeral sandbox runtime
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Materialise a project into the sandbox filesystem
    async fn mount(&self, description: &MountDescription) -> Result<(), SandboxError>;

    /// Spawn `command` with `args` from the project root
    async fn spawn(&self, command: &str, args: &[String]) -> Result<ProcessHandle, SandboxError>;

    /// Register a readiness listener.
    ///
    /// Registration is synchronous so callers can subscribe strictly before
    /// spawning the process that will become ready.
    fn subscribe_server_ready(&self) -> broadcast::Receiver<ServerReady>;

    /// Read a UTF-8 file relative to the project root
    async fn read_file(&self, path: &str) -> Result<String, SandboxError>;

    /// List a directory relative to the project root (`"."` is the root)
    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SandboxError>;

    /// Release processes and resources held by the runtime
    async fn teardown(&self) {}
}

pub mod mock {
    //! Scripted sandbox runtime for tests
    //!
    //! Responses are looked up by the full command line (`"npm install"`),
    //! falling back to a default. Each spawn runs on its own task driven by
    //! `tokio::time`, so tests using a paused clock stay deterministic.

    use super::*;
    use crate::mount::MountNode;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tracing::{debug, instrument};

    /// Scripted behaviour of one spawned process
    #[derive(Debug, Clone)]
    pub struct MockProcessResponse {
        /// Chunks written to the output stream right after spawn
        pub output: Vec<String>,
        /// Announce readiness on this port after the delay, if set
        pub ready_after: Option<(Duration, u16)>,
        /// Exit with this code after `exit_after`; `None` runs until killed
        pub exit_code: Option<i32>,
        /// Delay before the exit code is reported, counted after readiness
        pub exit_after: Duration,
    }

    impl Default for MockProcessResponse {
        fn default() -> Self {
            Self {
                output: Vec::new(),
                ready_after: None,
                exit_code: Some(0),
                exit_after: Duration::ZERO,
            }
        }
    }

    impl MockProcessResponse {
        /// Exit with `code` after `delay`
        pub fn exits(code: i32, delay: Duration) -> Self {
            Self {
                exit_code: Some(code),
                exit_after: delay,
                ..Default::default()
            }
        }

        /// Become ready on `port` after `delay` and keep running
        pub fn serves(port: u16, delay: Duration) -> Self {
            Self {
                ready_after: Some((delay, port)),
                exit_code: None,
                ..Default::default()
            }
        }

        /// Never exit on its own and never become ready
        pub fn hangs() -> Self {
            Self {
                exit_code: None,
                ..Default::default()
            }
        }

        pub fn with_output<I, S>(mut self, chunks: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            self.output = chunks.into_iter().map(Into::into).collect();
            self
        }
    }

    /// Record of a spawn call
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MockSpawnCall {
        pub command: String,
        pub args: Vec<String>,
        /// Readiness listeners registered when the spawn happened
        pub ready_listeners: usize,
    }

    #[derive(Debug, Default)]
    struct MockState {
        mounted: Option<MountDescription>,
        mount_count: usize,
        fail_mount: Option<String>,
        responses: HashMap<String, MockProcessResponse>,
        default_response: MockProcessResponse,
        spawn_history: Vec<MockSpawnCall>,
        killed: Vec<String>,
        torn_down: bool,
    }

    /// Mock sandbox runtime
    #[derive(Debug, Clone)]
    pub struct MockSandbox {
        state: Arc<Mutex<MockState>>,
        ready_tx: broadcast::Sender<ServerReady>,
        shutdown_tx: broadcast::Sender<()>,
    }

    impl Default for MockSandbox {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockSandbox {
        pub fn new() -> Self {
            let (ready_tx, _) = broadcast::channel(16);
            let (shutdown_tx, _) = broadcast::channel(1);
            Self {
                state: Arc::new(Mutex::new(MockState::default())),
                ready_tx,
                shutdown_tx,
            }
        }

        /// Script the response for a full command line such as `"npm install"`
        pub fn with_response(self, command_line: &str, response: MockProcessResponse) -> Self {
            self.set_response(command_line, response);
            self
        }

        pub fn set_response(&self, command_line: &str, response: MockProcessResponse) {
            let mut state = self.state.lock().unwrap();
            state.responses.insert(command_line.to_string(), response);
        }

        pub fn set_default_response(&self, response: MockProcessResponse) {
            self.state.lock().unwrap().default_response = response;
        }

        /// Make every subsequent mount fail with `message`
        pub fn fail_mounts(&self, message: &str) {
            self.state.lock().unwrap().fail_mount = Some(message.to_string());
        }

        pub fn mounted(&self) -> Option<MountDescription> {
            self.state.lock().unwrap().mounted.clone()
        }

        pub fn mount_count(&self) -> usize {
            self.state.lock().unwrap().mount_count
        }

        pub fn spawn_history(&self) -> Vec<MockSpawnCall> {
            self.state.lock().unwrap().spawn_history.clone()
        }

        pub fn is_torn_down(&self) -> bool {
            self.state.lock().unwrap().torn_down
        }

        /// Command lines of processes terminated before exiting on their own
        pub fn killed(&self) -> Vec<String> {
            self.state.lock().unwrap().killed.clone()
        }

        fn lookup(&self, path: &str) -> Result<Option<MountNode>, SandboxError> {
            let state = self.state.lock().unwrap();
            let mounted = state.mounted.as_ref().ok_or_else(|| SandboxError::NotFound {
                path: path.to_string(),
            })?;
            Ok(mounted.lookup(path).cloned())
        }
    }

    #[async_trait]
    impl Sandbox for MockSandbox {
        #[instrument(skip_all, fields(entries = description.len()))]
        async fn mount(&self, description: &MountDescription) -> Result<(), SandboxError> {
            let mut state = self.state.lock().unwrap();
            if let Some(message) = &state.fail_mount {
                return Err(SandboxError::Mount {
                    message: message.clone(),
                });
            }
            state.mounted = Some(description.clone());
            state.mount_count += 1;
            Ok(())
        }

        #[instrument(skip(self))]
        async fn spawn(
            &self,
            command: &str,
            args: &[String],
        ) -> Result<ProcessHandle, SandboxError> {
            let command_line = std::iter::once(command.to_string())
                .chain(args.iter().cloned())
                .collect::<Vec<_>>()
                .join(" ");

            let response = {
                let mut state = self.state.lock().unwrap();
                state.spawn_history.push(MockSpawnCall {
                    command: command.to_string(),
                    args: args.to_vec(),
                    ready_listeners: self.ready_tx.receiver_count(),
                });
                state
                    .responses
                    .get(&command_line)
                    .cloned()
                    .unwrap_or_else(|| state.default_response.clone())
            };
            debug!("Mock spawn '{}' -> {:?}", command_line, response);

            let (handle, feed) = ProcessHandle::channel(64);
            let ProcessFeed {
                output: output_tx,
                exit: exit_tx,
                mut killed,
            } = feed;
            let ready_tx = self.ready_tx.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            let state = Arc::clone(&self.state);

            tokio::spawn(async move {
                let script = async move {
                    for chunk in response.output {
                        if output_tx.send(Bytes::from(chunk)).await.is_err() {
                            break;
                        }
                    }
                    if let Some((delay, port)) = response.ready_after {
                        tokio::time::sleep(delay).await;
                        let _ = ready_tx.send(ServerReady {
                            port,
                            url: format!("http://localhost:{}", port),
                        });
                    }
                    match response.exit_code {
                        Some(code) => {
                            tokio::time::sleep(response.exit_after).await;
                            code
                        }
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    code = script => {
                        let _ = exit_tx.send(code);
                    }
                    _ = &mut killed => {
                        debug!("Mock process '{}' killed", command_line);
                        state.lock().unwrap().killed.push(command_line);
                    }
                    _ = shutdown.recv() => {
                        debug!("Mock process '{}' stopped by teardown", command_line);
                        state.lock().unwrap().killed.push(command_line);
                    }
                }
            });

            Ok(handle)
        }

        fn subscribe_server_ready(&self) -> broadcast::Receiver<ServerReady> {
            self.ready_tx.subscribe()
        }

        async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
            match self.lookup(path)? {
                Some(MountNode::File { file }) => Ok(file.contents),
                _ => Err(SandboxError::NotFound {
                    path: path.to_string(),
                }),
            }
        }

        async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SandboxError> {
            let entries = {
                let state = self.state.lock().unwrap();
                let mounted = state.mounted.as_ref().ok_or_else(|| SandboxError::NotFound {
                    path: path.to_string(),
                })?;
                let is_root = crate::file_tree::normalize_path(path)
                    .iter()
                    .all(|s| *s == ".");
                if is_root {
                    Some(mounted.0.clone())
                } else {
                    mounted
                        .lookup(path)
                        .and_then(MountNode::as_directory)
                        .cloned()
                }
            };

            let entries = entries.ok_or_else(|| SandboxError::NotFound {
                path: path.to_string(),
            })?;
            Ok(entries
                .iter()
                .map(|(name, node)| DirEntry {
                    name: name.clone(),
                    is_directory: node.as_directory().is_some(),
                })
                .collect())
        }

        async fn teardown(&self) {
            let _ = self.shutdown_tx.send(());
            self.state.lock().unwrap().torn_down = true;
        }
    }

}
