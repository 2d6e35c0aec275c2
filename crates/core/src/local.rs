//! Host-backed sandbox runtime
//!
//! Materialises a mount description under a work directory and runs commands
//! there with `tokio::process`. Readiness is detected by probing TCP ports on
//! localhost while a spawned process is alive: a port that was closed when
//! the process started and later accepts connections is announced as
//! `http://localhost:<port>`.

use crate::errors::SandboxError;
use crate::file_tree::normalize_path;
use crate::mount::{MountDescription, MountNode};
use crate::sandbox::{
    DirEntry, ProcessFeed, ProcessHandle, Sandbox, ServerReady, UNKNOWN_EXIT_CODE,
};
use async_trait::async_trait;
use bytes::Bytes;
use directories_next::ProjectDirs;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

/// Marker written into work directories this runtime owns
pub const WORKDIR_MARKER: &str = ".stagehand-workdir";

/// Interval between readiness probes
pub const PROBE_INTERVAL: Duration = Duration::from_millis(250);

const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
const READ_BUFFER_SIZE: usize = 8192;
const OUTPUT_FLUSH_GRACE: Duration = Duration::from_millis(200);

type KillSwitches = Arc<Mutex<HashMap<u64, oneshot::Sender<()>>>>;

/// Sandbox that runs on the host inside a dedicated directory
pub struct LocalSandbox {
    root: PathBuf,
    ready_ports: Vec<u16>,
    ready_tx: broadcast::Sender<ServerReady>,
    /// Teardown switches of processes still running, keyed by spawn id
    kill_switches: KillSwitches,
    next_process: AtomicU64,
}

impl std::fmt::Debug for LocalSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSandbox")
            .field("root", &self.root)
            .field("ready_ports", &self.ready_ports)
            .finish()
    }
}

impl LocalSandbox {
    /// Boot a runtime rooted at `root`, creating the directory when needed.
    ///
    /// An existing non-empty directory is only accepted when it carries the
    /// [`WORKDIR_MARKER`], since mounting clears it.
    pub fn new(root: impl Into<PathBuf>, ready_ports: Vec<u16>) -> Result<Self, SandboxError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let marker = root.join(WORKDIR_MARKER);
        if !marker.exists() {
            if std::fs::read_dir(&root)?.next().is_some() {
                return Err(SandboxError::Mount {
                    message: format!(
                        "refusing to use non-empty directory {} as a work directory",
                        root.display()
                    ),
                });
            }
            std::fs::write(&marker, "")?;
        }

        let (ready_tx, _) = broadcast::channel(16);
        debug!("Local sandbox rooted at {}", root.display());
        Ok(Self {
            root,
            ready_ports,
            ready_tx,
            kill_switches: Arc::new(Mutex::new(HashMap::new())),
            next_process: AtomicU64::new(0),
        })
    }

    /// Per-user cache location used when no work directory is given
    pub fn default_workdir() -> Option<PathBuf> {
        ProjectDirs::from("dev", "stagehand", "stagehand")
            .map(|dirs| dirs.cache_dir().join("preview"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a sandbox-relative path onto the work directory
    fn resolve(&self, path: &str) -> Result<PathBuf, SandboxError> {
        if path.starts_with('/') || path.starts_with('\\') || Path::new(path).is_absolute() {
            return Err(SandboxError::InvalidPath {
                path: path.to_string(),
            });
        }
        let mut resolved = self.root.clone();
        for segment in normalize_path(path) {
            match segment {
                "." => {}
                ".." => {
                    return Err(SandboxError::InvalidPath {
                        path: path.to_string(),
                    })
                }
                _ => resolved.push(segment),
            }
        }
        Ok(resolved)
    }

    async fn clear_root(&self) -> Result<(), SandboxError> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name() == WORKDIR_MARKER {
                continue;
            }
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    /// Number of spawned processes that have not exited yet
    pub fn running_processes(&self) -> usize {
        self.kill_switches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn kill_all(&self) {
        let switches = std::mem::take(
            &mut *self
                .kill_switches
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for switch in switches.into_values() {
            let _ = switch.send(());
        }
    }
}

impl Drop for LocalSandbox {
    fn drop(&mut self) {
        self.kill_all();
    }
}

/// Flatten a description into (relative path, contents) pairs, directories
/// carrying `None`, parents before children
fn flatten(
    prefix: &Path,
    entries: &indexmap::IndexMap<String, MountNode>,
    out: &mut Vec<(PathBuf, Option<String>)>,
) -> Result<(), SandboxError> {
    for (name, node) in entries {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\') {
            return Err(SandboxError::InvalidPath {
                path: prefix.join(name).display().to_string(),
            });
        }
        let path = prefix.join(name);
        match node {
            MountNode::Directory { directory } => {
                out.push((path.clone(), None));
                flatten(&path, directory, out)?;
            }
            MountNode::File { file } => out.push((path, Some(file.contents.clone()))),
        }
    }
    Ok(())
}

async fn pump<R>(mut reader: R, output: mpsc::Sender<Bytes>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if output.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Output stream closed: {}", e);
                break;
            }
        }
    }
}

async fn terminate(child: &mut Child, command: &str) -> i32 {
    debug!("Killing '{}'", command);
    if let Err(e) = child.kill().await {
        warn!("Failed to kill '{}': {}", command, e);
    }
    UNKNOWN_EXIT_CODE
}

async fn port_open(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PROBE_CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Announce the first port that opens while the process is alive
async fn probe_readiness(
    ports: Vec<u16>,
    ready_tx: broadcast::Sender<ServerReady>,
    mut exited: oneshot::Receiver<()>,
) {
    let mut candidates = Vec::with_capacity(ports.len());
    for port in ports {
        if port_open(port).await {
            debug!("Port {} already in use; not probing it", port);
        } else {
            candidates.push(port);
        }
    }
    if candidates.is_empty() {
        return;
    }

    let mut interval = tokio::time::interval(PROBE_INTERVAL);
    loop {
        tokio::select! {
            _ = &mut exited => return,
            _ = interval.tick() => {
                for &port in &candidates {
                    if port_open(port).await {
                        let url = format!("http://localhost:{}", port);
                        info!("Server reachable at {}", url);
                        let _ = ready_tx.send(ServerReady { port, url });
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    #[instrument(skip_all, fields(root = %self.root.display(), entries = description.len()))]
    async fn mount(&self, description: &MountDescription) -> Result<(), SandboxError> {
        let mut items = Vec::new();
        flatten(Path::new(""), &description.0, &mut items)?;

        self.clear_root().await.map_err(|e| SandboxError::Mount {
            message: format!("failed to clear {}: {}", self.root.display(), e),
        })?;

        for (relative, contents) in items {
            let target = self.root.join(&relative);
            let written = match contents {
                None => tokio::fs::create_dir_all(&target).await,
                Some(contents) => tokio::fs::write(&target, contents).await,
            };
            written.map_err(|e| SandboxError::Mount {
                message: format!("failed to write {}: {}", relative.display(), e),
            })?;
        }
        debug!("Materialised project under {}", self.root.display());
        Ok(())
    }

    #[instrument(skip(self), fields(root = %self.root.display()))]
    async fn spawn(&self, command: &str, args: &[String]) -> Result<ProcessHandle, SandboxError> {
        let mut child = Command::new(command)
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Spawn {
                command: command.to_string(),
                message: e.to_string(),
            })?;
        debug!("Spawned '{}' with pid {:?}", command, child.id());

        let (handle, feed) = ProcessHandle::channel(64);
        let ProcessFeed {
            output: output_tx,
            exit: exit_tx,
            mut killed,
        } = feed;
        let stdout = child.stdout.take().map(|out| tokio::spawn(pump(out, output_tx.clone())));
        let stderr = child.stderr.take().map(|err| tokio::spawn(pump(err, output_tx.clone())));
        drop(output_tx);

        let id = self.next_process.fetch_add(1, Ordering::Relaxed);
        let (teardown_tx, mut teardown_rx) = oneshot::channel();
        self.kill_switches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, teardown_tx);

        let (exited_tx, exited_rx) = oneshot::channel();
        if !self.ready_ports.is_empty() {
            tokio::spawn(probe_readiness(
                self.ready_ports.clone(),
                self.ready_tx.clone(),
                exited_rx,
            ));
        }

        let command = command.to_string();
        let switches = Arc::clone(&self.kill_switches);
        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => {
                        // Let buffered output reach the receiver before the exit code
                        let _ = tokio::time::timeout(OUTPUT_FLUSH_GRACE, async {
                            if let Some(task) = stdout {
                                let _ = task.await;
                            }
                            if let Some(task) = stderr {
                                let _ = task.await;
                            }
                        })
                        .await;
                        status.code().unwrap_or(UNKNOWN_EXIT_CODE)
                    }
                    Err(e) => {
                        warn!("Failed to wait for '{}': {}", command, e);
                        UNKNOWN_EXIT_CODE
                    }
                },
                _ = &mut killed => terminate(&mut child, &command).await,
                _ = &mut teardown_rx => terminate(&mut child, &command).await,
            };
            debug!("'{}' exited with code {}", command, code);
            let _ = exited_tx.send(());
            switches
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            let _ = exit_tx.send(code);
        });

        Ok(handle)
    }

    fn subscribe_server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let target = self.resolve(path)?;
        match tokio::fs::read_to_string(&target).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SandboxError::NotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(SandboxError::Io(e)),
        }
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SandboxError> {
        let target = self.resolve(path)?;
        let mut reader = match tokio::fs::read_dir(&target).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SandboxError::NotFound {
                    path: path.to_string(),
                })
            }
            Err(e) => return Err(SandboxError::Io(e)),
        };

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == WORKDIR_MARKER {
                continue;
            }
            entries.push(DirEntry {
                name,
                is_directory: entry.file_type().await?.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn teardown(&self) {
        info!("Stopping processes under {}", self.root.display());
        self.kill_all();
    }
}
