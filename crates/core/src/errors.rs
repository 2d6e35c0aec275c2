//! Error types and handling
//!
//! The error taxonomy is split per domain (file tree folding, sandbox runtime,
//! preview lifecycle, configuration) and wrapped in the top-level
//! `StagehandError` enum for unified handling by callers.

use thiserror::Error;

/// Errors raised while folding step records into a file tree
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// A path needs a folder where a file already exists (or the reverse)
    #[error("Structural path conflict at '{path}': an existing entry has a different kind")]
    StructuralPathConflict { path: String },

    /// A step carried no usable path segments
    #[error("Step {step} has an empty path")]
    EmptyPath { step: u64 },
}

/// Errors surfaced by a sandbox runtime implementation
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Materialising the mount description failed
    #[error("Failed to mount project files: {message}")]
    Mount { message: String },

    /// A process could not be spawned
    #[error("Failed to spawn '{command}': {message}")]
    Spawn { command: String, message: String },

    /// A path was not found in the sandbox filesystem
    #[error("No such file or directory: {path}")]
    NotFound { path: String },

    /// A path would escape the sandbox root
    #[error("Invalid sandbox path: {path}")]
    InvalidPath { path: String },

    /// Underlying I/O error
    #[error("Sandbox I/O error")]
    Io(#[from] std::io::Error),
}

/// Terminal failures of a preview attempt.
///
/// The `Display` text of each variant is what the display layer shows as the
/// Error state's message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreviewError {
    /// The generated artifact kind cannot be previewed
    #[error("Preview is only available for frontend code")]
    UnsupportedTarget,

    /// The sandbox failed to boot before any attempt was made
    #[error("Sandbox initialization failed: {message}")]
    SandboxInitFailure { message: String },

    /// No manifest at the root or in any first-level subdirectory
    #[error("package.json not found: {reason}. Please ensure the project files are properly loaded and package.json is in the root directory.")]
    ManifestMissing { reason: String },

    /// The manifest lives in a subdirectory instead of the project root
    #[error("package.json found in subdirectory '{dir}' but not in root. The project structure may be incorrect.")]
    ManifestMisplaced { dir: String },

    /// Dependency install did not exit within its budget
    #[error("Dependency install is taking too long (>{secs} seconds). The project may have dependency issues. Check the logs for details.")]
    InstallTimeout { secs: u64 },

    /// Dependency install exited with a non-zero code
    #[error("Dependency install failed with exit code {code}. Check the logs for details.")]
    InstallFailed { code: i32 },

    /// The server never became reachable within its budget
    #[error("Dev server is taking too long to start (>{secs} seconds). Please check the logs for errors.")]
    StartTimeout { secs: u64 },

    /// The server process exited before readiness was signalled
    #[error("Dev server exited with code {code}. Check the logs for details.")]
    ServerExitedEarly { code: i32 },

    /// A lifecycle command could not be spawned at all
    #[error("Failed to spawn '{command}': {message}")]
    SpawnFailed { command: String, message: String },
}

impl PreviewError {
    /// Whether this failure resets the single-flight guard on its own.
    ///
    /// Process failures are transient and may be retried by re-supplying
    /// preconditions. Manifest problems and configuration faults need an
    /// explicit retry or reset.
    pub fn clears_guard(&self) -> bool {
        matches!(
            self,
            PreviewError::InstallTimeout { .. }
                | PreviewError::InstallFailed { .. }
                | PreviewError::StartTimeout { .. }
                | PreviewError::ServerExitedEarly { .. }
                | PreviewError::SpawnFailed { .. }
        )
    }

    /// Whether this failure stems from configuration and survives retry
    pub fn is_latched(&self) -> bool {
        matches!(
            self,
            PreviewError::UnsupportedTarget | PreviewError::SandboxInitFailure { .. }
        )
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file parsing error
    #[error("Failed to parse configuration file: {message}")]
    Parsing { message: String },

    /// Configuration validation error
    #[error("Configuration validation error: {message}")]
    Validation { message: String },

    /// Configuration file I/O error
    #[error("Failed to read configuration file")]
    Io(#[from] std::io::Error),

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    NotFound { path: String },
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum StagehandError {
    /// Step folding errors
    #[error("File tree error: {0}")]
    Tree(#[from] TreeError),

    /// Sandbox runtime errors
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    /// Preview lifecycle errors
    #[error("Preview error: {0}")]
    Preview(#[from] PreviewError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Step batch could not be read or decoded
    #[error("Invalid step batch: {message}")]
    Steps { message: String },
}

/// Convenience type alias for Results with StagehandError
pub type Result<T> = std::result::Result<T, StagehandError>;
