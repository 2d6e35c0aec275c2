//! Step records produced by the upstream parser
//!
//! A step describes one generated instruction ("create this file with this
//! content", "create this folder", "run this script"). Batches arrive in order
//! and are folded into the project tree by [`crate::file_tree`].

use crate::errors::{Result, StagehandError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, instrument};

/// Identifier of a step within one generation session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub u64);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of generated instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepKind {
    /// Create a file, or overwrite the content of an existing one
    CreateFile,
    /// Create a (possibly nested) folder
    CreateFolder,
    /// Shell script emitted by the generator; carried but never folded into the tree
    RunScript,
}

/// Processing status of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Completed,
}

/// One ordered instruction from the parsing collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub id: StepId,
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub status: StepStatus,
}

impl StepRecord {
    /// Create a pending `CreateFile` step
    pub fn create_file(id: u64, path: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: StepId(id),
            kind: StepKind::CreateFile,
            path: Some(path.into()),
            payload: payload.into(),
            status: StepStatus::Pending,
        }
    }

    /// Create a pending `CreateFolder` step
    pub fn create_folder(id: u64, path: impl Into<String>) -> Self {
        Self {
            id: StepId(id),
            kind: StepKind::CreateFolder,
            path: Some(path.into()),
            payload: String::new(),
            status: StepStatus::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == StepStatus::Pending
    }
}

/// Decode a step batch from JSON or JSON5 text
pub fn parse_steps(content: &str) -> Result<Vec<StepRecord>> {
    let raw: serde_json::Value = json5::from_str(content).map_err(|e| StagehandError::Steps {
        message: format!("JSON parsing error: {}", e),
    })?;

    if !raw.is_array() {
        return Err(StagehandError::Steps {
            message: "step batch must be a JSON array".to_string(),
        });
    }

    serde_json::from_value(raw).map_err(|e| StagehandError::Steps {
        message: format!("Deserialization error: {}", e),
    })
}

/// Read a step batch from disk
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_steps(path: &Path) -> Result<Vec<StepRecord>> {
    let content = std::fs::read_to_string(path).map_err(|e| StagehandError::Steps {
        message: format!("failed to read {}: {}", path.display(), e),
    })?;
    let steps = parse_steps(&content)?;
    debug!("Loaded {} step records", steps.len());
    Ok(steps)
}
