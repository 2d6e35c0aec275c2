//! Incremental file tree synthesis
//!
//! Folds ordered [`StepRecord`]s into a hierarchical [`FileTree`]. Folding is
//! pure and synchronous: a batch either folds completely, in which case every
//! pending step is marked completed together, or it fails and nothing changes.
//!
//! ## Path handling
//!
//! Step paths are normalised by stripping one leading `/`, splitting on `/`
//! and dropping empty segments, so `/src//app.ts` and `src/app.ts` address the
//! same node. Sibling order is insertion order: new nodes always append.

use crate::errors::TreeError;
use crate::steps::{StepId, StepKind, StepRecord, StepStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Kind-specific payload of a tree node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeKind {
    File { content: String },
    Folder { children: Vec<FileNode> },
}

/// A file or folder in the synthesized project tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    /// Last path segment
    pub name: String,
    /// Normalised path from the project root
    pub path: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl FileNode {
    pub fn file(name: impl Into<String>, path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind: NodeKind::File {
                content: content.into(),
            },
        }
    }

    pub fn folder(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind: NodeKind::Folder {
                children: Vec::new(),
            },
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.kind, NodeKind::Folder { .. })
    }

    /// File content, `None` for folders
    pub fn content(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::File { content } => Some(content),
            NodeKind::Folder { .. } => None,
        }
    }

    /// Children in insertion order, empty for files
    pub fn children(&self) -> &[FileNode] {
        match &self.kind {
            NodeKind::Folder { children } => children,
            NodeKind::File { .. } => &[],
        }
    }

    fn matches(&self, name: &str, path: &str) -> bool {
        self.name == name || self.path == path
    }
}

/// Ordered root entries of one project
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileTree {
    pub roots: Vec<FileNode>,
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Look a node up by path (normalised the same way as step paths)
    pub fn find(&self, path: &str) -> Option<&FileNode> {
        let segments = normalize_path(path);
        let mut scope: &[FileNode] = &self.roots;
        let mut found = None;
        for segment in segments {
            let node = scope.iter().find(|n| n.name == segment)?;
            scope = node.children();
            found = Some(node);
        }
        found
    }

    /// Whether a node with this name exists at the root level
    pub fn has_root_entry(&self, name: &str) -> bool {
        self.roots.iter().any(|n| n.name == name || n.path == name)
    }

    /// Whether a node with this name exists at any depth
    pub fn contains_named(&self, name: &str) -> bool {
        fn walk(nodes: &[FileNode], name: &str) -> bool {
            nodes.iter().any(|n| {
                n.name == name
                    || n.path == name
                    || n.path.ends_with(&format!("/{}", name))
                    || walk(n.children(), name)
            })
        }
        walk(&self.roots, name)
    }

    /// Number of file nodes at any depth
    pub fn file_count(&self) -> usize {
        fn count(nodes: &[FileNode]) -> usize {
            nodes
                .iter()
                .map(|n| match &n.kind {
                    NodeKind::File { .. } => 1,
                    NodeKind::Folder { children } => count(children),
                })
                .sum()
        }
        count(&self.roots)
    }
}

/// Result of a successful fold pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub tree: FileTree,
    /// Ids of the steps marked completed by this pass, in batch order
    pub completed: Vec<StepId>,
}

/// Split a step path into its non-empty segments
pub fn normalize_path(path: &str) -> Vec<&str> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    trimmed.split('/').filter(|s| !s.is_empty()).collect()
}

/// Fold every pending step into a copy of `tree`.
///
/// On success the pending steps are marked [`StepStatus::Completed`] as one
/// batch and the new tree is returned. On failure `steps` and `tree` are left
/// exactly as they were.
#[instrument(skip_all, fields(steps = steps.len()))]
pub fn apply_pending_steps(
    tree: &FileTree,
    steps: &mut [StepRecord],
) -> Result<StepOutcome, TreeError> {
    let mut next = tree.clone();
    let mut completed = Vec::new();

    for step in steps.iter().filter(|s| s.is_pending()) {
        fold_step(&mut next.roots, step)?;
        completed.push(step.id);
    }

    for step in steps.iter_mut().filter(|s| s.is_pending()) {
        step.status = StepStatus::Completed;
    }

    debug!(
        "Folded {} pending steps; tree now holds {} files",
        completed.len(),
        next.file_count()
    );

    Ok(StepOutcome {
        tree: next,
        completed,
    })
}

fn fold_step(roots: &mut Vec<FileNode>, step: &StepRecord) -> Result<(), TreeError> {
    if step.kind == StepKind::RunScript {
        return Ok(());
    }

    let segments = normalize_path(step.path.as_deref().unwrap_or_default());
    let Some((last, parents)) = segments.split_last() else {
        return Err(TreeError::EmptyPath { step: step.id.0 });
    };

    let mut scope = roots;
    let mut current = String::new();
    for segment in parents {
        current = join(&current, segment);
        scope = descend(scope, segment, &current)?;
    }
    let full = join(&current, last);

    match step.kind {
        StepKind::CreateFile => upsert_file(scope, last, &full, &step.payload),
        StepKind::CreateFolder => descend(scope, last, &full).map(|_| ()),
        StepKind::RunScript => Ok(()),
    }
}

fn join(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{}/{}", prefix, segment)
    }
}

/// Find or create the folder `name` in `scope` and return its children
fn descend<'a>(
    scope: &'a mut Vec<FileNode>,
    name: &str,
    path: &str,
) -> Result<&'a mut Vec<FileNode>, TreeError> {
    let index = match scope.iter().position(|n| n.matches(name, path)) {
        Some(index) => index,
        None => {
            debug!("Created folder: {}", path);
            scope.push(FileNode::folder(name, path));
            scope.len() - 1
        }
    };

    match &mut scope[index].kind {
        NodeKind::Folder { children } => Ok(children),
        NodeKind::File { .. } => Err(TreeError::StructuralPathConflict {
            path: path.to_string(),
        }),
    }
}

fn upsert_file(
    scope: &mut Vec<FileNode>,
    name: &str,
    path: &str,
    payload: &str,
) -> Result<(), TreeError> {
    match scope.iter_mut().find(|n| n.matches(name, path)) {
        Some(node) => match &mut node.kind {
            NodeKind::File { content } => {
                debug!("Updated file: {}", path);
                *content = payload.to_string();
                Ok(())
            }
            NodeKind::Folder { .. } => Err(TreeError::StructuralPathConflict {
                path: path.to_string(),
            }),
        },
        None => {
            debug!("Created file: {}", path);
            scope.push(FileNode::file(name, path, payload));
            Ok(())
        }
    }
}
