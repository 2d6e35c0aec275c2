//! Tree command implementation
//!
//! Implements `stagehand tree`: folds a step batch into a file tree and prints
//! the tree as JSON on stdout.

use anyhow::{Context, Result};
use stagehand_core::file_tree::{apply_pending_steps, FileTree};
use stagehand_core::steps::load_steps;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Tree command arguments
#[derive(Debug, Clone)]
pub struct TreeArgs {
    /// Step batch file
    pub steps: PathBuf,
}

/// Execute the tree command
#[instrument(skip(args))]
pub fn execute_tree(args: TreeArgs) -> Result<()> {
    let tree = fold_steps_file(&args.steps)?;

    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &tree).context("Failed to serialize file tree")?;
    writeln!(stdout)?;
    Ok(())
}

/// Load a step batch and fold it into a fresh tree
pub(crate) fn fold_steps_file(path: &Path) -> Result<FileTree> {
    let mut steps = load_steps(path)?;
    debug!("Folding {} steps from {}", steps.len(), path.display());

    let outcome = apply_pending_steps(&FileTree::new(), &mut steps)?;
    info!(
        "Folded {} steps into {} files",
        outcome.completed.len(),
        outcome.tree.file_count()
    );
    Ok(outcome.tree)
}
