//! Mount command implementation
//!
//! Implements `stagehand mount`: prints the mount description a sandbox would
//! receive for a step batch.

use crate::commands::tree::fold_steps_file;
use anyhow::{Context, Result};
use stagehand_core::mount::{ensure_scaffold, project};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, instrument};

/// Mount command arguments
#[derive(Debug, Clone)]
pub struct MountArgs {
    /// Step batch file
    pub steps: PathBuf,
    /// Skip manifest and markup synthesis
    pub no_scaffold: bool,
}

/// Execute the mount command
#[instrument(skip(args))]
pub fn execute_mount(args: MountArgs) -> Result<()> {
    let tree = fold_steps_file(&args.steps)?;
    let tree = if args.no_scaffold {
        tree
    } else {
        ensure_scaffold(&tree)
    };

    let description = project(&tree);
    debug!("Mount description fingerprint: {}", description.fingerprint());

    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &description)
        .context("Failed to serialize mount description")?;
    writeln!(stdout)?;
    Ok(())
}
