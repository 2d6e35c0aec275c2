//! Generation session
//!
//! Scopes one generation's steps, file tree, sandbox and preview controller.
//! Nothing is shared between sessions and nothing outlives one.

use crate::config::PreviewConfig;
use crate::errors::{Result, TreeError};
use crate::file_tree::{apply_pending_steps, FileTree};
use crate::lifecycle::{Preconditions, PreviewController};
use crate::mount::{ensure_scaffold, project, MountDescription};
use crate::preview::PreviewBinding;
use crate::sandbox::Sandbox;
use crate::steps::{StepId, StepRecord, StepStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Kind of artifact the generation produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[default]
    Frontend,
    Backend,
}

impl TargetKind {
    /// Only frontend projects run a previewable dev server
    pub fn is_previewable(&self) -> bool {
        matches!(self, TargetKind::Frontend)
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Frontend => f.write_str("frontend"),
            TargetKind::Backend => f.write_str("backend"),
        }
    }
}

impl FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "frontend" => Ok(TargetKind::Frontend),
            "backend" => Ok(TargetKind::Backend),
            other => Err(format!("unknown target kind '{}'", other)),
        }
    }
}

pub struct GenerationSession<S: Sandbox + 'static> {
    steps: Vec<StepRecord>,
    tree: FileTree,
    last_fingerprint: Option<String>,
    sandbox: Arc<S>,
    controller: PreviewController<S>,
    preconditions: Preconditions,
}

impl<S: Sandbox + 'static> GenerationSession<S> {
    /// Create a session around an already booted sandbox
    pub fn new(sandbox: Arc<S>, config: PreviewConfig, target: TargetKind) -> Self {
        let controller = PreviewController::new(Arc::clone(&sandbox), config);
        Self {
            steps: Vec::new(),
            tree: FileTree::new(),
            last_fingerprint: None,
            sandbox,
            controller,
            preconditions: Preconditions {
                sandbox_ready: true,
                files_mounted: false,
                previewable: target.is_previewable(),
                sandbox_error: None,
            },
        }
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn tree(&self) -> &FileTree {
        &self.tree
    }

    pub fn controller(&self) -> &PreviewController<S> {
        &self.controller
    }

    /// Queue a batch; every record is (re)marked pending
    pub fn push_steps<I>(&mut self, steps: I)
    where
        I: IntoIterator<Item = StepRecord>,
    {
        let before = self.steps.len();
        self.steps.extend(steps.into_iter().map(|mut step| {
            step.status = StepStatus::Pending;
            step
        }));
        debug!("Queued {} steps", self.steps.len() - before);
    }

    /// Fold pending steps into the tree.
    ///
    /// On a conflict neither the tree nor any step status changes.
    pub fn apply_pending(&mut self) -> std::result::Result<Vec<StepId>, TreeError> {
        let outcome = apply_pending_steps(&self.tree, &mut self.steps)?;
        self.tree = outcome.tree;
        Ok(outcome.completed)
    }

    /// Drop every record still pending, typically a batch rejected by
    /// [`apply_pending`](Self::apply_pending), and return it
    pub fn discard_pending(&mut self) -> Vec<StepRecord> {
        let (pending, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.steps)
            .into_iter()
            .partition(StepRecord::is_pending);
        self.steps = kept;
        if !pending.is_empty() {
            info!("Discarded {} pending steps", pending.len());
        }
        pending
    }

    /// Scaffolded projection of the current tree
    pub fn prepare_mount(&self) -> MountDescription {
        project(&ensure_scaffold(&self.tree))
    }

    /// Mount the current tree when it changed since the last mount, then
    /// re-evaluate the controller. Returns whether a mount happened.
    #[instrument(skip(self))]
    pub async fn mount(&mut self) -> Result<bool> {
        if self.tree.is_empty() {
            debug!("No generated files yet; skipping mount");
            return Ok(false);
        }

        let description = self.prepare_mount();
        let fingerprint = description.fingerprint();
        if self.last_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            debug!("Project unchanged since last mount");
            self.evaluate();
            return Ok(false);
        }

        self.preconditions.files_mounted = false;
        self.sandbox.mount(&description).await?;
        info!("Mounted {} root entries", description.len());

        self.last_fingerprint = Some(fingerprint);
        self.preconditions.files_mounted = true;
        self.evaluate();
        Ok(true)
    }

    /// Report a sandbox boot failure
    pub fn report_sandbox_error(&mut self, message: impl Into<String>) {
        self.preconditions.sandbox_error = Some(message.into());
        self.evaluate();
    }

    /// Re-supply the current preconditions to the controller
    pub fn evaluate(&self) {
        self.controller.evaluate(&self.preconditions);
    }

    pub fn binding(&self) -> PreviewBinding<S> {
        PreviewBinding::new(self.controller.clone())
    }

    pub async fn teardown(&self) {
        self.controller.teardown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::PreviewPhase;
    use crate::mount::{MountNode, MANIFEST_NAME, MARKUP_NAME};
    use crate::sandbox::mock::{MockProcessResponse, MockSandbox};
    use std::time::Duration;

    fn session(target: TargetKind) -> (Arc<MockSandbox>, GenerationSession<MockSandbox>) {
        let sandbox = Arc::new(MockSandbox::new());
        let session = GenerationSession::new(Arc::clone(&sandbox), PreviewConfig::default(), target);
        (sandbox, session)
    }

    #[test]
    fn test_target_kind_parsing() {
        assert_eq!("frontend".parse::<TargetKind>(), Ok(TargetKind::Frontend));
        assert_eq!("Backend".parse::<TargetKind>(), Ok(TargetKind::Backend));
        assert!("mobile".parse::<TargetKind>().is_err());
        assert!(!TargetKind::Backend.is_previewable());
    }

    #[tokio::test]
    async fn test_empty_tree_is_never_mounted() {
        let (sandbox, mut session) = session(TargetKind::Frontend);
        assert!(!session.mount().await.unwrap());
        assert_eq!(sandbox.mount_count(), 0);
        assert_eq!(session.controller().phase(), PreviewPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_starts_preview_once_per_content() {
        let (sandbox, mut session) = session(TargetKind::Frontend);
        sandbox.set_response(
            "npm run dev",
            MockProcessResponse::serves(5173, Duration::from_secs(1)),
        );

        session.push_steps(vec![StepRecord::create_file(1, "src/main.tsx", "main")]);
        assert_eq!(session.apply_pending().unwrap(), vec![StepId(1)]);
        assert!(session.mount().await.unwrap());
        assert!(!session.mount().await.unwrap());
        assert_eq!(sandbox.mount_count(), 1);

        let mounted = sandbox.mounted().unwrap();
        let keys: Vec<_> = mounted.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec![MANIFEST_NAME, MARKUP_NAME, "src"]);
        assert!(matches!(mounted.get("src"), Some(MountNode::Directory { .. })));

        let view = session.binding().settled().await;
        assert_eq!(view.url.as_deref(), Some("http://localhost:5173"));
    }

    #[tokio::test]
    async fn test_mount_failure_leaves_files_unmounted() {
        let (sandbox, mut session) = session(TargetKind::Frontend);
        sandbox.fail_mounts("quota exceeded");
        session.push_steps(vec![StepRecord::create_file(1, "index.ts", "x")]);
        session.apply_pending().unwrap();

        let err = session.mount().await.unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
        assert_eq!(session.controller().phase(), PreviewPhase::Idle);
        assert!(!session.controller().is_started());
    }

    #[tokio::test]
    async fn test_backend_target_is_unsupported() {
        let (sandbox, mut session) = session(TargetKind::Backend);
        session.push_steps(vec![StepRecord::create_file(1, "server.ts", "x")]);
        session.apply_pending().unwrap();
        session.mount().await.unwrap();

        let view = session.binding().view();
        assert_eq!(view.phase, PreviewPhase::Error);
        assert_eq!(
            view.error_message.as_deref(),
            Some("Preview is only available for frontend code")
        );
        assert!(sandbox.spawn_history().is_empty());
    }

    #[tokio::test]
    async fn test_conflicting_batch_keeps_previous_tree() {
        let (_sandbox, mut session) = session(TargetKind::Frontend);
        session.push_steps(vec![StepRecord::create_file(1, "src", "not a folder")]);
        session.apply_pending().unwrap();

        session.push_steps(vec![StepRecord::create_file(2, "src/app.ts", "x")]);
        let err = session.apply_pending().unwrap_err();
        assert!(matches!(err, TreeError::StructuralPathConflict { .. }));
        assert_eq!(session.tree().roots.len(), 1);
        assert!(session.steps()[1].is_pending());
    }

    #[tokio::test]
    async fn test_later_batch_folds_after_discarding_conflict() {
        let (_sandbox, mut session) = session(TargetKind::Frontend);
        session.push_steps(vec![StepRecord::create_file(1, "src", "not a folder")]);
        session.apply_pending().unwrap();
        session.push_steps(vec![StepRecord::create_file(2, "src/app.ts", "x")]);
        assert!(session.apply_pending().is_err());

        let rejected = session.discard_pending();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].id, StepId(2));
        assert_eq!(session.steps().len(), 1);

        session.push_steps(vec![StepRecord::create_file(3, "lib/util.ts", "y")]);
        assert_eq!(session.apply_pending().unwrap(), vec![StepId(3)]);
        assert_eq!(session.tree().roots.len(), 2);
        assert!(session.steps().iter().all(|step| !step.is_pending()));
        assert!(session.discard_pending().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_releases_sandbox() {
        let (sandbox, session) = session(TargetKind::Frontend);
        session.teardown().await;
        assert!(sandbox.is_torn_down());
    }
}
