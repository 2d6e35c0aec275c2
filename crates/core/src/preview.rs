//! Display-facing view of a preview controller

use crate::lifecycle::{LifecycleState, PreviewController, PreviewPhase};
use crate::sandbox::Sandbox;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// What the display layer renders
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewView {
    pub phase: PreviewPhase,
    pub url: Option<String>,
    pub diagnostic_message: Option<String>,
    pub error_message: Option<String>,
}

impl From<&LifecycleState> for PreviewView {
    fn from(state: &LifecycleState) -> Self {
        Self {
            phase: state.phase,
            url: state.url.clone(),
            diagnostic_message: state.diagnostic_message.clone(),
            error_message: state.error_message(),
        }
    }
}

/// Controller handle plus a change subscription
pub struct PreviewBinding<S: Sandbox + 'static> {
    controller: PreviewController<S>,
    changes: watch::Receiver<LifecycleState>,
}

impl<S: Sandbox + 'static> PreviewBinding<S> {
    pub fn new(controller: PreviewController<S>) -> Self {
        let changes = controller.subscribe();
        Self {
            controller,
            changes,
        }
    }

    pub fn view(&self) -> PreviewView {
        PreviewView::from(&*self.changes.borrow())
    }

    /// Leave the Error phase; ignored otherwise
    pub fn retry(&self) {
        self.controller.retry();
    }

    /// Wait for the next state change and return the new view
    pub async fn changed(&mut self) -> PreviewView {
        // The binding keeps the controller alive, so the sender never closes
        let _ = self.changes.changed().await;
        PreviewView::from(&*self.changes.borrow_and_update())
    }

    /// Wait until the phase is Ready or Error
    pub async fn settled(&mut self) -> PreviewView {
        let settled = match self.changes.wait_for(|state| state.phase.is_settled()).await {
            Ok(state) => Some(PreviewView::from(&*state)),
            Err(_) => None,
        };
        settled.unwrap_or_else(|| self.view())
    }

    pub fn controller(&self) -> &PreviewController<S> {
        &self.controller
    }
}
