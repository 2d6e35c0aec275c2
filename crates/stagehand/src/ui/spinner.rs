use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use stagehand_core::lifecycle::PreviewPhase;
use stagehand_core::preview::PreviewView;
use std::time::Duration;

fn default_style() -> ProgressStyle {
    // Use a green spinner and leave message coloring to message composition
    ProgressStyle::with_template("{spinner:.green} {msg}")
        .unwrap()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
}

fn finished_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap()
}

/// Spinner line on stderr that follows preview phase changes
#[derive(Debug)]
pub struct PreviewSpinner {
    pb: ProgressBar,
    last_phase: Option<PreviewPhase>,
}

impl PreviewSpinner {
    pub fn new() -> Self {
        let pb = ProgressBar::new_spinner();
        pb.enable_steady_tick(Duration::from_millis(80));
        pb.set_style(default_style());
        Self {
            pb,
            last_phase: None,
        }
    }

    /// Render a view; settled phases finish the line
    pub fn update(&mut self, view: &PreviewView) {
        match view.phase {
            PreviewPhase::Ready => {
                let url = view.url.as_deref().unwrap_or("(unknown address)");
                self.finish_with(style(format!("Preview ready at {}", url)).green().to_string());
            }
            PreviewPhase::Error => {
                let message = view.error_message.as_deref().unwrap_or("Preview failed");
                self.finish_with(style(message).red().to_string());
            }
            _ => {
                if self.pb.is_finished() {
                    // A retry after an error restarts the line
                    self.pb = ProgressBar::new_spinner();
                    self.pb.enable_steady_tick(Duration::from_millis(80));
                    self.pb.set_style(default_style());
                }
                self.pb.set_message(style(phase_message(view)).yellow().to_string());
            }
        }
        self.last_phase = Some(view.phase);
    }

    pub fn last_phase(&self) -> Option<PreviewPhase> {
        self.last_phase
    }

    fn finish_with(&self, msg: String) {
        if self.pb.is_finished() {
            return;
        }
        self.pb.set_style(finished_style());
        self.pb.finish_with_message(msg);
    }
}

impl Default for PreviewSpinner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreviewSpinner {
    fn drop(&mut self) {
        if !self.pb.is_finished() {
            self.pb.finish_and_clear();
        }
    }
}

/// Friendly text for an in-progress phase
pub fn phase_message(view: &PreviewView) -> String {
    if let Some(diagnostic) = &view.diagnostic_message {
        return diagnostic.clone();
    }
    match view.phase {
        PreviewPhase::Idle => "Waiting for the sandbox…".to_string(),
        PreviewPhase::Installing => "Installing dependencies…".to_string(),
        PreviewPhase::Starting => "Starting development server…".to_string(),
        PreviewPhase::Ready => "Preview ready".to_string(),
        PreviewPhase::Error => "Preview failed".to_string(),
    }
}
