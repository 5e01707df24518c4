use indicatif::{ProgressBar, ProgressStyle};
use mnireg_registration::{ProgressCallback, ProgressInfo};
use std::time::Duration;

/// Terminal spinner following the toolkit's stages and levels.
pub struct SpinnerProgress {
    bar: ProgressBar,
}

impl SpinnerProgress {
    pub fn new() -> anyhow::Result<Self> {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")?,
        );
        Ok(Self { bar })
    }

    /// Clear the spinner if the run ended without a completion event.
    pub fn finish(&self) {
        if !self.bar.is_finished() {
            self.bar.finish_and_clear();
        }
    }
}

impl ProgressCallback for SpinnerProgress {
    fn on_start(&self) {
        self.bar.enable_steady_tick(Duration::from_millis(120));
        self.bar.set_message("antsRegistration starting");
    }

    fn on_stage(&self, stage: usize, level: usize, total_levels: usize) {
        self.bar
            .set_message(format!("stage {} level {}/{}", stage, level, total_levels));
    }

    fn on_progress(&self, info: &ProgressInfo) {
        let total = info
            .total_iterations
            .map(|t| t.to_string())
            .unwrap_or_else(|| "?".to_string());
        let mut message = format!(
            "stage {} level {} iteration {}/{} metric {:.6}",
            info.stage, info.level, info.iteration, total, info.metric
        );
        if let Some(remaining) = info.estimated_remaining {
            message.push_str(&format!(" (~{:.0}s left in level)", remaining.as_secs_f64()));
        }
        self.bar.set_message(message);
    }

    fn on_complete(&self, elapsed: Duration) {
        self.bar
            .finish_with_message(format!("registered in {:.1}s", elapsed.as_secs_f64()));
    }

    fn on_error(&self, error: &str) {
        self.bar.abandon_with_message(format!("failed: {}", error));
    }
}
