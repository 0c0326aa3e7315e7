use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use spark_tunnel_summary_model::RunResult;

/// Shows how many scenarios of a batch have finished and which one is running.
pub struct BatchProgress {
    bar: ProgressBar,
}

impl BatchProgress {
    /// A hidden bar is used when `enabled` is false so callers don't need to check.
    pub fn new(total: usize, enabled: bool) -> Self {
        let bar = if enabled {
            ProgressBar::new(total as u64)
        } else {
            ProgressBar::with_draw_target(Some(total as u64), ProgressDrawTarget::hidden())
        };

        match ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}",
        ) {
            Ok(style) => bar.set_style(style.progress_chars("#>-")),
            Err(e) => log::debug!("Using default progress style: {e}"),
        }

        Self { bar }
    }

    pub fn start_scenario(&self, name: &str) {
        self.bar.set_message(name.to_string());
        self.bar.tick();
    }

    pub fn finish_scenario(&self, result: &RunResult) {
        // Keep log lines from being drawn over by the bar.
        self.bar.suspend(|| {
            log::info!(
                "Scenario '{}' finished: {}",
                result.scenario_name,
                result.status
            )
        });
        self.bar.inc(1);
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
