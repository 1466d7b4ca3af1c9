//! Live run display on stderr using indicatif.

use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::time::Duration;
use tasklane::{Engine, LiveProgress, RunId, RunStatus};

const REFRESH: Duration = Duration::from_millis(100);

/// Spinner that follows one run until it reaches a terminal state.
pub struct RunSpinner {
    bar: ProgressBar,
    verbose: bool,
    printed: usize,
}

impl RunSpinner {
    pub fn new(task_name: &str, verbose: bool) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(task_name.to_string());
        bar.enable_steady_tick(REFRESH);
        Self {
            bar,
            verbose,
            printed: 0,
        }
    }

    /// Poll the engine until the run is terminal and return its final state.
    pub async fn follow(mut self, engine: &Engine, run_id: RunId) -> Option<LiveProgress> {
        loop {
            let progress = engine.get_progress(run_id).await?;
            self.show(&progress);
            if progress.status.is_terminal() {
                self.finish(&progress);
                return Some(progress);
            }
            tokio::time::sleep(REFRESH).await;
        }
    }

    fn show(&mut self, progress: &LiveProgress) {
        if self.verbose {
            // Stream new output lines above the spinner.
            let fresh = progress.output.get(self.printed..).unwrap_or_default();
            if let Some(end) = fresh.rfind('\n') {
                let complete = fresh.get(..=end).unwrap_or_default();
                for line in complete.lines() {
                    self.bar.println(format!("  | {line}"));
                }
                self.printed += complete.len();
            }
        }
        if let Some(last) = progress.output.lines().last() {
            self.bar.set_message(format!("{} {}", progress.task_name, last));
        }
    }

    fn finish(self, progress: &LiveProgress) {
        self.bar.finish_and_clear();
        let status = match progress.status {
            RunStatus::Success => "\x1b[32msucceeded\x1b[0m",
            _ => "\x1b[31mfailed\x1b[0m",
        };
        let _ = writeln!(
            std::io::stderr(),
            "run {status}: {} ({}s)",
            progress.task_name,
            progress.duration
        );
    }
}
