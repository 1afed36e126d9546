//! Progress reporting: record-count spinner for streaming sources of unknown length.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.green} {msg} {pos} records  it/s: {per_sec}  elapsed: {elapsed_precise}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Thin wrapper around an `indicatif` spinner counting processed records.
pub struct ProgressScope {
    pb: ProgressBar,
}

impl ProgressScope {
    pub fn records<T: Into<String>>(label: T) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(spinner_style());
        let label = label.into();
        if !label.is_empty() {
            pb.set_message(label);
        }
        pb.enable_steady_tick(Duration::from_millis(100));
        Self { pb }
    }

    #[inline]
    pub fn inc_items(&self, delta: u64) {
        self.pb.inc(delta);
    }

    pub fn position(&self) -> u64 {
        self.pb.position()
    }

    pub fn finish<T: Into<String>>(&self, msg: T) {
        self.pb.finish_with_message(msg.into());
    }
}
