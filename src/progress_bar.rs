use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::core::traits::ProgressSink;

/// Bar resolution: progress is shown in 0.1% steps
const BAR_LEN: u64 = 1000;

/// Terminal progress for a background load with separate status line
#[derive(Debug)]
pub struct LoadProgressBar {
    status_line: ProgressBar,
    progress_bar: ProgressBar,
}

impl LoadProgressBar {
    /// Create new progress display with separate status and progress lines
    pub fn new(file_name: &str) -> Self {
        let multi = MultiProgress::new();

        // Top line for stage messages (non-scrolling, always visible)
        let status_line = multi.add(ProgressBar::new_spinner());
        if let Ok(style) = ProgressStyle::default_spinner().template("{msg}") {
            status_line.set_style(style);
        }
        status_line.set_message(format!("Loading {}...", file_name));

        // Bottom line for progress bar
        let progress_bar = multi.add(ProgressBar::new(BAR_LEN));
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{bar:40.cyan/blue}] {percent}% | {elapsed_precise} | {msg}")
        {
            progress_bar.set_style(style.progress_chars("█▓░"));
        }

        Self {
            status_line,
            progress_bar,
        }
    }

    /// Stop both lines, leaving `message` on the status line
    pub fn finish(&self, message: &str) {
        self.progress_bar.finish();
        self.status_line.finish_with_message(message.to_string());
    }

    /// Remove the bar (cancelled or failed load)
    pub fn abandon(&self, message: &str) {
        self.progress_bar.abandon();
        self.status_line.abandon_with_message(message.to_string());
    }

    /// Cloneable sink half, for handing to the loader
    pub fn sink(&self) -> LoadProgressSink {
        LoadProgressSink {
            progress_bar: self.progress_bar.clone(),
        }
    }
}

/// `ProgressSink` that drives a `LoadProgressBar`
#[derive(Debug, Clone)]
pub struct LoadProgressSink {
    progress_bar: ProgressBar,
}

impl ProgressSink for LoadProgressSink {
    fn on_progress(&mut self, progress: f64, message: &str) {
        self.progress_bar.set_position((progress.clamp(0.0, 1.0) * BAR_LEN as f64) as u64);
        self.progress_bar.set_message(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_positions_bar() {
        let bar = LoadProgressBar::new("model.stl");
        let mut sink = bar.sink();
        sink.on_progress(0.25, "Parsing records (1/4 chunks)");
        assert_eq!(bar.progress_bar.position(), 250);
        sink.on_progress(1.5, "Done");
        assert_eq!(bar.progress_bar.position(), BAR_LEN);
        bar.finish("Loaded");
        assert!(bar.progress_bar.is_finished());
    }
}
