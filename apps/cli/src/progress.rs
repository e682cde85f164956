//! Terminal progress reporting on stderr.

use indicatif::{ProgressBar, ProgressStyle};
use lokallm_collector::{CollectProgress, CollectionReport};
use lokallm_training::{ProgressEvent, ProgressSink, TracingProgressSink};
use std::sync::atomic::{AtomicUsize, Ordering};

fn bar_style(unit: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(&format!("{{spinner:.green}} [{{elapsed_precise}}] [{{wide_bar:.cyan/blue}}] {{pos}}/{{len}} {unit} {{msg}}"))
        .map_or_else(|_| ProgressStyle::default_bar(), |style| style.progress_chars("#>-"))
}

/// Prompt-level progress bar for a collection run.
pub struct CollectBar {
    bar: ProgressBar,
    dropped: AtomicUsize,
}

impl CollectBar {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(bar_style("prompts"));
        Self { bar, dropped: AtomicUsize::new(0) }
    }
}

impl Default for CollectBar {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectProgress for CollectBar {
    fn on_start(&self, total: usize) {
        self.bar.set_length(total as u64);
    }

    fn on_prompt(&self, _index: usize, succeeded: bool) {
        if !succeeded {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            self.bar.set_message(format!("({dropped} dropped)"));
        }
        self.bar.inc(1);
    }

    fn on_finish(&self, _report: &CollectionReport) {
        self.bar.finish_and_clear();
    }
}

/// Optimizer-step progress bar. Every event is also logged.
pub struct TrainingBar {
    bar: ProgressBar,
    log: TracingProgressSink,
}

impl TrainingBar {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(bar_style("steps"));
        Self { bar, log: TracingProgressSink }
    }
}

impl Default for TrainingBar {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for TrainingBar {
    fn on_event(&self, event: ProgressEvent) {
        match &event {
            ProgressEvent::Step { step, total, loss, .. } => {
                if let Some(total) = total {
                    self.bar.set_length(*total);
                }
                self.bar.set_position(*step);
                self.bar.set_message(format!("loss {loss:.4}"));
            }
            ProgressEvent::Finished { .. } | ProgressEvent::Failed { .. } => self.bar.finish_and_clear(),
            _ => {}
        }
        self.bar.suspend(|| self.log.on_event(event));
    }
}
