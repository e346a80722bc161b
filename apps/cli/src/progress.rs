//! Progress bars for running downloads

use crate::output::format_speed;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use uuid::Uuid;
use vodfetch_types::{EngineEvent, TaskState};

const BAR_TEMPLATE: &str =
    "{spinner:.green} {msg:30!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {prefix}";

/// One bar per task, driven by engine events
pub struct TaskProgressBars {
    multi: MultiProgress,
    bars: HashMap<Uuid, ProgressBar>,
}

impl TaskProgressBars {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    fn add(&mut self, task_id: Uuid, name: String) {
        let pb = self.multi.add(ProgressBar::new(0));
        if let Ok(bar_style) = ProgressStyle::default_bar().template(BAR_TEMPLATE) {
            pb.set_style(bar_style.progress_chars("█▓▒░  "));
        }
        pb.set_message(name);
        self.bars.insert(task_id, pb);
    }

    /// Update bars from an event
    pub fn handle_event(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::TaskAdded {
                task_id,
                destination,
                ..
            } => {
                let name = destination
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| destination.display().to_string());
                self.add(*task_id, name);
            }

            EngineEvent::TaskProgress {
                task_id,
                bytes_done,
                bytes_total,
                speed_bps,
            } => {
                if let Some(pb) = self.bars.get(task_id) {
                    if let Some(total) = bytes_total {
                        pb.set_length(*total);
                    }
                    pb.set_position(*bytes_done);
                    pb.set_prefix(format_speed(*speed_bps));
                }
            }

            EngineEvent::TaskStateChanged {
                task_id,
                new_state,
                error,
            } => {
                let Some(pb) = self.bars.get(task_id) else {
                    return;
                };
                match new_state {
                    TaskState::Probing => pb.set_prefix("probing"),
                    TaskState::Completed => {
                        pb.set_prefix(format!("{} done", style("✓").green().bold()));
                        pb.finish();
                    }
                    TaskState::Failed => {
                        let reason = error
                            .as_ref()
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "unknown error".to_string());
                        pb.set_prefix(format!("{} {}", style("✗").red().bold(), reason));
                        pb.abandon();
                    }
                    TaskState::Paused => {
                        pb.set_prefix(format!("{} paused", style("⏸").yellow()));
                        pb.abandon();
                    }
                    TaskState::Pending | TaskState::Downloading => {}
                }
            }

            EngineEvent::ResumeInvalidated { task_id, .. } => {
                if let Some(pb) = self.bars.get(task_id) {
                    pb.set_position(0);
                    pb.set_prefix("file changed on server, restarting");
                }
            }

            EngineEvent::ProviderAuthFailed { provider, message } => {
                let _ = self.multi.println(format!(
                    "{} {}: {}",
                    style("✗ auth").red().bold(),
                    provider,
                    message
                ));
            }

            EngineEvent::BatchCompleted { .. } => {
                for pb in self.bars.values().filter(|pb| !pb.is_finished()) {
                    pb.abandon();
                }
            }
        }
    }
}

impl Default for TaskProgressBars {
    fn default() -> Self {
        Self::new()
    }
}
