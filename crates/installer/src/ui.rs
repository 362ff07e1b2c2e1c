//! UI helpers for the CLI.
//!
//! Provides consistent formatting for console output and the
//! [`ProgressSink`] that pipelines report phase transitions to.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

/// Print the Adhar banner.
pub fn print_banner() {
    println!();
    println!(
        "{}",
        r"
     _       _ _
    / \   __| | |__   __ _ _ __
   / _ \ / _` | '_ \ / _` | '__|
  / ___ \ (_| | | | | (_| | |
 /_/   \_\__,_|_| |_|\__,_|_|
"
        .cyan()
    );
    println!("  {}", "Internal Developer Platform".bright_black());
    println!();
}

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(70).bright_black());
    println!();
}

/// Print a progress step with step number.
pub fn print_progress_step(current: usize, total: usize, message: &str) {
    println!(
        "{} {} {}",
        format!("[{current}/{total}]").bright_black(),
        "▶".cyan(),
        message.bold()
    );
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a key-value pair.
pub fn print_kv(key: &str, value: &str) {
    println!("  {} {}", format!("{key}:").bright_black(), value.green());
}

/// Print a list item.
pub fn print_list_item(item: &str) {
    println!("  {} {item}", "•".bright_black());
}

/// Print prerequisite check result.
pub fn print_check_result(name: &str, passed: bool, message: Option<&str>) {
    let status = if passed { "✓".green() } else { "✗".red() };

    let text = if let Some(msg) = message {
        format!("{name} - {msg}")
    } else {
        name.to_string()
    };

    println!("  {status} {text}");
}

// ============================================================================
// Phase progress
// ============================================================================

/// A phase transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseEvent {
    /// Phase started.
    Started {
        /// Zero-based index.
        index: usize,
        /// Number of phases.
        total: usize,
        /// Human description.
        description: String,
    },
    /// Phase completed.
    Completed {
        /// Zero-based index.
        index: usize,
    },
    /// Phase failed but the pipeline continues.
    Warned {
        /// Zero-based index.
        index: usize,
        /// Failure message.
        message: String,
    },
    /// Phase failed fatally.
    Failed {
        /// Zero-based index.
        index: usize,
        /// Failure message.
        message: String,
    },
    /// Phase skipped.
    Skipped {
        /// Zero-based index.
        index: usize,
        /// Why it was skipped.
        reason: String,
    },
}

/// Receives phase transitions. Rendering is up to the implementation.
pub trait ProgressSink: Send + Sync {
    /// Handle one event.
    fn event(&self, event: &PhaseEvent);
}

/// Renders phases to the terminal with a spinner per running phase.
pub struct ConsoleSink {
    suppressed: bool,
    spinner: Mutex<Option<ProgressBar>>,
}

impl ConsoleSink {
    /// Console sink; renders nothing when `suppressed`.
    #[must_use]
    pub fn new(suppressed: bool) -> Self {
        Self {
            suppressed,
            spinner: Mutex::new(None),
        }
    }

    fn finish_spinner(&self) {
        if let Some(spinner) = self
            .spinner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            spinner.finish_and_clear();
        }
    }
}

impl ProgressSink for ConsoleSink {
    fn event(&self, event: &PhaseEvent) {
        if self.suppressed {
            return;
        }
        match event {
            PhaseEvent::Started {
                index,
                total,
                description,
            } => {
                print_progress_step(index + 1, *total, description);
                let spinner = ProgressBar::new_spinner();
                spinner.set_style(
                    ProgressStyle::with_template("  {spinner:.cyan} {elapsed:.dim}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                spinner.enable_steady_tick(Duration::from_millis(120));
                *self.spinner.lock().unwrap_or_else(PoisonError::into_inner) = Some(spinner);
            }
            PhaseEvent::Completed { .. } => {
                self.finish_spinner();
                print_success("done");
            }
            PhaseEvent::Warned { message, .. } => {
                self.finish_spinner();
                print_warning(message);
            }
            PhaseEvent::Failed { message, .. } => {
                self.finish_spinner();
                print_error(message);
            }
            PhaseEvent::Skipped { index, reason } => {
                self.finish_spinner();
                println!(
                    "  {} {}",
                    format!("phase {} skipped:", index + 1).bright_black(),
                    reason.bright_black()
                );
            }
        }
    }
}

/// Records events in memory.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<PhaseEvent>>,
}

#[cfg(test)]
impl RecordingSink {
    /// Empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<PhaseEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
impl ProgressSink for RecordingSink {
    fn event(&self, event: &PhaseEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
