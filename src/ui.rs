//! Terminal interaction
//!
//! Confirmation prompts on stdin and an indicatif progress bar wired to
//! batch progress snapshots.

use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{BufRead, Write};
use std::sync::Arc;

use crate::update::progress::{ProgressCallback, ProgressSnapshot};
use crate::update::UserPrompt;

/// Prompts on stdin/stdout. With `assume_yes` every confirmation is
/// answered affirmatively without asking.
pub struct TerminalPrompt {
    assume_yes: bool,
}

impl TerminalPrompt {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

#[async_trait]
impl UserPrompt for TerminalPrompt {
    async fn confirm(&self, title: &str, message: &str, yes: &str, no: &str) -> bool {
        if self.assume_yes {
            tracing::debug!("Auto-confirming: {}", title);
            return true;
        }

        let question = format!("{}\n\n{}\n\n[{}/{}] (y/N): ", title, message, yes, no);
        let answered = tokio::task::spawn_blocking(move || {
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(question.as_bytes());
            let _ = stdout.flush();

            let mut line = String::new();
            if std::io::stdin().lock().read_line(&mut line).is_err() {
                return false;
            }
            matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
        })
        .await;

        answered.unwrap_or(false)
    }

    async fn notify(&self, title: &str, message: &str) {
        println!("{}: {}", title, message);
        tracing::info!("{}: {}", title, message);
    }
}

/// Progress callback rendering an overall batch bar with transfer rate.
pub fn progress_bar_callback() -> ProgressCallback {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40.green/dim}] {percent}%")
            .expect("Invalid progress bar template")
            .progress_chars("##-"),
    );

    Arc::new(move |snapshot: ProgressSnapshot| {
        bar.set_position(snapshot.percent as u64);
        let rate = snapshot.bytes_per_sec / (1024.0 * 1024.0);
        if rate > 0.01 {
            bar.set_message(format!(
                "{}/{} mods ({:.1} MiB/s)",
                snapshot.completed, snapshot.total, rate
            ));
        } else {
            bar.set_message(format!("{}/{} mods", snapshot.completed, snapshot.total));
        }
        if snapshot.completed >= snapshot.total {
            bar.finish_and_clear();
        }
    })
}

/// No-op callback for non-interactive runs.
pub fn silent_progress_callback() -> ProgressCallback {
    Arc::new(|_| {})
}
