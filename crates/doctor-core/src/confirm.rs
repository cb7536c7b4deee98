//! Operator interaction: destructive-step confirmation and backup choice.
//!
//! Both are capabilities so pipelines can be driven non-interactively in
//! tests. The stdin implementations write their prompts to stderr, leaving
//! stdout to reports.

use std::io::{BufRead, Write};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{DoctorError, Result};
use crate::storage::BackupObject;

/// Asks the operator before a destructive step.
#[async_trait]
pub trait Confirmer: Send + Sync {
    /// Show `warning` and return `true` only when the operator agrees.
    async fn confirm(&self, warning: &str) -> bool;
}

/// Agrees to everything (`--force`).
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysYes;

#[async_trait]
impl Confirmer for AlwaysYes {
    async fn confirm(&self, _warning: &str) -> bool {
        true
    }
}

/// Reads one line from stdin; only an exact `yes` agrees.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptStdin;

/// Whether a typed answer counts as agreement.
pub fn is_affirmative(answer: &str) -> bool {
    answer.trim() == "yes"
}

async fn prompt_line(prompt: String) -> Option<String> {
    let read = tokio::task::spawn_blocking(move || {
        let mut stderr = std::io::stderr().lock();
        // Prompt display is best effort; the answer is what matters.
        let _ = write!(stderr, "{prompt}");
        let _ = stderr.flush();
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line).map(|_| line)
    })
    .await;
    match read {
        Ok(Ok(line)) => Some(line),
        Ok(Err(e)) => {
            debug!(error = %e, "Could not read from stdin");
            None
        }
        Err(e) => {
            debug!(error = %e, "Prompt task failed");
            None
        }
    }
}

#[async_trait]
impl Confirmer for PromptStdin {
    async fn confirm(&self, warning: &str) -> bool {
        let prompt = format!("\n{warning}\n\nType 'yes' to continue: ");
        prompt_line(prompt)
            .await
            .map(|answer| is_affirmative(&answer))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Backup selection
// ---------------------------------------------------------------------------

/// Operator's answer to "which backup?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Choice {
    Selected(String),
    Cancelled,
}

/// Picks one backup out of a listing.
#[async_trait]
pub trait BackupChooser: Send + Sync {
    async fn choose(&self, backups: &[BackupObject]) -> Result<Choice>;
}

/// Interpret a typed selection against a 1-based numbered listing.
///
/// Empty input or `q` cancels.
pub fn parse_choice(input: &str, backups: &[BackupObject]) -> Result<Choice> {
    let input = input.trim();
    if input.is_empty() || input == "q" {
        return Ok(Choice::Cancelled);
    }
    match input.parse::<usize>() {
        Ok(n) if (1..=backups.len()).contains(&n) => {
            Ok(Choice::Selected(backups[n - 1].name.clone()))
        }
        _ => Err(DoctorError::InvalidSelection(input.to_string())),
    }
}

/// Numbered listing, one `  [n] name` per line.
pub fn numbered_listing(backups: &[BackupObject]) -> String {
    backups
        .iter()
        .enumerate()
        .map(|(i, b)| format!("  [{}] {}", i + 1, b.name))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Prints the listing and reads a number from stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinChooser;

#[async_trait]
impl BackupChooser for StdinChooser {
    async fn choose(&self, backups: &[BackupObject]) -> Result<Choice> {
        let prompt = format!(
            "\nAvailable backups:\n{}\n\nSelect backup number (or 'q' to quit): ",
            numbered_listing(backups)
        );
        match prompt_line(prompt).await {
            Some(answer) => parse_choice(&answer, backups),
            None => Ok(Choice::Cancelled),
        }
    }
}
