//! Durable, append-only conversation log.
//!
//! Format and parsing live in [`ragtutor_core::history`]; this module owns
//! the file. Each completed turn is appended with a single write, preceded
//! by a session header when the turn's UTC date differs from the newest
//! session already in the file.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ragtutor_core::history::{last_session_date, long_term_context, recent_sessions, render_append};
use ragtutor_core::models::{SessionBlock, Turn};

use crate::config::Config;

#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whole log, or an empty string when it does not exist yet.
    pub fn read(&self) -> Result<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read history log: {}", self.path.display())),
        }
    }

    pub fn append(&self, turn: &Turn) -> Result<()> {
        let existing = self.read()?;
        let mut text = String::new();
        if !existing.is_empty() && !existing.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&render_append(last_session_date(&existing), turn));

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create history directory: {}", parent.display())
            })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open history log: {}", self.path.display()))?;
        file.write_all(text.as_bytes())
            .with_context(|| format!("Failed to append to history log: {}", self.path.display()))?;
        Ok(())
    }

    pub fn recent_sessions(&self, n: usize) -> Result<Vec<SessionBlock>> {
        Ok(recent_sessions(&self.read()?, n))
    }

    /// Verbatim text of the newest `n` sessions; `None` when there are none.
    pub fn long_term_context(&self, n: usize) -> Result<Option<String>> {
        let context = long_term_context(&self.read()?, n);
        Ok((!context.is_empty()).then_some(context))
    }
}

/// `tutor history`: print the newest `n` sessions verbatim.
pub fn run_history(config: &Config, n: usize) -> Result<()> {
    let log = HistoryLog::new(&config.chat.history_path);
    let sessions = log.recent_sessions(n)?;
    if sessions.is_empty() {
        println!("No history yet.");
        return Ok(());
    }
    for session in &sessions {
        print!("{}", session.raw);
        if !session.raw.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}
