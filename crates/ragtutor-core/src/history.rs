//! Durable history log format.
//!
//! The log is append-only UTF-8 text grouped into calendar-day (UTC)
//! sessions:
//!
//! ```text
//! === Session 2026-10-16 ===
//! @ 2026-10-16T09:30:12Z
//! User:
//!     What is a heap?
//! Assistant:
//!     A complete binary tree that keeps the smallest key at the root.
//! ```
//!
//! Message lines are always indented by four spaces, so no message can
//! produce a line that starts a new session. This module only formats and
//! parses; file I/O lives with the host.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

use crate::models::{SessionBlock, Turn};

const SESSION_PREFIX: &str = "=== Session ";
const SESSION_SUFFIX: &str = " ===";
const TURN_PREFIX: &str = "@ ";
const USER_LABEL: &str = "User:";
const ASSISTANT_LABEL: &str = "Assistant:";
const INDENT: &str = "    ";

/// Number of sessions fed back as long-term context by default.
pub const DEFAULT_HISTORY_SESSIONS: usize = 5;

pub fn session_header(date: NaiveDate) -> String {
    format!("{}{}{}\n", SESSION_PREFIX, date.format("%Y-%m-%d"), SESSION_SUFFIX)
}

fn indented(out: &mut String, content: &str) {
    for line in content.lines() {
        out.push_str(INDENT);
        out.push_str(line);
        out.push('\n');
    }
}

pub fn format_turn(turn: &Turn) -> String {
    let mut out = String::new();
    out.push_str(TURN_PREFIX);
    out.push_str(&turn.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true));
    out.push('\n');
    out.push_str(USER_LABEL);
    out.push('\n');
    indented(&mut out, &turn.user);
    out.push_str(ASSISTANT_LABEL);
    out.push('\n');
    indented(&mut out, &turn.assistant);
    out
}

/// Text to append for `turn`, opening a new session when its UTC date
/// differs from `last_session`.
pub fn render_append(last_session: Option<NaiveDate>, turn: &Turn) -> String {
    let date = turn.timestamp.date_naive();
    let mut out = String::new();
    if last_session != Some(date) {
        out.push_str(&session_header(date));
    }
    out.push_str(&format_turn(turn));
    out
}

fn parse_header(line: &str) -> Option<NaiveDate> {
    let date = line.strip_prefix(SESSION_PREFIX)?.strip_suffix(SESSION_SUFFIX)?;
    NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").ok()
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    None,
    User,
    Assistant,
}

fn parse_turns(lines: &[&str]) -> Vec<Turn> {
    let mut turns = Vec::new();
    let mut current: Option<(DateTime<Utc>, Vec<&str>, Vec<&str>)> = None;
    let mut field = Field::None;

    for line in lines {
        if let Some(ts) = line.strip_prefix(TURN_PREFIX) {
            if let Some((t, u, a)) = current.take() {
                turns.push(Turn {
                    timestamp: t,
                    user: u.join("\n"),
                    assistant: a.join("\n"),
                });
            }
            current = DateTime::parse_from_rfc3339(ts.trim())
                .ok()
                .map(|t| (t.with_timezone(&Utc), Vec::new(), Vec::new()));
            field = Field::None;
        } else if *line == USER_LABEL {
            field = Field::User;
        } else if *line == ASSISTANT_LABEL {
            field = Field::Assistant;
        } else if let (Some(text), Some((_, u, a))) = (line.strip_prefix(INDENT), current.as_mut()) {
            match field {
                Field::User => u.push(text),
                Field::Assistant => a.push(text),
                Field::None => {}
            }
        }
    }

    if let Some((t, u, a)) = current {
        turns.push(Turn {
            timestamp: t,
            user: u.join("\n"),
            assistant: a.join("\n"),
        });
    }
    turns
}

/// Split a log into session blocks, oldest first.
///
/// Text before the first session header is ignored. Each block's `raw` is
/// the exact text from its header up to the next header.
pub fn parse_sessions(log: &str) -> Vec<SessionBlock> {
    let mut blocks = Vec::new();
    let mut start: Option<(usize, NaiveDate)> = None;
    let mut offset = 0usize;

    for line in log.split_inclusive('\n') {
        if let Some(date) = parse_header(line.trim_end_matches(['\n', '\r'])) {
            if let Some((begin, d)) = start {
                blocks.push(block(&log[begin..offset], d));
            }
            start = Some((offset, date));
        }
        offset += line.len();
    }
    if let Some((begin, d)) = start {
        blocks.push(block(&log[begin..], d));
    }
    blocks
}

fn block(raw: &str, date: NaiveDate) -> SessionBlock {
    let lines: Vec<&str> = raw.lines().skip(1).collect();
    SessionBlock {
        date,
        turns: parse_turns(&lines),
        raw: raw.to_string(),
    }
}

/// Date of the newest session in the log.
pub fn last_session_date(log: &str) -> Option<NaiveDate> {
    log.lines().rev().find_map(parse_header)
}

/// The newest `n` sessions, oldest first.
pub fn recent_sessions(log: &str, n: usize) -> Vec<SessionBlock> {
    let mut blocks = parse_sessions(log);
    let skip = blocks.len().saturating_sub(n);
    blocks.drain(..skip);
    blocks
}

/// Verbatim text of the newest `n` sessions, for the prompt.
pub fn long_term_context(log: &str, n: usize) -> String {
    recent_sessions(log, n)
        .into_iter()
        .map(|b| b.raw)
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn turn(day: u32, user: &str, assistant: &str) -> Turn {
        Turn {
            timestamp: Utc.with_ymd_and_hms(2026, 10, day, 9, 30, 12).unwrap(),
            user: user.to_string(),
            assistant: assistant.to_string(),
        }
    }

    fn log_of(turns: &[Turn]) -> String {
        let mut log = String::new();
        for t in turns {
            let append = render_append(last_session_date(&log), t);
            log.push_str(&append);
        }
        log
    }

    #[test]
    fn test_format_turn() {
        let text = format_turn(&turn(16, "What is a heap?", "A tree.\nWith order."));
        assert_eq!(
            text,
            "@ 2026-10-16T09:30:12Z\nUser:\n    What is a heap?\nAssistant:\n    A tree.\n    With order.\n"
        );
    }

    #[test]
    fn test_header_only_on_new_day() {
        let log = log_of(&[turn(15, "a", "b"), turn(15, "c", "d"), turn(16, "e", "f")]);
        assert_eq!(log.matches("=== Session").count(), 2);
        let blocks = parse_sessions(&log);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].turns.len(), 2);
        assert_eq!(blocks[1].date, NaiveDate::from_ymd_opt(2026, 10, 16).unwrap());
    }

    #[test]
    fn test_parse_roundtrip_preserves_multiline_content() {
        let t = turn(16, "line one\n\nline three", "=== Session 2020-01-01 ===\n{x}");
        let log = log_of(&[t.clone()]);
        let blocks = parse_sessions(&log);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].turns, vec![t]);
        assert_eq!(blocks[0].raw, log);
    }

    #[test]
    fn test_keeps_only_recent_sessions_verbatim() {
        let turns: Vec<Turn> = (1..=8).map(|d| turn(d, &format!("q{}", d), "a")).collect();
        let log = log_of(&turns);

        let recent = recent_sessions(&log, 5);
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].date, NaiveDate::from_ymd_opt(2026, 10, 4).unwrap());

        let context = long_term_context(&log, 5);
        assert!(log.ends_with(&context));
        assert!(!context.contains("q3"));
        assert!(context.contains("q4"));
        assert_eq!(context.matches("=== Session").count(), 5);
    }

    #[test]
    fn test_empty_and_headerless_logs() {
        assert!(parse_sessions("").is_empty());
        assert!(parse_sessions("stray text\n").is_empty());
        assert_eq!(long_term_context("", 5), "");
        assert_eq!(last_session_date(""), None);
    }
}
