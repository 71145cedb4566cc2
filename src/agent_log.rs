//! Append-only audit trail of agent invocations.
//!
//! Every DM and player agent call lands here as one JSON line so a finished
//! game can be replayed and failing prompts can be inspected after the fact.
//! Writing the log must never affect game flow: all IO failures degrade to a
//! warning.

use chrono::Local;
use serde_json::{Value, json};
use std::fs::{OpenOptions, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AgentLog {
    log_file: PathBuf,
}

impl AgentLog {
    pub fn new(game_dir: &Path) -> Self {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let log_file = game_dir.join(format!("agent_calls_{stamp}.log"));

        let log = Self { log_file };
        log.write_line(&json!({
            "session_start": Local::now().to_rfc3339(),
            "description": "agent call log, one JSON object per line",
        }));
        log
    }

    pub fn record(
        &self,
        agent: &str,
        method: &str,
        params: Value,
        success: bool,
        error: Option<&str>,
    ) {
        self.write_line(&json!({
            "timestamp": Local::now().to_rfc3339(),
            "agent": agent,
            "method": method,
            "params": params,
            "success": success,
            "error": error,
        }));
    }

    fn write_line(&self, entry: &Value) {
        if let Some(parent) = self.log_file.parent() {
            let _ = create_dir_all(parent);
        }
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
        {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{entry}") {
                    log::warn!("agent log write failed: {e}");
                }
            }
            Err(e) => log::warn!("agent log open failed: {e}"),
        }
    }
}

/// Shortens long prompt strings for logging so the audit file stays readable.
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = AgentLog::new(dir.path());
        log.record("DMAgent", "speak", json!({"chapter": 1}), true, None);
        log.record("PlayerAgent", "query", json!({"name": "Alice"}), false, Some("timeout"));

        let content = std::fs::read_to_string(&log.log_file).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3); // header + two records
        for line in lines {
            let value: Value = serde_json::from_str(line).unwrap();
            assert!(value.is_object());
        }
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("0123456789abc", 10), "0123456789...");
    }
}
