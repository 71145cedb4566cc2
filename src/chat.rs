//! The append-only action log and its markdown rendering.
//!
//! The log is the sole source of truth for the transcript handed to agent
//! calls; there is no separate mutable "current transcript" to drift out of
//! sync with it.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Speak,  // A spontaneous turn; costs initiative.
    Answer, // A reply to a directed question; free.
    Dm,     // Host narration, interjections and tool output.
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionRecord {
    pub speaker: String,
    pub content: String,
    #[serde(default)]
    pub queries: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub chapter: usize,
    pub cycle: usize,
    pub kind: ActionKind,
    pub timestamp: DateTime<Local>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ActionLog {
    entries: Vec<ActionRecord>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: ActionRecord) {
        self.entries.push(record);
    }

    pub fn entries(&self) -> &[ActionRecord] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries logged since the DM last spoke. Used by the
    /// interjection heuristic.
    pub fn messages_since_last_dm(&self) -> usize {
        self.entries
            .iter()
            .rev()
            .take_while(|entry| entry.kind != ActionKind::Dm)
            .count()
    }

    /// Renders the whole transcript as markdown, in the layout the prompts
    /// were written against: `## DM` headings for narration, `### Name`
    /// headings for player turns and answers.
    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            let stamp = entry.timestamp.format("%H:%M:%S");
            match entry.kind {
                ActionKind::Dm => {
                    out.push_str(&format!("\n\n## DM ({stamp})\n\n{}\n", entry.content));
                }
                ActionKind::Answer => {
                    let asker = entry.reply_to.as_deref().unwrap_or("?");
                    out.push_str(&format!(
                        "\n\n### {} ({stamp})\nreplies to @{asker}: {}\n",
                        entry.speaker, entry.content
                    ));
                }
                ActionKind::Speak => {
                    out.push_str(&format!(
                        "\n\n### {} ({stamp})\n{}\n",
                        entry.speaker, entry.content
                    ));
                    for (target, question) in &entry.queries {
                        out.push_str(&format!("asks @{target}: {question}\n"));
                    }
                }
            }
        }
        out
    }

    /// Last `max_chars` characters of the rendered transcript, respecting
    /// char boundaries. Bounds token cost for interjections.
    pub fn tail_markdown(&self, max_chars: usize) -> String {
        tail_chars(&self.render_markdown(), max_chars)
    }
}

pub fn tail_chars(text: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let start = text
        .char_indices()
        .rev()
        .nth(max_chars - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speak(speaker: &str, content: &str) -> ActionRecord {
        ActionRecord {
            speaker: speaker.into(),
            content: content.into(),
            queries: HashMap::new(),
            reply_to: None,
            chapter: 1,
            cycle: 1,
            kind: ActionKind::Speak,
            timestamp: Local::now(),
        }
    }

    #[test]
    fn messages_since_last_dm_counts_trailing_entries() {
        let mut log = ActionLog::new();
        assert_eq!(log.messages_since_last_dm(), 0);

        log.push(ActionRecord {
            kind: ActionKind::Dm,
            ..speak("DM", "welcome")
        });
        log.push(speak("Alice", "hello"));
        log.push(speak("Bob", "hi"));
        assert_eq!(log.messages_since_last_dm(), 2);

        log.push(ActionRecord {
            kind: ActionKind::Dm,
            ..speak("DM", "a clue appears")
        });
        assert_eq!(log.messages_since_last_dm(), 0);
    }

    #[test]
    fn render_includes_queries_and_reply_markers() {
        let mut log = ActionLog::new();
        let mut entry = speak("Alice", "I was in the study.");
        entry
            .queries
            .insert("Bob".to_string(), "Where were you?".to_string());
        log.push(entry);
        log.push(ActionRecord {
            kind: ActionKind::Answer,
            reply_to: Some("Alice".into()),
            ..speak("Bob", "In the garden.")
        });

        let rendered = log.render_markdown();
        assert!(rendered.contains("### Alice"));
        assert!(rendered.contains("asks @Bob: Where were you?"));
        assert!(rendered.contains("replies to @Alice: In the garden."));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        let text = "héllo wörld";
        let tail = tail_chars(text, 4);
        assert_eq!(tail, "örld");
        assert_eq!(tail_chars(text, 100), text);
        assert_eq!(tail_chars(text, 0), "");
    }
}
