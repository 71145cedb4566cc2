// src/ai_response.rs
//
// Converts raw LLM completions into typed turn results. This is the central
// resilience boundary between the orchestrator and the model: the functions
// here never fail and never panic. Worst case, the raw text comes back as
// content with empty structured fields, tagged as degraded.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Sentinel used when the model omits the `content` field entirely.
pub const SILENCE_SENTINEL: &str = "**[remains silent]**";

/// A spontaneous player turn: a statement plus zero or more directed
/// questions keyed by target character name.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PlayerTurn {
    pub content: String,
    #[serde(default)]
    pub query: HashMap<String, String>,
}

/// DM narration with the tool calls that were embedded in it.
#[derive(Debug, Clone, PartialEq)]
pub struct DmSpeech {
    pub speech: String,
    pub commands: Vec<ToolCommand>,
}

/// A typed command extracted from an inline marker. Chapter and clue index
/// keep the 1-based convention of the marker grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCommand {
    ShowClue { chapter: usize, clue_index: usize },
    ShowCharacter { name: String },
}

/// Result of a best-effort parse. `Degraded` means some repair was applied
/// (missing field substituted, fences stripped, or raw text wrapped); the
/// inner value is usable either way.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed<T> {
    Clean(T),
    Degraded(T),
}

impl<T> Parsed<T> {
    pub fn into_inner(self) -> T {
        match self {
            Parsed::Clean(v) | Parsed::Degraded(v) => v,
        }
    }

    pub fn inner(&self) -> &T {
        match self {
            Parsed::Clean(v) | Parsed::Degraded(v) => v,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Parsed::Degraded(_))
    }
}

/// Extracts a JSON object from model output that may be wrapped in markdown
/// fences or surrounded by prose: everything between the first `{` and the
/// last `}` is taken as the candidate.
pub fn repair_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

/// Parses a player `query` turn. Missing fields are substituted with the
/// silence sentinel / an empty map; unparseable text is wrapped verbatim.
pub fn parse_player_turn(raw: &str) -> Parsed<PlayerTurn> {
    let Some(value) = repair_json(raw) else {
        let trimmed = raw.trim();
        return Parsed::Degraded(PlayerTurn {
            content: if trimmed.is_empty() {
                SILENCE_SENTINEL.to_string()
            } else {
                trimmed.to_string()
            },
            query: HashMap::new(),
        });
    };

    let mut degraded = !matches!(serde_json::from_str::<Value>(raw.trim()), Ok(_));

    let content = match value.get("content").and_then(Value::as_str) {
        Some(content) if !content.trim().is_empty() => content.to_string(),
        _ => {
            degraded = true;
            SILENCE_SENTINEL.to_string()
        }
    };

    let query = match value.get("query").and_then(Value::as_object) {
        Some(map) => map
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|q| (k.clone(), q.to_string())))
            .collect(),
        None => {
            degraded = true;
            HashMap::new()
        }
    };

    let turn = PlayerTurn { content, query };
    if degraded {
        Parsed::Degraded(turn)
    } else {
        Parsed::Clean(turn)
    }
}

/// Parses DM output: a JSON object with a `speech` key is honored, any other
/// text is treated as speech wholesale. Either way the speech is run through
/// the marker tokenizer so embedded tool calls become typed commands.
pub fn parse_dm_speech(raw: &str) -> Parsed<DmSpeech> {
    let (speech_text, clean) = match repair_json(raw) {
        Some(value) => match value.get("speech").and_then(Value::as_str) {
            Some(speech) => (speech.to_string(), true),
            None => (raw.trim().to_string(), false),
        },
        None => (raw.trim().to_string(), false),
    };

    let (speech, commands) = extract_tool_commands(&speech_text);
    let result = DmSpeech { speech, commands };
    if clean {
        Parsed::Clean(result)
    } else {
        Parsed::Degraded(result)
    }
}

const CLUE_MARKER: &str = "[SHOW_CLUE:";
const CHARACTER_MARKER: &str = "[SHOW_CHARACTER:";

/// Tokenizer for the inline marker sub-language. Matched markers are removed
/// from the speech and returned as commands in source order; malformed or
/// unknown markers are left in place untouched.
pub fn extract_tool_commands(text: &str) -> (String, Vec<ToolCommand>) {
    let mut speech = String::with_capacity(text.len());
    let mut commands = Vec::new();
    let mut i = 0;

    while i < text.len() {
        let rest = &text[i..];
        if rest.starts_with(CLUE_MARKER) {
            if let Some((command, consumed)) = lex_clue_marker(rest) {
                commands.push(command);
                i += consumed;
                continue;
            }
        } else if rest.starts_with(CHARACTER_MARKER) {
            if let Some((command, consumed)) = lex_character_marker(rest) {
                commands.push(command);
                i += consumed;
                continue;
            }
        }
        // Not a marker start; copy one char through.
        let ch = rest.chars().next().expect("index is on a char boundary");
        speech.push(ch);
        i += ch.len_utf8();
    }

    (speech, commands)
}

// `[SHOW_CLUE:<chapter>-<index>]`, both numbers 1-based decimal.
fn lex_clue_marker(rest: &str) -> Option<(ToolCommand, usize)> {
    let body_start = CLUE_MARKER.len();
    let end = rest[body_start..].find(']')? + body_start;
    let body = &rest[body_start..end];
    let (chapter, clue_index) = body.split_once('-')?;
    let chapter: usize = chapter.trim().parse().ok()?;
    let clue_index: usize = clue_index.trim().parse().ok()?;
    if chapter == 0 || clue_index == 0 {
        return None;
    }
    Some((
        ToolCommand::ShowClue {
            chapter,
            clue_index,
        },
        end + 1,
    ))
}

// `[SHOW_CHARACTER:<name>]`, name is any non-empty text without brackets.
fn lex_character_marker(rest: &str) -> Option<(ToolCommand, usize)> {
    let body_start = CHARACTER_MARKER.len();
    let end = rest[body_start..].find(']')? + body_start;
    let name = rest[body_start..end].trim();
    if name.is_empty() || name.contains('[') {
        return None;
    }
    Some((
        ToolCommand::ShowCharacter {
            name: name.to_string(),
        },
        end + 1,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn player_turn_strict_json_is_clean() {
        let raw = r#"{"content": "I saw him leave.", "query": {"Bob": "Where were you?"}}"#;
        let parsed = parse_player_turn(raw);
        assert!(!parsed.is_degraded());
        let turn = parsed.into_inner();
        assert_eq!(turn.content, "I saw him leave.");
        assert_eq!(turn.query.get("Bob").unwrap(), "Where were you?");
    }

    #[test]
    fn player_turn_fenced_json_is_repaired() {
        let raw = "```json\n{\"content\": \"hm\", \"query\": {}}\n```";
        let parsed = parse_player_turn(raw);
        assert!(parsed.is_degraded());
        assert_eq!(parsed.inner().content, "hm");
    }

    #[test]
    fn player_turn_missing_fields_get_sentinels() {
        let parsed = parse_player_turn(r#"{"query": {"A": "q"}}"#);
        assert!(parsed.is_degraded());
        assert_eq!(parsed.inner().content, SILENCE_SENTINEL);

        let parsed = parse_player_turn(r#"{"content": "fine"}"#);
        assert!(parsed.is_degraded());
        assert!(parsed.inner().query.is_empty());
    }

    #[test]
    fn player_turn_prose_is_wrapped_verbatim() {
        let parsed = parse_player_turn("I have nothing structured to say.");
        assert!(parsed.is_degraded());
        let turn = parsed.into_inner();
        assert_eq!(turn.content, "I have nothing structured to say.");
        assert!(turn.query.is_empty());
    }

    #[test]
    fn player_turn_never_panics_on_garbage() {
        for raw in ["", "{", "}{", "```json", "{\"content\": 5}", "null", "[]"] {
            let _ = parse_player_turn(raw);
        }
    }

    #[test]
    fn player_turn_round_trip_is_stable() {
        let raw = r#"{"content": "a", "query": {"B": "b?"}}"#;
        let first = parse_player_turn(raw).into_inner();
        let reserialized = serde_json::to_string(&first).unwrap();
        let second = parse_player_turn(&reserialized).into_inner();
        assert_eq!(first, second);
    }

    #[test]
    fn dm_speech_json_path() {
        let raw = r#"{"speech": "Welcome, everyone."}"#;
        let parsed = parse_dm_speech(raw);
        assert!(!parsed.is_degraded());
        assert_eq!(parsed.inner().speech, "Welcome, everyone.");
        assert!(parsed.inner().commands.is_empty());
    }

    #[test]
    fn dm_speech_marker_extraction_preserves_order() {
        let parsed = parse_dm_speech("A [SHOW_CLUE:2-1] B [SHOW_CHARACTER:X] C");
        let speech = parsed.into_inner();
        assert_eq!(speech.speech, "A  B  C");
        assert_eq!(
            speech.commands,
            vec![
                ToolCommand::ShowClue {
                    chapter: 2,
                    clue_index: 1
                },
                ToolCommand::ShowCharacter {
                    name: "X".to_string()
                },
            ]
        );
    }

    #[test]
    fn malformed_markers_are_left_in_place() {
        let (speech, commands) = extract_tool_commands("x [SHOW_CLUE:a-1] y [SHOW_CLUE:1-2");
        assert_eq!(speech, "x [SHOW_CLUE:a-1] y [SHOW_CLUE:1-2");
        assert!(commands.is_empty());

        let (speech, commands) = extract_tool_commands("[SHOW_CHARACTER:] and [SHOW_CLUE:0-1]");
        assert_eq!(speech, "[SHOW_CHARACTER:] and [SHOW_CLUE:0-1]");
        assert!(commands.is_empty());
    }

    #[test]
    fn markers_inside_json_speech_are_extracted() {
        let raw = r#"{"speech": "Look here. [SHOW_CLUE:1-1]"}"#;
        let speech = parse_dm_speech(raw).into_inner();
        assert_eq!(speech.speech, "Look here. ");
        assert_eq!(speech.commands.len(), 1);
    }

    #[test]
    fn repair_json_handles_surrounding_prose() {
        let raw = "Sure! Here is the JSON you asked for:\n```json\n{\"title\": \"t\"}\n```\nEnjoy.";
        let value = repair_json(raw).unwrap();
        assert_eq!(value["title"], "t");
        assert!(repair_json("no braces at all").is_none());
    }
}
