//! AI player agents. Each one sees only its own chapter texts and the shared
//! transcript, speaks in character, and may direct questions at the other
//! characters.

use serde_json::json;
use std::collections::HashMap;

use crate::ai::Completer;
use crate::ai_response::{self, PlayerTurn};
use crate::error::GameError;

const QUERY_TEMPERATURE: f32 = 0.8;
const RESPONSE_TEMPERATURE: f32 = 0.7;

/// Shown while the upstream call is down so the discussion can move on.
fn thinking_fallback(name: &str) -> String {
    format!("**[{name} is thinking...]**")
}

fn cannot_respond_fallback(name: &str) -> String {
    format!("**[{name} cannot respond right now]**")
}

pub const DECLINED_SENTINEL: &str = "**[declined to answer]**";

#[derive(Clone)]
pub struct PlayerAgent<C> {
    name: String,
    gateway: C,
}

impl<C: Completer> PlayerAgent<C> {
    pub fn new(name: impl Into<String>, gateway: C) -> Self {
        Self {
            name: name.into(),
            gateway,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// One spontaneous turn. `visible_chapters` is everything this character
    /// is allowed to know; `known_characters` is the authoritative list of
    /// valid question targets. Never fails: upstream errors become a
    /// placeholder turn with no questions.
    pub async fn query(
        &self,
        visible_chapters: &[String],
        chat_history: &str,
        known_characters: &[String],
    ) -> PlayerTurn {
        let system_prompt = self.query_system(known_characters);
        let user_prompt = self.query_user(visible_chapters, chat_history, known_characters);

        let raw = match self
            .gateway
            .complete(&system_prompt, &user_prompt, QUERY_TEMPERATURE)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("player '{}' query failed: {e}", self.name);
                return PlayerTurn {
                    content: thinking_fallback(&self.name),
                    query: HashMap::new(),
                };
            }
        };

        let parsed = ai_response::parse_player_turn(&raw);
        if parsed.is_degraded() {
            log::debug!("player '{}' turn parsed degraded", self.name);
        }
        let mut turn = parsed.into_inner();

        // Targets the model invented, or the character itself, are dropped
        // here so they never reach the session.
        turn.query.retain(|target, _| {
            let valid = target != &self.name && known_characters.iter().any(|c| c == target);
            if !valid {
                log::debug!("player '{}' dropped query target '{target}'", self.name);
            }
            valid
        });
        turn
    }

    /// Answers a directed question. The question and the asker are mandatory;
    /// upstream failures still produce an in-character answer.
    pub async fn response(
        &self,
        visible_chapters: &[String],
        chat_history: &str,
        question: &str,
        asking_character: &str,
    ) -> Result<String, GameError> {
        if question.trim().is_empty() || asking_character.trim().is_empty() {
            return Err(GameError::MissingQueryContext);
        }

        let system_prompt = self.response_system();
        let user_prompt =
            self.response_user(visible_chapters, chat_history, question, asking_character);

        let raw = match self
            .gateway
            .complete(&system_prompt, &user_prompt, RESPONSE_TEMPERATURE)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("player '{}' response failed: {e}", self.name);
                return Ok(cannot_respond_fallback(&self.name));
            }
        };

        Ok(normalize_answer(&raw))
    }

    fn query_system(&self, known_characters: &[String]) -> String {
        format!(
            "You are playing the character '{}' in a live murder-mystery game. \
Stay strictly in character and never reveal information your chapters do not \
contain. The other characters are: {}.\n\n\
Respond with a single JSON object, nothing else:\n\
{{\"content\": \"what you say aloud\", \"query\": {{\"CharacterName\": \"a question for them\"}}}}\n\
The \"query\" map may be empty. Only question characters from the list above.",
            self.name,
            others(known_characters, &self.name).join(", ")
        )
    }

    fn query_user(
        &self,
        visible_chapters: &[String],
        chat_history: &str,
        known_characters: &[String],
    ) -> String {
        let mut prompt = String::new();
        prompt.push_str("## Your script so far\n");
        if visible_chapters.is_empty() {
            prompt.push_str("(the game has not started)\n");
        }
        for (i, chapter) in visible_chapters.iter().enumerate() {
            prompt.push_str(&format!("\n### Chapter {}\n{chapter}\n", i + 1));
        }
        if chat_history.trim().is_empty() {
            prompt.push_str("\n## Discussion so far\n(no one has spoken yet)\n");
        } else {
            prompt.push_str(&format!("\n## Discussion so far\n{chat_history}\n"));
        }
        prompt.push_str(&format!(
            "\nIt is your turn, {}. Speak in character, advance your own goals, \
and question others from: {}. Output the JSON object only.",
            self.name,
            others(known_characters, &self.name).join(", ")
        ));
        prompt
    }

    fn response_system(&self) -> String {
        format!(
            "You are playing the character '{}' in a live murder-mystery game. \
Another character has asked you a direct question. Answer in character, in \
plain text. You may evade or lie if your character would, but never reveal \
information your chapters do not contain.",
            self.name
        )
    }

    fn response_user(
        &self,
        visible_chapters: &[String],
        chat_history: &str,
        question: &str,
        asking_character: &str,
    ) -> String {
        let mut prompt = String::new();
        prompt.push_str("## Your script so far\n");
        for (i, chapter) in visible_chapters.iter().enumerate() {
            prompt.push_str(&format!("\n### Chapter {}\n{chapter}\n", i + 1));
        }
        if !chat_history.trim().is_empty() {
            prompt.push_str(&format!("\n## Discussion so far\n{chat_history}\n"));
        }
        prompt.push_str(&format!(
            "\n{asking_character} asks you: \"{question}\"\n\nAnswer them now, as {}.",
            self.name
        ));
        prompt
    }
}

fn others(known_characters: &[String], this: &str) -> Vec<String> {
    known_characters
        .iter()
        .filter(|c| c.as_str() != this)
        .cloned()
        .collect()
}

/// Collapses refusal-shaped model output into one sentinel so the transcript
/// stays uniform.
fn normalize_answer(raw: &str) -> String {
    let trimmed = raw.trim();
    let lowered = trimmed.to_ascii_lowercase();
    let declined = trimmed.is_empty()
        || matches!(lowered.as_str(), "no" | "no." | "silent" | "silence" | "...")
        || lowered == "i have nothing to say"
        || lowered == "i have nothing to say.";
    if declined {
        DECLINED_SENTINEL.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Serializable digest of a query call for the agent audit log.
pub fn query_params(chat_history: &str, known_characters: &[String]) -> serde_json::Value {
    json!({
        "history_chars": chat_history.chars().count(),
        "known_characters": known_characters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AIError;

    struct CannedCompleter {
        reply: Result<String, ()>,
    }

    impl Completer for CannedCompleter {
        async fn complete(
            &self,
            _system_prompt: &str,
            _user_prompt: &str,
            _temperature: f32,
        ) -> Result<String, AIError> {
            self.reply
                .clone()
                .map_err(|_| AIError::Unavailable("down".into()))
        }
    }

    fn cast() -> Vec<String> {
        vec!["Alice".to_string(), "Bob".to_string(), "Carol".to_string()]
    }

    #[tokio::test]
    async fn query_filters_invented_and_self_targets() {
        let agent = PlayerAgent::new(
            "Alice",
            CannedCompleter {
                reply: Ok(r#"{"content": "I saw something.",
                    "query": {"Bob": "Where?", "Alice": "hm?", "Mallory": "who?"}}"#
                    .to_string()),
            },
        );
        let turn = agent.query(&[], "", &cast()).await;
        assert_eq!(turn.content, "I saw something.");
        assert_eq!(turn.query.len(), 1);
        assert!(turn.query.contains_key("Bob"));
    }

    #[tokio::test]
    async fn query_degrades_to_thinking_on_upstream_failure() {
        let agent = PlayerAgent::new("Alice", CannedCompleter { reply: Err(()) });
        let turn = agent.query(&[], "", &cast()).await;
        assert_eq!(turn.content, "**[Alice is thinking...]**");
        assert!(turn.query.is_empty());
    }

    #[tokio::test]
    async fn response_requires_question_and_asker() {
        let agent = PlayerAgent::new(
            "Bob",
            CannedCompleter {
                reply: Ok("In the garden.".to_string()),
            },
        );
        assert!(matches!(
            agent.response(&[], "", "", "Alice").await,
            Err(GameError::MissingQueryContext)
        ));
        assert!(matches!(
            agent.response(&[], "", "Where were you?", "  ").await,
            Err(GameError::MissingQueryContext)
        ));
        let answer = agent.response(&[], "", "Where were you?", "Alice").await;
        assert_eq!(answer.unwrap(), "In the garden.");
    }

    #[tokio::test]
    async fn response_survives_upstream_failure() {
        let agent = PlayerAgent::new("Bob", CannedCompleter { reply: Err(()) });
        let answer = agent
            .response(&[], "", "Where were you?", "Alice")
            .await
            .unwrap();
        assert_eq!(answer, "**[Bob cannot respond right now]**");
    }

    #[test]
    fn refusals_collapse_to_one_sentinel() {
        for raw in ["", "  ", "no", "No.", "SILENCE", "..."] {
            assert_eq!(normalize_answer(raw), DECLINED_SENTINEL);
        }
        assert_eq!(normalize_answer(" fine. "), "fine.");
    }
}
