//! The Dungeon-Master agent: script generation, chapter narration and the
//! inline tool calls embedded in it.
//!
//! Every public entry point here returns a usable value. A failed upstream
//! call degrades narrative quality, never the game loop.

use serde::Serialize;
use serde_json::json;
use std::path::Path;

use crate::ai::Completer;
use crate::ai_response::{self, ToolCommand};
use crate::chat::tail_chars;
use crate::error::{AppError, GameError};
use crate::imager::{IMAGES_SUBDIR, character_image_name, clue_image_name};
use crate::script::Script;

/// How much trailing transcript an interjection sees. Interjections are
/// frequent, so their token cost is bounded.
const INTERJECT_HISTORY_CHARS: usize = 1000;

const GENERATE_TEMPERATURE: f32 = 0.7;
const SPEAK_TEMPERATURE: f32 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakMode {
    ChapterStart,
    ChapterEnd,
    GameEnd,
    Interject,
}

impl SpeakMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeakMode::ChapterStart => "chapter_start",
            SpeakMode::ChapterEnd => "chapter_end",
            SpeakMode::GameEnd => "game_end",
            SpeakMode::Interject => "interject",
        }
    }

    // The caller must always receive a usable string, so each mode carries
    // its own canned narration for the failure path.
    fn fallback(&self) -> &'static str {
        match self {
            SpeakMode::ChapterStart => {
                "The host straightens the dossier before him. \"A new chapter begins. \
                 Read your parts carefully, and speak when you are ready.\""
            }
            SpeakMode::ChapterEnd => {
                "The host raises a hand for silence. \"That concludes this chapter. \
                 Hold on to what you have learned; more will surface soon.\""
            }
            SpeakMode::GameEnd => {
                "The host closes the dossier. \"Our tale ends here. The truth now \
                 belongs to all of you. Thank you for playing.\""
            }
            SpeakMode::Interject => "The host watches in silence, noting every word.",
        }
    }
}

/// Extra context for `speak` that only some modes use.
#[derive(Debug, Default, Clone)]
pub struct SpeakContext {
    pub killer: Option<String>,
    pub truth: Option<String>,
    pub trigger_reason: Option<String>,
    pub guidance: Option<String>,
}

/// Result of one executed tool call, surfaced to the UI layer alongside the
/// narration. Failures carry `success: false`, never an error value.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolOutcome {
    ShowClue {
        chapter: usize,
        clue_index: usize,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        image_ref: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ShowCharacter {
        name: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        image_ref: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// What a DM turn hands back to the session: narration, executed tools, and
/// whether the model call itself succeeded.
#[derive(Debug, Clone)]
pub struct DmReply {
    pub speech: String,
    pub tools: Vec<ToolOutcome>,
    pub success: bool,
    /// In-character notice for the UI when the upstream call failed.
    pub error_notice: Option<String>,
}

pub struct DmAgent<C> {
    gateway: C,
}

impl<C: Completer> DmAgent<C> {
    pub fn new(gateway: C) -> Self {
        Self { gateway }
    }

    /// One LLM call that produces the entire script. No retries: an
    /// irrecoverable parse failure is a domain-level error for the caller.
    pub async fn generate_script(&self) -> Result<Script, AppError> {
        log::info!("generating new script");
        let raw = self
            .gateway
            .complete(
                prompts::GENERATE_SYSTEM,
                prompts::GENERATE_USER,
                GENERATE_TEMPERATURE,
            )
            .await?;

        let value = ai_response::repair_json(&raw).ok_or_else(|| {
            GameError::MalformedModelOutput(format!(
                "script generation returned no JSON object: {}",
                crate::agent_log::preview(&raw, 200)
            ))
        })?;
        let script: Script = serde_json::from_value(value)
            .map_err(|e| GameError::MalformedModelOutput(format!("script shape mismatch: {e}")))?;
        script.validate()?;
        log::info!(
            "script '{}' generated: {} characters, {} chapters",
            script.title,
            script.characters.len(),
            script.total_chapters()
        );
        Ok(script)
    }

    /// Produces one piece of DM narration. `chapter` is 0-based. Tool calls
    /// embedded in the narration are executed synchronously against the
    /// script and the on-disk image registry.
    pub async fn speak(
        &self,
        chapter: usize,
        script: &Script,
        chat_history: &str,
        mode: SpeakMode,
        ctx: &SpeakContext,
        base_path: &Path,
    ) -> DmReply {
        let system_prompt = prompts::speak_system(mode);
        let user_prompt = prompts::speak_user(chapter, script, chat_history, mode, ctx);

        match self
            .gateway
            .complete(&system_prompt, &user_prompt, SPEAK_TEMPERATURE)
            .await
        {
            Ok(raw) => {
                let parsed = ai_response::parse_dm_speech(&raw);
                if parsed.is_degraded() {
                    log::debug!("dm speech for {} parsed degraded", mode.as_str());
                }
                let speech = parsed.into_inner();
                let tools = speech
                    .commands
                    .iter()
                    .map(|command| self.execute_tool(command, script, base_path))
                    .collect();
                DmReply {
                    speech: speech.speech,
                    tools,
                    success: true,
                    error_notice: None,
                }
            }
            Err(e) => {
                log::warn!("dm speak ({}) failed: {e}", mode.as_str());
                DmReply {
                    speech: mode.fallback().to_string(),
                    tools: Vec::new(),
                    success: false,
                    error_notice: Some(e.player_facing()),
                }
            }
        }
    }

    fn execute_tool(&self, command: &ToolCommand, script: &Script, base_path: &Path) -> ToolOutcome {
        match command {
            ToolCommand::ShowClue {
                chapter,
                clue_index,
            } => show_clue(*chapter, *clue_index, script, base_path),
            ToolCommand::ShowCharacter { name } => show_character(name, script, base_path),
        }
    }
}

/// Looks up a clue by 1-based chapter and clue index and resolves its
/// deterministic image file under `base_path/imgs/`. Out-of-range indices
/// yield a not-found outcome, not an error.
pub fn show_clue(
    chapter: usize,
    clue_index: usize,
    script: &Script,
    base_path: &Path,
) -> ToolOutcome {
    let description = chapter
        .checked_sub(1)
        .and_then(|c| script.clues.get(c))
        .and_then(|chapter_clues| clue_index.checked_sub(1).and_then(|i| chapter_clues.get(i)));

    match description {
        Some(description) => {
            let filename = clue_image_name(chapter, clue_index);
            let on_disk = base_path.join(IMAGES_SUBDIR).join(&filename);
            if !on_disk.exists() {
                log::debug!("clue image not on disk: {}", on_disk.display());
            }
            ToolOutcome::ShowClue {
                chapter,
                clue_index,
                success: true,
                description: Some(description.clone()),
                image_ref: Some(filename),
                error: None,
            }
        }
        None => ToolOutcome::ShowClue {
            chapter,
            clue_index,
            success: false,
            description: None,
            image_ref: None,
            error: Some(format!("clue {clue_index} of chapter {chapter} not found")),
        },
    }
}

/// Resolves a character portrait reference. Rejecting unknown names here is
/// the enforcement point that keeps invented characters out of tool output.
pub fn show_character(name: &str, script: &Script, base_path: &Path) -> ToolOutcome {
    if script.has_character(name) {
        let filename = character_image_name(name);
        let on_disk = base_path.join(IMAGES_SUBDIR).join(&filename);
        if !on_disk.exists() {
            log::debug!("character image not on disk: {}", on_disk.display());
        }
        ToolOutcome::ShowCharacter {
            name: name.to_string(),
            success: true,
            image_ref: Some(filename),
            error: None,
        }
    } else {
        ToolOutcome::ShowCharacter {
            name: name.to_string(),
            success: false,
            image_ref: None,
            error: Some(format!("character '{name}' is not in this script")),
        }
    }
}

/// Serializable digest of a speak call for the agent audit log.
pub fn speak_params(chapter: usize, mode: SpeakMode, chat_history: &str) -> serde_json::Value {
    json!({
        "chapter": chapter,
        "mode": mode.as_str(),
        "history_chars": chat_history.chars().count(),
    })
}

mod prompts {
    use super::{INTERJECT_HISTORY_CHARS, SpeakContext, SpeakMode, tail_chars};
    use crate::script::Script;

    pub const GENERATE_SYSTEM: &str = "\
You are a professional murder-mystery game host. You write complete scripted \
mystery games for 4-6 players: one self-contained chapter script per player \
per chapter seen only from that character's limited point of view, a \
god's-eye host narration per chapter for yourself, clues revealed per \
chapter, and image prompts for every clue and every character portrait. The \
killer's identity must stay consistent across every viewpoint.";

    pub const GENERATE_USER: &str = r#"Write a complete murder-mystery script and output it as a single JSON object, nothing else. First decide on the cast and name each character, then write the host narration chapter by chapter, then each character's limited-viewpoint chapters, then the clues and image prompts.

Required shape:
{
  "title": "script title",
  "theme": "one-line theme",
  "characters": ["name1", "name2", ...],
  "chapters": {
    "name1": ["chapter 1 as seen by name1", "chapter 2 as seen by name1", ...],
    "name2": ["..."]
  },
  "dm": ["host narration for chapter 1", "host narration for chapter 2", ...],
  "clues": [["clue 1 of chapter 1", "clue 2 of chapter 1"], ["clue 1 of chapter 2"], ...],
  "clue_image_prompts": [["image prompt per clue, same layout as clues"], ...],
  "character_image_prompts": {"name1": "portrait prompt", "name2": "..."}
}

Rules:
- every character has exactly one entry per chapter, and every chapter text is at least 500 characters long
- "dm", "clues" and "clue_image_prompts" have the same number of chapters
- output raw JSON with no markdown fences and no commentary"#;

    pub fn speak_system(mode: SpeakMode) -> String {
        let role = "You are the host of a live murder-mystery game. You speak in a \
suspenseful, theatrical voice, address the players directly, and never \
reveal information from chapters that have not started yet.";
        let task = match mode {
            SpeakMode::ChapterStart => {
                "Open the chapter: set the scene from your narration, remind the players \
of their goals, and invite them to speak."
            }
            SpeakMode::ChapterEnd => {
                "Close the chapter: summarize what the discussion established and build \
anticipation for what comes next, without revealing future chapters."
            }
            SpeakMode::GameEnd => {
                "Reveal the full truth of the case, walk through how the clues fit \
together, and comment on each player's performance."
            }
            SpeakMode::Interject => {
                "Briefly interject to keep the discussion on track. Two or three \
sentences at most."
            }
        };
        let tools = "You may embed tool calls in your narration: [SHOW_CLUE:chapter-index] \
displays a clue image, [SHOW_CHARACTER:name] displays a character portrait. \
Only reference clues already revealed and characters that exist.";
        format!("{role}\n\n{task}\n\n{tools}")
    }

    pub fn speak_user(
        chapter: usize,
        script: &Script,
        chat_history: &str,
        mode: SpeakMode,
        ctx: &SpeakContext,
    ) -> String {
        let mut prompt = format!(
            "## Game\ntitle: {}\ncharacters: {}\ncurrent chapter: {} of {}\n",
            script.title,
            script.characters.join(", "),
            chapter + 1,
            script.total_chapters()
        );

        if let Some(narration) = script.dm.get(chapter) {
            prompt.push_str(&format!("\n## Your chapter narration\n{narration}\n"));
        }

        let revealed: Vec<&str> = script
            .clues
            .iter()
            .take(chapter + 1)
            .flatten()
            .map(String::as_str)
            .collect();
        if !revealed.is_empty() {
            prompt.push_str("\n## Clues revealed so far\n");
            for (i, clue) in revealed.iter().enumerate() {
                prompt.push_str(&format!("{}. {clue}\n", i + 1));
            }
        }

        let history = if mode == SpeakMode::Interject {
            tail_chars(chat_history, INTERJECT_HISTORY_CHARS)
        } else {
            chat_history.to_string()
        };
        if history.trim().is_empty() {
            prompt.push_str("\n## Discussion so far\n(none yet)\n");
        } else {
            prompt.push_str(&format!("\n## Discussion so far\n{history}\n"));
        }

        match mode {
            SpeakMode::GameEnd => {
                if let Some(killer) = &ctx.killer {
                    prompt.push_str(&format!("\n## The killer\n{killer}\n"));
                }
                if let Some(truth) = &ctx.truth {
                    prompt.push_str(&format!("\n## The truth\n{truth}\n"));
                }
                prompt.push_str("\nDeliver the final reveal now.");
            }
            SpeakMode::Interject => {
                if let Some(reason) = &ctx.trigger_reason {
                    prompt.push_str(&format!("\n## Why you are interjecting\n{reason}\n"));
                }
                if let Some(guidance) = &ctx.guidance {
                    prompt.push_str(&format!("\n## Guidance to give\n{guidance}\n"));
                }
                prompt.push_str("\nInterject now, briefly.");
            }
            SpeakMode::ChapterStart => prompt.push_str("\nOpen the chapter now."),
            SpeakMode::ChapterEnd => prompt.push_str("\nClose the chapter now."),
        }

        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn script_with_clues(clues: Vec<Vec<String>>) -> Script {
        let chapters = clues.len().max(1);
        Script {
            title: "t".into(),
            theme: String::new(),
            characters: vec!["Alice".into(), "Bob".into()],
            chapters: HashMap::new(),
            dm: vec!["n".into(); chapters],
            clues,
            clue_image_prompts: Vec::new(),
            character_image_prompts: HashMap::new(),
        }
    }

    #[test]
    fn show_clue_resolves_description_and_image_ref() {
        let script = script_with_clues(vec![vec!["knife".into()]]);
        let outcome = show_clue(1, 1, &script, Path::new("/tmp/none"));
        match outcome {
            ToolOutcome::ShowClue {
                success,
                description,
                image_ref,
                ..
            } => {
                assert!(success);
                assert_eq!(description.as_deref(), Some("knife"));
                assert_eq!(image_ref.as_deref(), Some("clue-ch1-1.png"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn show_clue_out_of_range_is_not_found() {
        let script = script_with_clues(vec![vec!["knife".into()]]);
        for (chapter, index) in [(3, 1), (1, 5), (0, 1), (1, 0)] {
            match show_clue(chapter, index, &script, Path::new("/tmp/none")) {
                ToolOutcome::ShowClue { success, error, .. } => {
                    assert!(!success);
                    assert!(error.is_some());
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
    }

    #[test]
    fn show_character_rejects_invented_names() {
        let script = script_with_clues(vec![]);
        match show_character("Alice", &script, Path::new("/tmp/none")) {
            ToolOutcome::ShowCharacter {
                success, image_ref, ..
            } => {
                assert!(success);
                assert_eq!(image_ref.as_deref(), Some("Alice.png"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        match show_character("Mallory", &script, Path::new("/tmp/none")) {
            ToolOutcome::ShowCharacter { success, .. } => assert!(!success),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn interject_prompt_bounds_history() {
        let script = script_with_clues(vec![vec!["knife".into()]]);
        let long_history = "x".repeat(5000);
        let prompt = prompts::speak_user(
            0,
            &script,
            &long_history,
            SpeakMode::Interject,
            &SpeakContext::default(),
        );
        // Only the tail of the transcript may appear.
        assert!(prompt.len() < 2500);

        let full = prompts::speak_user(
            0,
            &script,
            &long_history,
            SpeakMode::ChapterEnd,
            &SpeakContext::default(),
        );
        assert!(full.len() > 5000);
    }

    #[test]
    fn game_end_prompt_includes_killer_and_truth() {
        let script = script_with_clues(vec![vec!["knife".into()]]);
        let ctx = SpeakContext {
            killer: Some("the butler".into()),
            truth: Some("it was about the will".into()),
            ..Default::default()
        };
        let prompt = prompts::speak_user(0, &script, "", SpeakMode::GameEnd, &ctx);
        assert!(prompt.contains("the butler"));
        assert!(prompt.contains("it was about the will"));
    }
}
