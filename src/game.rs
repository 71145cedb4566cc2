//! The game orchestrator: owns the script, the DM agent, the asset
//! registries and the chapter counter, and decides when the DM steps in.

use chrono::Local;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::time::{Duration, sleep};

use crate::agent_log::AgentLog;
use crate::ai::Completer;
use crate::chat::ActionLog;
use crate::dm::{DmAgent, DmReply, SpeakContext, SpeakMode, speak_params};
use crate::error::{AppError, GameError};
use crate::imager::{
    IMAGES_SUBDIR, ImageBackend, ImageOutcome, PollPolicy, character_image_name, clue_image_name,
    generate_and_save,
};
use crate::script::{AssetStats, GameManifest, SCRIPT_FILE, Script};
use crate::settings::Settings;

/// Trailing transcript window the interjection heuristic inspects.
const INTERJECT_WINDOW_CHARS: usize = 500;

/// Player messages since the last DM line before the DM steps in regardless
/// of content.
const INTERJECT_MESSAGE_THRESHOLD: usize = 10;

/// Distinct case-insensitive hits from this set inside the window that
/// signal the discussion is circling the solution.
const INTERJECT_KEYWORDS: [&str; 8] = [
    "killer", "murderer", "clue", "truth", "suspect", "evidence", "motive", "alibi",
];
const INTERJECT_KEYWORD_THRESHOLD: usize = 3;

const STALL_PHRASES: [&str; 3] = ["nothing to say", "don't know", "no idea"];

pub struct Game<C, I> {
    dm: DmAgent<C>,
    image_backend: I,
    script: Script,
    game_dir: PathBuf,
    /// 1-based current chapter; 0 means the game has not started.
    chapter: usize,
    pub character_images: HashMap<String, ImageOutcome>,
    pub clue_images: HashMap<(usize, usize), ImageOutcome>,
    agent_log: AgentLog,
    image_size: String,
    image_request_delay: Duration,
    poll_policy: PollPolicy,
}

impl<C: Completer, I: ImageBackend> Game<C, I> {
    /// Generates a fresh game: one script, its assets, and a manifest, all
    /// persisted under a new directory below `data_dir/games/`.
    pub async fn create(
        settings: &Settings,
        gateway: C,
        image_backend: I,
    ) -> Result<Self, AppError> {
        let dm = DmAgent::new(gateway);
        let script = dm.generate_script().await?;

        let game_dir = Path::new(&settings.data_dir)
            .join("games")
            .join(format!(
                "{}_{}",
                Local::now().format("%Y%m%d_%H%M%S"),
                slug(&script.title)
            ));
        script.save(&game_dir.join(SCRIPT_FILE))?;
        log::info!("created game at {}", game_dir.display());

        // The log directory is derived from the script title, so generation
        // can only be recorded after the fact.
        let agent_log = AgentLog::new(&game_dir);
        agent_log.record(
            "DmAgent",
            "generate_script",
            serde_json::json!({
                "title": script.title,
                "characters": script.characters.len(),
                "chapters": script.total_chapters(),
            }),
            true,
            None,
        );
        let mut game = Self {
            dm,
            image_backend,
            script,
            game_dir,
            chapter: 0,
            character_images: HashMap::new(),
            clue_images: HashMap::new(),
            agent_log,
            image_size: settings.image_size.clone(),
            image_request_delay: Duration::from_secs(settings.image_request_delay_secs),
            poll_policy: PollPolicy::default(),
        };

        if settings.generate_images {
            game.generate_assets().await;
        } else {
            log::info!("image generation disabled, skipping assets");
        }

        let manifest = GameManifest::new(
            &game.script,
            stats(game.character_images.values()),
            stats(game.clue_images.values()),
        );
        manifest.save(&game.game_dir)?;
        Ok(game)
    }

    /// Reopens an existing game directory: validates the script and registers
    /// every expected asset already on disk.
    pub fn load(game_dir: &Path, gateway: C, image_backend: I) -> Result<Self, AppError> {
        let script = Script::load(&game_dir.join(SCRIPT_FILE))?;
        log::info!(
            "loaded game '{}' from {}",
            script.title,
            game_dir.display()
        );

        let mut game = Self {
            dm: DmAgent::new(gateway),
            image_backend,
            script,
            game_dir: game_dir.to_path_buf(),
            chapter: 0,
            character_images: HashMap::new(),
            clue_images: HashMap::new(),
            agent_log: AgentLog::new(game_dir),
            image_size: String::new(),
            image_request_delay: Duration::ZERO,
            poll_policy: PollPolicy::default(),
        };
        game.register_existing_assets();
        Ok(game)
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn game_dir(&self) -> &Path {
        &self.game_dir
    }

    pub fn agent_log(&self) -> &AgentLog {
        &self.agent_log
    }

    /// 1-based; 0 until the first chapter starts.
    pub fn current_chapter(&self) -> usize {
        self.chapter
    }

    pub fn is_finished(&self) -> bool {
        self.chapter >= self.script.total_chapters()
    }

    #[cfg(test)]
    pub fn set_poll_policy(&mut self, policy: PollPolicy) {
        self.poll_policy = policy;
    }

    /// Advances to the next chapter and has the DM open it. Fails only when
    /// no chapter is left; a failed DM call still opens the chapter with
    /// fallback narration.
    pub async fn start_chapter(&mut self, chat_history: &str) -> Result<DmReply, GameError> {
        if self.chapter >= self.script.total_chapters() {
            return Err(GameError::ResourceNotFound(format!(
                "chapter {} of {}",
                self.chapter + 1,
                self.script.total_chapters()
            )));
        }
        self.chapter += 1;
        log::info!("starting chapter {}", self.chapter);
        Ok(self
            .dm_speak(chat_history, SpeakMode::ChapterStart, SpeakContext::default())
            .await)
    }

    pub async fn end_chapter(&self, chat_history: &str) -> DmReply {
        self.dm_speak(chat_history, SpeakMode::ChapterEnd, SpeakContext::default())
            .await
    }

    pub async fn end_game(&self, chat_history: &str, ctx: SpeakContext) -> DmReply {
        self.dm_speak(chat_history, SpeakMode::GameEnd, ctx).await
    }

    pub async fn dm_interject(&self, chat_history: &str, reason: Option<String>) -> DmReply {
        let ctx = SpeakContext {
            trigger_reason: reason,
            ..Default::default()
        };
        self.dm_speak(chat_history, SpeakMode::Interject, ctx).await
    }

    async fn dm_speak(&self, chat_history: &str, mode: SpeakMode, ctx: SpeakContext) -> DmReply {
        let chapter_index = self.chapter.saturating_sub(1);
        let reply = self
            .dm
            .speak(
                chapter_index,
                &self.script,
                chat_history,
                mode,
                &ctx,
                &self.game_dir,
            )
            .await;
        self.agent_log.record(
            "DmAgent",
            "speak",
            speak_params(self.chapter, mode, chat_history),
            reply.success,
            reply.error_notice.as_deref(),
        );
        reply
    }

    /// Pure check for whether the DM should interject, with the reason that
    /// would be handed to the prompt. No model call is made here.
    pub fn should_dm_interject(log: &ActionLog) -> Option<String> {
        interject_reason(
            log.messages_since_last_dm(),
            &log.tail_markdown(INTERJECT_WINDOW_CHARS),
        )
    }

    async fn generate_assets(&mut self) {
        let imgs_dir = self.game_dir.join(IMAGES_SUBDIR);
        let mut first = true;

        for name in self.script.characters.clone() {
            let Some(prompt) = self.script.character_image_prompts.get(&name).cloned() else {
                log::warn!("no portrait prompt for '{name}'");
                continue;
            };
            if !std::mem::take(&mut first) {
                sleep(self.image_request_delay).await;
            }
            let outcome = generate_and_save(
                &self.image_backend,
                &prompt,
                &self.image_size,
                &imgs_dir,
                &character_image_name(&name),
                self.poll_policy,
            )
            .await;
            if let Some(error) = &outcome.error {
                log::warn!("portrait for '{name}' failed: {error}");
            }
            self.character_images.insert(name, outcome);
        }

        let clue_prompts = self.script.clue_image_prompts.clone();
        for (chapter_idx, prompts) in clue_prompts.iter().enumerate() {
            for (clue_idx, prompt) in prompts.iter().enumerate() {
                let key = (chapter_idx + 1, clue_idx + 1);
                if !std::mem::take(&mut first) {
                    sleep(self.image_request_delay).await;
                }
                let outcome = generate_and_save(
                    &self.image_backend,
                    prompt,
                    &self.image_size,
                    &imgs_dir,
                    &clue_image_name(key.0, key.1),
                    self.poll_policy,
                )
                .await;
                if let Some(error) = &outcome.error {
                    log::warn!("clue image {}-{} failed: {error}", key.0, key.1);
                }
                self.clue_images.insert(key, outcome);
            }
        }
    }

    // Assets found on disk are trusted as-is; absent ones simply stay out of
    // the registries.
    fn register_existing_assets(&mut self) {
        let imgs_dir = self.game_dir.join(IMAGES_SUBDIR);

        for name in self.script.characters.clone() {
            let filename = character_image_name(&name);
            let path = imgs_dir.join(&filename);
            if path.exists() {
                self.character_images
                    .insert(name, ImageOutcome::from_disk(&filename, path));
            }
        }

        for chapter in 1..=self.script.clue_image_prompts.len() {
            let count = self.script.clue_image_prompts[chapter - 1].len();
            for clue in 1..=count {
                let filename = clue_image_name(chapter, clue);
                let path = imgs_dir.join(&filename);
                if path.exists() {
                    self.clue_images
                        .insert((chapter, clue), ImageOutcome::from_disk(&filename, path));
                }
            }
        }
        log::info!(
            "registered {} portraits and {} clue images from disk",
            self.character_images.len(),
            self.clue_images.len()
        );
    }
}

/// Game directories under `data_dir/games/` that hold a script, newest last.
pub fn list_game_dirs(data_dir: &str) -> Vec<PathBuf> {
    let games_root = Path::new(data_dir).join("games");
    let Ok(entries) = std::fs::read_dir(&games_root) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.join(SCRIPT_FILE).is_file())
        .collect();
    dirs.sort();
    dirs
}

fn interject_reason(messages_since_dm: usize, window: &str) -> Option<String> {
    if messages_since_dm > INTERJECT_MESSAGE_THRESHOLD {
        return Some(format!(
            "{messages_since_dm} player messages since the host last spoke"
        ));
    }

    let lowered = window.to_ascii_lowercase();
    let hits = INTERJECT_KEYWORDS
        .iter()
        .filter(|keyword| lowered.contains(*keyword))
        .count();
    if hits >= INTERJECT_KEYWORD_THRESHOLD {
        return Some("the players are closing in on the case".to_string());
    }

    if STALL_PHRASES.iter().any(|phrase| lowered.contains(phrase)) {
        return Some("the discussion has stalled".to_string());
    }

    None
}

fn stats<'a>(outcomes: impl Iterator<Item = &'a ImageOutcome>) -> AssetStats {
    let mut result = AssetStats::default();
    for outcome in outcomes {
        result.total += 1;
        if outcome.success {
            result.succeeded += 1;
        }
    }
    result
}

fn slug(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    cleaned.trim_matches('_').chars().take(40).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn many_messages_trigger_interjection() {
        assert!(interject_reason(11, "").is_some());
        assert!(interject_reason(10, "").is_none());
        assert!(interject_reason(0, "we talked about the weather").is_none());
    }

    #[test]
    fn keyword_density_triggers_interjection() {
        let heated = "the killer left a clue, and the evidence points one way";
        assert!(interject_reason(2, heated).is_some());
        let mild = "there is a clue here somewhere";
        assert!(interject_reason(2, mild).is_none());
    }

    #[test]
    fn stalled_discussion_triggers_interjection() {
        assert!(interject_reason(1, "honestly I have nothing to say").is_some());
    }

    #[test]
    fn slug_strips_punctuation() {
        assert_eq!(slug("The Manor Affair!"), "The_Manor_Affair");
        assert_eq!(slug("危机：午夜"), "危机_午夜");
    }

    #[test]
    fn list_game_dirs_requires_script_file() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_str().unwrap().to_string();
        let games = dir.path().join("games");
        std::fs::create_dir_all(games.join("a")).unwrap();
        std::fs::create_dir_all(games.join("b")).unwrap();
        std::fs::write(games.join("b").join(SCRIPT_FILE), "{}").unwrap();

        let found = list_game_dirs(&data_dir);
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("b"));
    }
}
