//! Multiplayer session state machine on top of [`Game`](crate::game::Game).
//!
//! A session owns the action log, the seat assignments and the speaking
//! cycle. Humans claim characters; every unclaimed seat is played by an AI
//! agent. All transcript context handed to agents is rendered from the
//! action log, nothing else.

use rand::Rng;
use std::collections::HashMap;
use uuid::Uuid;

use crate::ai::Completer;
use crate::chat::{ActionKind, ActionLog, ActionRecord};
use crate::dm::{DmReply, SpeakContext, ToolOutcome};
use crate::error::{AppError, GameError, SessionError};
use crate::game::Game;
use crate::imager::ImageBackend;
use crate::player::{PlayerAgent, query_params};

/// Chance that a plain player message draws a short canned DM observation.
const DM_ACK_PROBABILITY: f64 = 0.3;

const DM_ACK_LINES: [&str; 3] = [
    "The host nods slowly, taking note.",
    "\"Interesting,\" murmurs the host.",
    "The host's pen scratches across the dossier.",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Waiting,
    Generating,
    CharacterSelect,
    Playing,
    Finished,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Waiting => "waiting",
            SessionState::Generating => "generating",
            SessionState::CharacterSelect => "character_select",
            SessionState::Playing => "playing",
            SessionState::Finished => "finished",
        }
    }
}

/// Progress of the current speaking cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleProgress {
    pub done: usize,
    pub total: usize,
    pub remaining: Vec<String>,
}

impl CycleProgress {
    pub fn is_complete(&self) -> bool {
        self.done >= self.total
    }
}

/// An answer produced while resolving the directed questions of a turn.
#[derive(Debug, Clone)]
pub struct ResolvedAnswer {
    pub asker: String,
    pub target: String,
    pub answer: String,
}

pub struct GameSession<C, I> {
    id: String,
    game: Game<C, I>,
    gateway: C,
    /// user id -> character name.
    players: HashMap<String, String>,
    ai_players: HashMap<String, PlayerAgent<C>>,
    log: ActionLog,
    cycle: usize,
    state: SessionState,
}

impl<C: Completer + Clone, I: ImageBackend> GameSession<C, I> {
    pub fn new(game: Game<C, I>, gateway: C) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            game,
            gateway,
            players: HashMap::new(),
            ai_players: HashMap::new(),
            log: ActionLog::new(),
            cycle: 0,
            state: SessionState::CharacterSelect,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn game(&self) -> &Game<C, I> {
        &self.game
    }

    pub fn log(&self) -> &ActionLog {
        &self.log
    }

    pub fn cycle(&self) -> usize {
        self.cycle
    }

    pub fn character_of(&self, user_id: &str) -> Option<&str> {
        self.players.get(user_id).map(String::as_str)
    }

    /// Claims a seat for a human player. Each character can be claimed once;
    /// claiming is only open before the game starts.
    pub fn claim_character(&mut self, user_id: &str, character: &str) -> Result<(), SessionError> {
        self.expect_state(SessionState::CharacterSelect)?;
        if !self.game.script().has_character(character) {
            return Err(SessionError::UnknownCharacter(character.to_string()));
        }
        if self.players.values().any(|taken| taken == character) {
            return Err(SessionError::CharacterTaken(character.to_string()));
        }
        self.players
            .insert(user_id.to_string(), character.to_string());
        log::info!("user '{user_id}' claimed '{character}'");
        Ok(())
    }

    /// Starts play: every unclaimed seat gets an AI agent, then the DM opens
    /// chapter one.
    pub async fn start(&mut self) -> Result<DmReply, AppError> {
        self.expect_state(SessionState::CharacterSelect)?;
        for character in self.game.script().characters.clone() {
            if !self.players.values().any(|taken| *taken == character) {
                self.ai_players.insert(
                    character.clone(),
                    PlayerAgent::new(character, self.gateway.clone()),
                );
            }
        }
        log::info!(
            "session {} starting with {} human and {} ai seats",
            self.id,
            self.players.len(),
            self.ai_players.len()
        );
        self.state = SessionState::Playing;
        Ok(self.advance_chapter().await?)
    }

    /// Closes the current chapter and opens the next, resetting the cycle.
    pub async fn next_chapter(&mut self) -> Result<DmReply, AppError> {
        self.expect_playing()?;
        let closing = self.game.end_chapter(&self.log.render_markdown()).await;
        self.push_dm_reply(&closing);
        Ok(self.advance_chapter().await?)
    }

    async fn advance_chapter(&mut self) -> Result<DmReply, GameError> {
        let history = self.log.render_markdown();
        let opening = self.game.start_chapter(&history).await?;
        self.cycle = 1;
        self.push_dm_reply(&opening);
        Ok(opening)
    }

    /// Records a human player's turn. Question targets outside the cast, or
    /// aimed at the speaker, are dropped before anything is logged. AI-held
    /// targets answer immediately, in cast order.
    pub async fn submit_player_turn(
        &mut self,
        user_id: &str,
        content: &str,
        queries: HashMap<String, String>,
    ) -> Result<Vec<ResolvedAnswer>, SessionError> {
        self.expect_playing()?;
        let character = self
            .players
            .get(user_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownCharacter(user_id.to_string()))?;

        let queries = self.filter_queries(&character, queries);
        self.push_speak(&character, content, queries.clone());
        Ok(self.resolve_queries(&character, queries).await)
    }

    /// Records a human player's answer to a question directed at them.
    pub fn submit_answer(
        &mut self,
        user_id: &str,
        asker: &str,
        content: &str,
    ) -> Result<(), SessionError> {
        let character = self
            .players
            .get(user_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownCharacter(user_id.to_string()))?;
        self.push_answer(&character, asker, content);
        Ok(())
    }

    /// Runs one AI seat's spontaneous turn, then resolves its questions.
    pub async fn ai_take_turn(
        &mut self,
        character: &str,
    ) -> Result<Vec<ResolvedAnswer>, SessionError> {
        self.expect_playing()?;
        let agent = self
            .ai_players
            .get(character)
            .cloned()
            .ok_or_else(|| SessionError::UnknownCharacter(character.to_string()))?;

        let script = self.game.script();
        let visible = script.visible_chapters(character, self.game.current_chapter());
        let cast = script.characters.clone();
        let history = self.log.render_markdown();

        let turn = agent.query(&visible, &history, &cast).await;
        self.game.agent_log().record(
            "PlayerAgent",
            "query",
            query_params(&history, &cast),
            true,
            None,
        );

        // The agent already filtered its targets; the session filters again
        // because it owns the authoritative cast list.
        let queries = self.filter_queries(character, turn.query);
        self.push_speak(character, &turn.content, queries.clone());
        Ok(self.resolve_queries(character, queries).await)
    }

    /// Answers one directed question with the target's AI agent. Used when a
    /// question from a human turn lands on an AI seat.
    pub async fn ai_answer(
        &mut self,
        asker: &str,
        target: &str,
        question: &str,
    ) -> Result<String, GameError> {
        let agent = self
            .ai_players
            .get(target)
            .cloned()
            .ok_or_else(|| GameError::ResourceNotFound(format!("ai seat '{target}'")))?;

        let visible = self
            .game
            .script()
            .visible_chapters(target, self.game.current_chapter());
        let history = self.log.render_markdown();

        let answer = agent.response(&visible, &history, question, asker).await?;
        self.game.agent_log().record(
            "PlayerAgent",
            "response",
            serde_json::json!({"target": target, "asker": asker}),
            true,
            None,
        );
        self.push_answer(target, asker, &answer);
        Ok(answer)
    }

    /// Has the DM step in if the heuristic says so. Returns the reply when an
    /// interjection happened.
    pub async fn maybe_dm_interject(&mut self) -> Option<DmReply> {
        let reason = Game::<C, I>::should_dm_interject(&self.log)?;
        log::info!("dm interjecting: {reason}");
        let history = self.log.render_markdown();
        let reply = self.game.dm_interject(&history, Some(reason)).await;
        self.push_dm_reply(&reply);
        Some(reply)
    }

    /// Occasionally drops a short canned DM line into the transcript so the
    /// host feels present between narrations. No model call.
    pub fn maybe_dm_ack(&mut self) -> bool {
        let mut rng = rand::rng();
        if !rng.random_bool(DM_ACK_PROBABILITY) {
            return false;
        }
        let line = DM_ACK_LINES[rng.random_range(0..DM_ACK_LINES.len())];
        self.push_record("DM", line, HashMap::new(), None, ActionKind::Dm);
        true
    }

    /// Who still owes a spontaneous turn this cycle. Answers do not count.
    pub fn speaking_completion(&self) -> CycleProgress {
        let cast = &self.game.script().characters;
        let chapter = self.game.current_chapter();
        let spoken: Vec<&str> = self
            .log
            .entries()
            .iter()
            .filter(|entry| {
                entry.kind == ActionKind::Speak
                    && entry.chapter == chapter
                    && entry.cycle == self.cycle
            })
            .map(|entry| entry.speaker.as_str())
            .collect();
        let remaining: Vec<String> = cast
            .iter()
            .filter(|character| !spoken.contains(&character.as_str()))
            .cloned()
            .collect();
        CycleProgress {
            done: cast.len() - remaining.len(),
            total: cast.len(),
            remaining,
        }
    }

    /// Advances the cycle when everyone has spoken. Returns true on advance.
    pub fn sync_cycle(&mut self) -> bool {
        if self.state == SessionState::Playing && self.speaking_completion().is_complete() {
            self.cycle += 1;
            log::debug!("cycle advanced to {}", self.cycle);
            true
        } else {
            false
        }
    }

    /// Final reveal; the session accepts no further turns afterwards.
    pub async fn end(&mut self, ctx: SpeakContext) -> Result<DmReply, SessionError> {
        self.expect_playing()?;
        let history = self.log.render_markdown();
        let reveal = self.game.end_game(&history, ctx).await;
        self.push_dm_reply(&reveal);
        self.state = SessionState::Finished;
        log::info!("session {} finished", self.id);
        Ok(reveal)
    }

    /// The chapter texts the given user's character may currently read.
    pub fn script_excerpt(&self, user_id: &str) -> Result<Vec<String>, SessionError> {
        let character = self
            .players
            .get(user_id)
            .ok_or_else(|| SessionError::UnknownCharacter(user_id.to_string()))?;
        Ok(self
            .game
            .script()
            .visible_chapters(character, self.game.current_chapter()))
    }

    // Keeps only questions aimed at real cast members other than the
    // speaker, in cast order.
    fn filter_queries(
        &self,
        speaker: &str,
        queries: HashMap<String, String>,
    ) -> Vec<(String, String)> {
        self.game
            .script()
            .characters
            .iter()
            .filter(|target| target.as_str() != speaker)
            .filter_map(|target| {
                queries
                    .get(target)
                    .map(|question| (target.clone(), question.clone()))
            })
            .collect()
    }

    async fn resolve_queries(
        &mut self,
        asker: &str,
        queries: Vec<(String, String)>,
    ) -> Vec<ResolvedAnswer> {
        let mut answers = Vec::new();
        for (target, question) in queries {
            if !self.ai_players.contains_key(&target) {
                // A human seat answers on their own time via submit_answer.
                continue;
            }
            match self.ai_answer(asker, &target, &question).await {
                Ok(answer) => answers.push(ResolvedAnswer {
                    asker: asker.to_string(),
                    target,
                    answer,
                }),
                Err(e) => log::warn!("answer from '{target}' failed: {e}"),
            }
        }
        answers
    }

    fn push_speak(&mut self, speaker: &str, content: &str, queries: Vec<(String, String)>) {
        self.push_record(
            speaker,
            content,
            queries.into_iter().collect(),
            None,
            ActionKind::Speak,
        );
    }

    fn push_answer(&mut self, speaker: &str, asker: &str, content: &str) {
        self.push_record(
            speaker,
            content,
            HashMap::new(),
            Some(asker.to_string()),
            ActionKind::Answer,
        );
    }

    fn push_dm_reply(&mut self, reply: &DmReply) {
        let mut content = reply.speech.clone();
        for tool in &reply.tools {
            match tool {
                ToolOutcome::ShowClue {
                    success: true,
                    description: Some(description),
                    ..
                } => {
                    content.push_str(&format!("\n\n*A clue is revealed: {description}*"));
                }
                ToolOutcome::ShowCharacter {
                    success: true,
                    name,
                    ..
                } => {
                    content.push_str(&format!("\n\n*{name}'s portrait is shown.*"));
                }
                _ => {}
            }
        }
        self.push_record("DM", &content, HashMap::new(), None, ActionKind::Dm);
    }

    fn push_record(
        &mut self,
        speaker: &str,
        content: &str,
        queries: HashMap<String, String>,
        reply_to: Option<String>,
        kind: ActionKind,
    ) {
        self.log.push(ActionRecord {
            speaker: speaker.to_string(),
            content: content.to_string(),
            queries,
            reply_to,
            chapter: self.game.current_chapter(),
            cycle: self.cycle,
            kind,
            timestamp: chrono::Local::now(),
        });
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                expected: expected.as_str().to_string(),
                actual: self.state.as_str().to_string(),
            })
        }
    }

    fn expect_playing(&self) -> Result<(), SessionError> {
        self.expect_state(SessionState::Playing)
    }
}

/// In-memory registry of live sessions, keyed by session id.
pub struct SessionStore<C, I> {
    sessions: HashMap<String, GameSession<C, I>>,
}

impl<C, I> Default for SessionStore<C, I> {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }
}

impl<C: Completer + Clone, I: ImageBackend> SessionStore<C, I> {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Registers a session and returns its id.
    pub fn insert(&mut self, session: GameSession<C, I>) -> String {
        let id = session.id().to_string();
        self.sessions.insert(id.clone(), session);
        id
    }

    pub fn get(&self, id: &str) -> Result<&GameSession<C, I>, SessionError> {
        self.sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut GameSession<C, I>, SessionError> {
        self.sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub fn remove(&mut self, id: &str) -> Result<GameSession<C, I>, SessionError> {
        self.sessions
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
