pub mod agent_log;
pub mod ai;
pub mod ai_response;
pub mod chat;
pub mod dm;
pub mod error;
pub mod game;
pub mod imager;
pub mod logging;
pub mod player;
pub mod script;
pub mod session;
pub mod settings;

// Re-export commonly used items for easier access
pub use ai::{AiClient, Completer};
pub use ai_response::{DmSpeech, Parsed, PlayerTurn, ToolCommand};
pub use chat::{ActionKind, ActionLog, ActionRecord};
pub use dm::{DmAgent, DmReply, SpeakContext, SpeakMode, ToolOutcome};
pub use error::{AIError, AppError, GameError, SessionError};
pub use game::Game;
pub use imager::{ImageBackend, ImageJobClient, ImageOutcome, NullImageBackend};
pub use player::PlayerAgent;
pub use script::{GameManifest, Script};
pub use session::{GameSession, SessionState, SessionStore};
pub use settings::Settings;
