use serde_json;
use thiserror::Error;

// Enum for handling various application-level errors.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("AI error: {:#}", 0)]
    AI(#[from] AIError), // Errors related to AI operations.

    #[error("Game error: {:#}", 0)]
    Game(#[from] GameError), // Errors specific to game logic or state.

    #[error("Session error: {:#}", 0)]
    Session(#[from] SessionError), // Errors raised by the multiplayer session layer.

    #[error("Serialization error: {:#}", 0)]
    Serialization(#[from] serde_json::Error), // Errors related to data serialization.

    #[error("IO error: {:#}", 0)]
    IO(#[from] std::io::Error), // Input/output errors.
}

// Errors related to upstream AI calls. Agents catch these at their boundary
// and convert them into fallback values; they never reach the orchestrator.
#[derive(Debug, Error)]
pub enum AIError {
    #[error("Upstream rate limit reached")]
    RateLimited,

    #[error("Upstream authentication failed")]
    AuthInvalid,

    #[error("Upstream unavailable: {0}")]
    Unavailable(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("No message found")]
    NoMessageFound, // The completion came back without any content.

    #[error("Unknown AI error: {:#}", 0)]
    Unknown(String),
}

impl AIError {
    // Classification used by the From<OpenAIError> impl, split out so the
    // string heuristics stay unit-testable without constructing API errors.
    pub(crate) fn classify_api_error(kind: Option<&str>, message: &str) -> AIError {
        let kind = kind.unwrap_or_default().to_ascii_lowercase();
        let lowered = message.to_ascii_lowercase();
        if kind.contains("rate_limit") || lowered.contains("rate limit") {
            AIError::RateLimited
        } else if kind.contains("auth")
            || kind.contains("invalid_api_key")
            || lowered.contains("api key")
            || lowered.contains("unauthorized")
        {
            AIError::AuthInvalid
        } else {
            AIError::Upstream(message.to_string())
        }
    }

    /// In-character notice shown in the transcript when an upstream call
    /// fails. The session must always receive a usable string, never a crash.
    pub fn player_facing(&self) -> String {
        match self {
            AIError::RateLimited => {
                "**[The host pauses]** The spirits are overwhelmed; give them a moment and try again.".into()
            }
            AIError::AuthInvalid => {
                "**[The host frowns]** The invitation seems to be invalid. Check the API credentials.".into()
            }
            AIError::Unavailable(_) | AIError::Timeout => {
                "**[The host falls silent]** The connection to the beyond was lost. Try again shortly.".into()
            }
            other => format!("**[The host hesitates]** Something went wrong: {other}"),
        }
    }
}

impl From<async_openai::error::OpenAIError> for AIError {
    fn from(err: async_openai::error::OpenAIError) -> Self {
        use async_openai::error::OpenAIError;
        match err {
            OpenAIError::ApiError(api) => {
                AIError::classify_api_error(api.r#type.as_deref(), &api.message)
            }
            OpenAIError::Reqwest(e) => AIError::Unavailable(e.to_string()),
            other => AIError::Unknown(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for AIError {
    fn from(err: reqwest::Error) -> Self {
        AIError::Unavailable(err.to_string())
    }
}

// Enum for game-specific errors.
#[derive(Debug, Error)]
pub enum GameError {
    #[error("Invalid script: {:#}", 0)]
    InvalidScript(String), // A loaded or generated script misses required parts.

    #[error("Malformed model output: {:#}", 0)]
    MalformedModelOutput(String), // The model produced text no repair path could use.

    #[error("Resource not found: {:#}", 0)]
    ResourceNotFound(String), // Clue or character reference out of range.

    #[error("A question and an asking character are required")]
    MissingQueryContext, // response() called without a concrete question/asker.
}

// Session-level errors are reported to the caller as rejected operations,
// not silently absorbed.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {:#}", 0)]
    NotFound(String),

    #[error("Character already claimed: {:#}", 0)]
    CharacterTaken(String),

    #[error("Unknown character: {:#}", 0)]
    UnknownCharacter(String),

    #[error("Invalid session state: expected {expected}, was {actual}")]
    InvalidState { expected: String, actual: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_classification() {
        assert!(matches!(
            AIError::classify_api_error(Some("rate_limit_exceeded"), "Too many requests"),
            AIError::RateLimited
        ));
        assert!(matches!(
            AIError::classify_api_error(None, "You exceeded your rate limit"),
            AIError::RateLimited
        ));
        assert!(matches!(
            AIError::classify_api_error(Some("invalid_api_key"), "bad key"),
            AIError::AuthInvalid
        ));
        assert!(matches!(
            AIError::classify_api_error(None, "Incorrect API key provided"),
            AIError::AuthInvalid
        ));
        assert!(matches!(
            AIError::classify_api_error(Some("server_error"), "boom"),
            AIError::Upstream(_)
        ));
    }

    #[test]
    fn player_facing_is_always_markdown() {
        for err in [
            AIError::RateLimited,
            AIError::AuthInvalid,
            AIError::Timeout,
            AIError::Unknown("x".into()),
        ] {
            assert!(err.player_facing().starts_with("**["));
        }
    }
}
