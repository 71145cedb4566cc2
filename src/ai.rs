//! The LLM gateway: one narrow seam between the agents and the network.
//!
//! Everything upstream-facing goes through [`Completer`], so the agents and
//! the whole state machine stay unit-testable with a scripted fake.

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
};
use tokio::time::{Duration, timeout};

use crate::error::AIError;
use crate::settings::Settings;

/// Hard cap on a single chat completion. The upstream client has its own
/// timeouts, but a stuck connection must not stall a game turn forever.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(180);

/// A chat-completion backend. One attempt per call, no retries; callers
/// convert failures into fallback values at the agent boundary.
#[allow(async_fn_in_trait)]
pub trait Completer {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
    ) -> Result<String, AIError>;
}

/// Production gateway over an OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct AiClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl AiClient {
    pub fn new(settings: &Settings) -> Result<Self, AIError> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or(AIError::AuthInvalid)?;
        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(settings.api_base.clone());
        Ok(Self {
            client: Client::with_config(config),
            model: settings.model.clone(),
        })
    }
}

impl Completer for AiClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
    ) -> Result<String, AIError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(temperature)
            .messages([
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system_prompt)
                    .build()
                    .map_err(AIError::from)?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user_prompt)
                    .build()
                    .map_err(AIError::from)?
                    .into(),
            ])
            .build()
            .map_err(AIError::from)?;

        let response = match timeout(COMPLETION_TIMEOUT, self.client.chat().create(request)).await
        {
            Ok(result) => result.map_err(AIError::from)?,
            Err(_) => return Err(AIError::Timeout),
        };

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .map(|content| content.trim().to_string())
            .ok_or(AIError::NoMessageFound)
    }
}
