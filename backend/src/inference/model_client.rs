use async_trait::async_trait;
use reqwest::Client as HttpClient;

use super::models::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ContentPart, MessageContent,
    ProviderErrorBody,
};
use crate::config::{ModelConfig, PromptConfig};

const VISION_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Model configuration error: {0}")]
    Config(String),
    #[error("Model provider error: {0}")]
    Provider(String),
}

impl From<reqwest::Error> for InferenceError {
    fn from(err: reqwest::Error) -> Self {
        InferenceError::Provider(err.to_string())
    }
}

#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Describes the image at `image_url`.
    async fn recognize(&self, image_url: &str) -> Result<String, InferenceError>;
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, text: &str) -> Result<String, InferenceError>;
}

/// Client for an OpenAI-compatible `chat/completions` provider (DashScope compatible mode by default).
#[derive(Clone)]
pub struct ModelClient {
    http_client: HttpClient,
    api_key: String,
    base_url: String,
    vision_model: String,
    chat_model: String,
    persona_prompt: String,
    vision_instruction: String,
}

impl ModelClient {
    pub fn new(config: &ModelConfig, prompts: &PromptConfig) -> Self {
        Self {
            http_client: HttpClient::new(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            vision_model: config.vision_model.clone(),
            chat_model: config.chat_model.clone(),
            persona_prompt: prompts.persona_system_prompt.clone(),
            vision_instruction: prompts.vision_instruction.clone(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn complete(&self, request: ChatCompletionRequest) -> Result<String, InferenceError> {
        if self.api_key.is_empty() {
            return Err(InferenceError::Config(
                "model API key is not configured".to_string(),
            ));
        }

        let response = self
            .http_client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            let detail = match serde_json::from_str::<ProviderErrorBody>(&error_text) {
                Ok(body) => match body.error.code {
                    Some(code) => format!("{} ({}): {}", status, code, body.error.message),
                    None => format!("{}: {}", status, body.error.message),
                },
                Err(_) => format!("{}: {}", status, error_text),
            };
            return Err(InferenceError::Provider(detail));
        }

        let completion: ChatCompletionResponse = response.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                InferenceError::Provider(format!(
                    "model {} returned no completion",
                    request.model
                ))
            })
    }
}

#[async_trait]
impl VisionModel for ModelClient {
    async fn recognize(&self, image_url: &str) -> Result<String, InferenceError> {
        let request = ChatCompletionRequest {
            model: self.vision_model.clone(),
            messages: vec![
                ChatMessage::system(MessageContent::Parts(vec![ContentPart::text(
                    VISION_SYSTEM_PROMPT,
                )])),
                ChatMessage::user(MessageContent::Parts(vec![
                    ContentPart::image_url(image_url),
                    ContentPart::text(self.vision_instruction.clone()),
                ])),
            ],
        };

        log::info!("Requesting image description from {}", self.vision_model);
        let text = self.complete(request).await.inspect_err(|e| {
            log::error!("Image recognition failed for {}: {}", image_url, e);
        })?;
        log::info!("Image described ({} chars)", text.chars().count());
        Ok(text)
    }
}

#[async_trait]
impl ChatModel for ModelClient {
    async fn chat(&self, text: &str) -> Result<String, InferenceError> {
        let request = ChatCompletionRequest {
            model: self.chat_model.clone(),
            messages: vec![
                ChatMessage::system(MessageContent::Text(self.persona_prompt.clone())),
                ChatMessage::user(MessageContent::Text(text.to_string())),
            ],
        };

        let answer = self.complete(request).await.inspect_err(|e| {
            log::error!("Chat completion failed: {}", e);
        })?;
        log::debug!("Chat answer: {}", answer);
        Ok(answer)
    }
}
