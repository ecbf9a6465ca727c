use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use super::{ChatModel, Embedder, ServiceError};
use crate::session::Turn;

const SERVICE: &str = "openai";

/// Client for an OpenAI-compatible embeddings and chat completions API.
pub struct OpenAiClient {
    base_url: String,
    api_key: String,
    embedding_model: String,
    chat_model: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct EmbeddingReply {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct ChatReply {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        embedding_model: impl Into<String>,
        chat_model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::transport(SERVICE, e))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            embedding_model: embedding_model.into(),
            chat_model: chat_model.into(),
            client,
        })
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, ServiceError> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::transport(SERVICE, e))?;
        ServiceError::check(SERVICE, resp)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ServiceError::decode(SERVICE, e.to_string()))
    }
}

#[async_trait::async_trait]
impl Embedder for OpenAiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        let reply: EmbeddingReply = self
            .post(
                "/embeddings",
                json!({ "model": self.embedding_model, "input": [text] }),
            )
            .await?;
        reply
            .data
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .ok_or_else(|| ServiceError::decode(SERVICE, "no embedding returned"))
    }
}

#[async_trait::async_trait]
impl ChatModel for OpenAiClient {
    async fn complete(&self, messages: &[Turn]) -> Result<String, ServiceError> {
        let messages: Vec<_> = messages
            .iter()
            .map(|t| json!({ "role": t.role.as_str(), "content": t.content }))
            .collect();
        let reply: ChatReply = self
            .post(
                "/chat/completions",
                json!({ "model": self.chat_model, "messages": messages }),
            )
            .await?;
        reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ServiceError::decode(SERVICE, "no completion returned"))
    }
}
