use std::time::Duration;

use serde::Deserialize;

use super::{ServiceError, TweetSource};

const SERVICE: &str = "x";

/// Client for the X (Twitter) v2 tweet lookup endpoint.
pub struct XApiClient {
    base_url: String,
    bearer_token: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct TweetReply {
    data: Option<TweetData>,
}

#[derive(Deserialize)]
struct TweetData {
    #[serde(default)]
    text: String,
}

impl XApiClient {
    pub fn new(
        base_url: impl Into<String>,
        bearer_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::transport(SERVICE, e))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: bearer_token.into(),
            client,
        })
    }
}

#[async_trait::async_trait]
impl TweetSource for XApiClient {
    async fn tweet_text(&self, tweet_id: &str) -> Result<String, ServiceError> {
        let resp = self
            .client
            .get(format!("{}/tweets/{}", self.base_url, tweet_id))
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .map_err(|e| ServiceError::transport(SERVICE, e))?;
        let reply: TweetReply = ServiceError::check(SERVICE, resp)
            .await?
            .json()
            .await
            .map_err(|e| ServiceError::decode(SERVICE, e.to_string()))?;
        reply
            .data
            .map(|d| d.text)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ServiceError::decode(SERVICE, "no text found in tweet"))
    }
}

/// Pull the numeric status id out of a tweet link such as
/// `https://x.com/someone/status/1234567890?s=20`.
pub fn tweet_id_from_url(url: &str) -> Option<&str> {
    let mut parts = url.split('/');
    parts.by_ref().find(|p| *p == "status")?;
    let id = parts.next()?;
    let id = id.split(['?', '#']).next().unwrap_or_default();
    (!id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())).then_some(id)
}
