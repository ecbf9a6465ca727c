//! Collaborators behind the gate: embeddings, vector search, chat
//! completion, durable document metadata and tweet lookup.
//!
//! Handlers only see the traits, so tests can swap in the in-memory
//! implementations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ranker::RetrievalMatch;
use crate::session::Turn;

pub mod memory;
pub mod openai;
pub mod pinecone;
pub mod sqlite;
pub mod x;

pub use memory::{MemoryDocumentStore, MemoryVectorIndex};
pub use openai::OpenAiClient;
pub use pinecone::PineconeIndex;
pub use sqlite::SqliteDocumentStore;
pub use x::{tweet_id_from_url, XApiClient};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{service}: request failed: {message}")]
    Transport { service: &'static str, message: String },

    #[error("{service}: upstream returned status {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{service}: unexpected reply: {message}")]
    Decode { service: &'static str, message: String },
}

impl ServiceError {
    pub(crate) fn transport(service: &'static str, err: impl std::fmt::Display) -> Self {
        ServiceError::Transport {
            service,
            message: err.to_string(),
        }
    }

    pub(crate) fn decode(service: &'static str, message: impl Into<String>) -> Self {
        ServiceError::Decode {
            service,
            message: message.into(),
        }
    }

    /// Map a non-success reply to [`ServiceError::Status`], passing successes through.
    pub(crate) async fn check(
        service: &'static str,
        resp: reqwest::Response,
    ) -> Result<reqwest::Response, ServiceError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let mut body = resp.text().await.unwrap_or_default();
        if body.len() > 512 {
            let cut = (0..=512).rev().find(|&i| body.is_char_boundary(i)).unwrap_or(0);
            body.truncate(cut);
        }
        Err(ServiceError::Status {
            service,
            status: status.as_u16(),
            body,
        })
    }
}

/// Metadata stored next to each vector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub text: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: VectorMetadata,
}

/// Durable record of one saved item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SavedDocument {
    pub user_id: String,
    pub vector_id: String,
    pub data_type: String,
    pub data_value: String,
    pub chunk_index: u32,
    pub created_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError>;
}

#[async_trait::async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, record: VectorRecord) -> Result<(), ServiceError>;

    /// Nearest `top_k` vectors owned by `owner`.
    async fn query(&self, owner: &str, vector: &[f32], top_k: usize) -> Result<Vec<RetrievalMatch>, ServiceError>;
}

#[async_trait::async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[Turn]) -> Result<String, ServiceError>;
}

#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Persist `doc`, returning its storage id.
    async fn record(&self, doc: SavedDocument) -> Result<String, ServiceError>;

    async fn ping(&self) -> Result<(), ServiceError>;
}

#[async_trait::async_trait]
pub trait TweetSource: Send + Sync {
    /// Text of the tweet with numeric id `tweet_id`.
    async fn tweet_text(&self, tweet_id: &str) -> Result<String, ServiceError>;
}

/// The collaborator set handed to the route handlers.
#[derive(Clone)]
pub struct Services {
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub chat: Arc<dyn ChatModel>,
    pub documents: Arc<dyn DocumentStore>,
    /// `None` when no X API token is configured.
    pub tweets: Option<Arc<dyn TweetSource>>,
}
