use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use super::{ServiceError, VectorIndex, VectorMetadata, VectorRecord};
use crate::ranker::RetrievalMatch;

const SERVICE: &str = "pinecone";

/// Data-plane client for a Pinecone-compatible index host.
pub struct PineconeIndex {
    host: String,
    api_key: String,
    namespace: Option<String>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct QueryReply {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Deserialize)]
struct QueryMatch {
    id: String,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl PineconeIndex {
    pub fn new(
        host: &str,
        api_key: impl Into<String>,
        namespace: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let host = host.trim_end_matches('/');
        let host = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{}", host)
        };
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::transport(SERVICE, e))?;
        Ok(Self {
            host,
            api_key: api_key.into(),
            namespace,
            client,
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.host, path))
            .header("Api-Key", &self.api_key)
    }
}

fn match_from_reply(m: QueryMatch) -> Option<RetrievalMatch> {
    let metadata = m.metadata?;
    // vectors saved without text cannot contribute context
    let text = metadata.get("text")?.as_str()?.to_string();
    let kind = metadata
        .get("type")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Some(RetrievalMatch {
        id: m.id,
        score: m.score,
        text,
        kind,
    })
}

#[async_trait::async_trait]
impl VectorIndex for PineconeIndex {
    async fn upsert(&self, record: VectorRecord) -> Result<(), ServiceError> {
        let VectorRecord { id, values, metadata } = record;
        let VectorMetadata {
            text,
            user_id,
            kind,
            timestamp,
        } = metadata;
        let mut body = json!({
            "vectors": [{
                "id": id,
                "values": values,
                "metadata": {
                    "text": text,
                    "user_id": user_id,
                    "type": kind,
                    "timestamp": timestamp,
                },
            }]
        });
        if let Some(ns) = &self.namespace {
            body["namespace"] = json!(ns);
        }
        let resp = self
            .request("/vectors/upsert")
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::transport(SERVICE, e))?;
        ServiceError::check(SERVICE, resp).await?;
        Ok(())
    }

    async fn query(&self, owner: &str, vector: &[f32], top_k: usize) -> Result<Vec<RetrievalMatch>, ServiceError> {
        let mut body = json!({
            "vector": vector,
            "topK": top_k,
            "includeMetadata": true,
            "filter": { "user_id": { "$eq": owner } },
        });
        if let Some(ns) = &self.namespace {
            body["namespace"] = json!(ns);
        }
        let resp = self
            .request("/query")
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::transport(SERVICE, e))?;
        let reply: QueryReply = ServiceError::check(SERVICE, resp)
            .await?
            .json()
            .await
            .map_err(|e| ServiceError::decode(SERVICE, e.to_string()))?;
        Ok(reply.matches.into_iter().filter_map(match_from_reply).collect())
    }
}
