use dashmap::DashMap;
use parking_lot::RwLock;

use super::{DocumentStore, SavedDocument, ServiceError, VectorIndex, VectorRecord};
use crate::ranker::RetrievalMatch;

/// Document store kept in process memory.
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: DashMap<String, SavedDocument>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn for_user(&self, user_id: &str) -> Vec<SavedDocument> {
        let mut docs: Vec<_> = self
            .docs
            .iter()
            .filter(|d| d.user_id == user_id)
            .map(|d| d.value().clone())
            .collect();
        docs.sort_by_key(|d| d.created_at);
        docs
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn record(&self, doc: SavedDocument) -> Result<String, ServiceError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.docs.insert(id.clone(), doc);
        Ok(id)
    }

    async fn ping(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// Brute-force cosine similarity index for local runs and tests.
#[derive(Default)]
pub struct MemoryVectorIndex {
    records: RwLock<Vec<VectorRecord>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[async_trait::async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, record: VectorRecord) -> Result<(), ServiceError> {
        let mut records = self.records.write();
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        Ok(())
    }

    async fn query(&self, owner: &str, vector: &[f32], top_k: usize) -> Result<Vec<RetrievalMatch>, ServiceError> {
        let mut scored: Vec<RetrievalMatch> = self
            .records
            .read()
            .iter()
            .filter(|r| r.metadata.user_id == owner)
            .map(|r| RetrievalMatch {
                id: r.id.clone(),
                score: cosine(vector, &r.values),
                text: r.metadata.text.clone(),
                kind: Some(r.metadata.kind.clone()),
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::VectorMetadata;

    fn record(id: &str, owner: &str, values: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.into(),
            values,
            metadata: VectorMetadata {
                text: format!("text of {}", id),
                user_id: owner.into(),
                kind: "note".into(),
                timestamp: 0,
            },
        }
    }

    #[tokio::test]
    async fn query_is_owner_scoped_and_ordered() {
        let index = MemoryVectorIndex::new();
        index.upsert(record("a1", "a", vec![1.0, 0.0])).await.unwrap();
        index.upsert(record("a2", "a", vec![0.6, 0.8])).await.unwrap();
        index.upsert(record("b1", "b", vec![1.0, 0.0])).await.unwrap();

        let hits = index.query("a", &[1.0, 0.0], 10).await.unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2"]);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert_eq!(index.query("a", &[1.0, 0.0], 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upsert_replaces_same_id() {
        let index = MemoryVectorIndex::new();
        index.upsert(record("x", "a", vec![1.0])).await.unwrap();
        index.upsert(record("x", "a", vec![2.0])).await.unwrap();
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn documents_are_listed_per_user() {
        let store = MemoryDocumentStore::new();
        for (user, vid) in [("a", "a-1"), ("b", "b-1"), ("a", "a-2")] {
            store
                .record(SavedDocument {
                    user_id: user.into(),
                    vector_id: vid.into(),
                    data_type: "note".into(),
                    data_value: "v".into(),
                    chunk_index: 0,
                    created_at: chrono::Utc::now(),
                })
                .await
                .unwrap();
        }
        assert_eq!(store.len(), 3);
        assert_eq!(store.for_user("a").len(), 2);
    }
}
