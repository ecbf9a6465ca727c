#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{routing::get, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::SigningKey;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde_json::{json, Value};

use recall_gate::auth::{HttpKeySource, KeyCache, RefreshPolicy, TokenVerifier};
use recall_gate::rate_limit::{RateLimitPolicy, RateLimiter};
use recall_gate::services::{
    ChatModel, DocumentStore, Embedder, MemoryDocumentStore, MemoryVectorIndex, SavedDocument, ServiceError, Services,
    TweetSource,
};
use recall_gate::session::{SessionStore, Turn};
use recall_gate::store::{CacheStore, MemoryStore, StoreError};
use recall_gate::{AppState, GateMetrics};

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

const PKCS8_ED25519_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04, 0x20,
];

/// Fixed-seed Ed25519 signing key published under `kid`.
pub struct TestKey {
    pub kid: String,
    signing: SigningKey,
}

impl TestKey {
    pub fn new(seed: u8, kid: &str) -> Self {
        Self {
            kid: kid.to_string(),
            signing: SigningKey::from_bytes(&[seed; 32]),
        }
    }

    pub fn jwk(&self) -> Value {
        json!({
            "kty": "OKP",
            "crv": "Ed25519",
            "x": URL_SAFE_NO_PAD.encode(self.signing.verifying_key().to_bytes()),
            "kid": self.kid,
            "alg": "EdDSA",
            "use": "sig",
        })
    }

    pub fn sign(&self, claims: &Value) -> String {
        let mut der = PKCS8_ED25519_PREFIX.to_vec();
        der.extend_from_slice(&self.signing.to_bytes());
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, claims, &EncodingKey::from_ed_der(&der)).unwrap()
    }

    pub fn token(&self, issuer: &str, sub: &str, exp_in: i64) -> String {
        self.sign(&json!({
            "sub": sub,
            "iss": issuer,
            "exp": chrono::Utc::now().timestamp() + exp_in,
        }))
    }
}

pub fn jwks_for(keys: &[&TestKey]) -> String {
    json!({ "keys": keys.iter().map(|k| k.jwk()).collect::<Vec<_>>() }).to_string()
}

/// Token with arbitrary header and a junk signature.
pub fn forge(header: &Value, claims: &Value) -> String {
    format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string()),
        URL_SAFE_NO_PAD.encode(b"sig"),
    )
}

/// Identity provider stand-in serving `/.well-known/jwks.json`.
pub struct IssuerServer {
    pub issuer: String,
    doc: Arc<Mutex<String>>,
    hits: Arc<AtomicUsize>,
    down: Arc<AtomicBool>,
}

impl IssuerServer {
    pub async fn start(doc: String) -> Self {
        let doc = Arc::new(Mutex::new(doc));
        let hits = Arc::new(AtomicUsize::new(0));
        let down = Arc::new(AtomicBool::new(false));
        let (d, h, f) = (doc.clone(), hits.clone(), down.clone());
        let app = Router::new().route(
            "/.well-known/jwks.json",
            get(move || {
                let (d, h, f) = (d.clone(), h.clone(), f.clone());
                async move {
                    h.fetch_add(1, Ordering::SeqCst);
                    if f.load(Ordering::SeqCst) {
                        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                    }
                    let body = d.lock().clone();
                    ([(axum::http::header::CONTENT_TYPE, "application/json")], body).into_response()
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            issuer: format!("http://{}", addr),
            doc,
            hits,
            down,
        }
    }

    pub fn jwks_url(&self) -> String {
        format!("{}/.well-known/jwks.json", self.issuer)
    }

    pub fn serve(&self, doc: String) {
        *self.doc.lock() = doc;
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Deterministic bag-of-bytes embedding; equal texts embed identically.
pub struct HashEmbedder;

#[async_trait::async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        let mut v = vec![0.0f32; 16];
        for (i, b) in text.bytes().enumerate() {
            v[(b as usize + i) % 16] += 1.0;
        }
        Ok(v)
    }
}

/// Chat model that records the prompts it receives.
#[derive(Default)]
pub struct RecordingChat {
    pub calls: Mutex<Vec<Vec<Turn>>>,
}

#[async_trait::async_trait]
impl ChatModel for RecordingChat {
    async fn complete(&self, messages: &[Turn]) -> Result<String, ServiceError> {
        let mut calls = self.calls.lock();
        calls.push(messages.to_vec());
        Ok(format!("answer {} ({} messages)", calls.len(), messages.len()))
    }
}

pub struct FailingDocuments;

#[async_trait::async_trait]
impl DocumentStore for FailingDocuments {
    fn backend(&self) -> &'static str {
        "failing"
    }

    async fn record(&self, _doc: SavedDocument) -> Result<String, ServiceError> {
        Err(ServiceError::Transport {
            service: "documents",
            message: "connection refused".into(),
        })
    }

    async fn ping(&self) -> Result<(), ServiceError> {
        Err(ServiceError::Transport {
            service: "documents",
            message: "connection refused".into(),
        })
    }
}

/// Tweets keyed by id; unknown ids answer like the X API's 404.
#[derive(Default)]
pub struct StaticTweets {
    pub texts: HashMap<String, String>,
    pub lookups: AtomicUsize,
}

impl StaticTweets {
    pub fn with(entries: &[(&str, &str)]) -> Self {
        Self {
            texts: entries.iter().map(|(id, text)| (id.to_string(), text.to_string())).collect(),
            lookups: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl TweetSource for StaticTweets {
    async fn tweet_text(&self, tweet_id: &str) -> Result<String, ServiceError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.texts.get(tweet_id).cloned().ok_or(ServiceError::Status {
            service: "x",
            status: 404,
            body: "Not Found".into(),
        })
    }
}

/// Counter store whose every call fails.
pub struct DownStore;

#[async_trait::async_trait]
impl CacheStore for DownStore {
    fn backend(&self) -> &'static str {
        "down"
    }
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn incr(&self, _key: &str) -> Result<u64, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn ttl(&self, _key: &str) -> Result<Option<Duration>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn delete_prefix(&self, _prefix: &str) -> Result<u64, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn ping(&self) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

/// Handles to the in-memory collaborators behind a test [`AppState`].
pub struct Harness {
    pub state: AppState,
    pub index: Arc<MemoryVectorIndex>,
    pub chat: Arc<RecordingChat>,
    pub documents: Arc<MemoryDocumentStore>,
}

pub struct HarnessOptions {
    pub store: Arc<dyn CacheStore>,
    pub policy: RateLimitPolicy,
    pub admin_api_key: Option<&'static str>,
    pub documents: Option<Arc<dyn DocumentStore>>,
    pub max_request_bytes: Option<usize>,
    pub refresh: RefreshPolicy,
    pub tweets: Option<Arc<dyn TweetSource>>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            policy: RateLimitPolicy {
                max_requests: 100,
                window: Duration::from_secs(1800),
            },
            admin_api_key: Some("admin-secret"),
            documents: None,
            max_request_bytes: None,
            refresh: RefreshPolicy::default(),
            tweets: None,
        }
    }
}

pub async fn harness(issuer: &IssuerServer, opts: HarnessOptions) -> Harness {
    let source = HttpKeySource::new(issuer.jwks_url(), Duration::from_secs(2)).unwrap();
    let keys = Arc::new(KeyCache::new(
        Arc::new(source),
        Some(opts.store.clone()),
        opts.refresh,
        Duration::from_millis(500),
    ));
    let _ = keys.load().await;

    let index = Arc::new(MemoryVectorIndex::new());
    let chat = Arc::new(RecordingChat::default());
    let documents = Arc::new(MemoryDocumentStore::new());
    let document_store: Arc<dyn DocumentStore> = match opts.documents {
        Some(store) => store,
        None => documents.clone(),
    };
    let services = Services {
        embedder: Arc::new(HashEmbedder),
        index: index.clone(),
        chat: chat.clone(),
        documents: document_store,
        tweets: opts.tweets,
    };

    let state = AppState {
        verifier: Arc::new(TokenVerifier::new(keys, issuer.issuer.clone())),
        limiter: Arc::new(RateLimiter::new(opts.store.clone(), opts.policy, Duration::from_millis(500))),
        sessions: Arc::new(SessionStore::new()),
        services,
        cache: opts.store,
        cache_timeout: Duration::from_millis(500),
        admin_api_key: opts.admin_api_key.map(Arc::from),
        max_request_bytes: opts.max_request_bytes,
        search_top_k: 50,
        metrics: Arc::new(GateMetrics::default()),
    };
    Harness {
        state,
        index,
        chat,
        documents,
    }
}

/// Serve `state` on an ephemeral port and return the base URL.
pub async fn spawn_app(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = recall_gate::app(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}
