use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::rate_limit::RateLimitPolicy;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_X_API_BASE_URL: &str = "https://api.x.com/2";

#[derive(Debug, Clone)]
pub struct KeySetConfig {
    pub issuer: String,
    pub jwks_url: String,
    pub stale_after: Duration,
    pub fetch_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Redis server of the shared cache (`REDIS_URL`).
    pub redis_url: Option<String>,
    /// REST endpoint of the shared cache, used when no Redis URL is set.
    pub url: Option<String>,
    pub token: Option<String>,
    pub op_timeout: Duration,
}

/// Which [`crate::store::CacheStore`] a configuration selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheBackend<'a> {
    Redis(&'a str),
    Rest(&'a str),
    Memory,
}

impl CacheConfig {
    pub fn backend(&self) -> CacheBackend<'_> {
        match (self.redis_url.as_deref(), self.url.as_deref()) {
            (Some(redis), _) => CacheBackend::Redis(redis),
            (None, Some(rest)) => CacheBackend::Rest(rest),
            (None, None) => CacheBackend::Memory,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DocumentConfig {
    /// SQLite database holding one row per saved item.
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub embedding_model: String,
    pub chat_model: String,
    pub pinecone_api_key: String,
    pub pinecone_index_host: String,
    pub pinecone_namespace: Option<String>,
    /// Bearer token for the X API; tweet import is refused without it.
    pub x_bearer_token: Option<String>,
    pub x_api_base_url: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub keyset: KeySetConfig,
    pub cache: CacheConfig,
    pub documents: DocumentConfig,
    pub rate_limit: RateLimitPolicy,
    pub admin_api_key: Option<String>,
    pub max_request_bytes: Option<usize>,
    pub search_top_k: usize,
    pub providers: ProviderConfig,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        // compared byte for byte against `iss`, so a trailing slash stays
        let issuer = required("RECALL_ISSUER_URL")?;
        let jwks_url = optional("RECALL_JWKS_URL")
            .unwrap_or_else(|| format!("{}/.well-known/jwks.json", issuer.trim_end_matches('/')));
        let keyset = KeySetConfig {
            issuer,
            jwks_url,
            stale_after: Duration::from_secs(positive("RECALL_KEYSET_STALE_SECS", 1800)?),
            fetch_timeout: Duration::from_millis(positive("RECALL_KEYSET_FETCH_TIMEOUT_MS", 10_000)?),
        };

        let cache = CacheConfig {
            redis_url: optional("REDIS_URL").or_else(|| optional("UPSTASH_REDIS_URL")),
            url: optional("RECALL_CACHE_URL"),
            token: optional("RECALL_CACHE_TOKEN"),
            op_timeout: Duration::from_millis(positive("RECALL_CACHE_TIMEOUT_MS", 2_000)?),
        };

        let documents = DocumentConfig {
            path: PathBuf::from(required("RECALL_DOCUMENTS_PATH")?),
        };

        let rate_limit = RateLimitPolicy {
            max_requests: positive("RECALL_RATE_LIMIT_MAX", 30)?,
            window: Duration::from_secs(positive("RECALL_RATE_LIMIT_WINDOW_SECS", 1800)?),
        };

        let providers = ProviderConfig {
            openai_api_key: required("OPENAI_API_KEY")?,
            openai_base_url: optional("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            embedding_model: optional("RECALL_EMBEDDING_MODEL")
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            chat_model: optional("RECALL_CHAT_MODEL").unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            pinecone_api_key: required("PINECONE_API_KEY")?,
            pinecone_index_host: required("PINECONE_INDEX_HOST")?,
            pinecone_namespace: optional("PINECONE_NAMESPACE"),
            x_bearer_token: optional("X_API_BEARER_TOKEN"),
            x_api_base_url: optional("X_API_BASE_URL").unwrap_or_else(|| DEFAULT_X_API_BASE_URL.to_string()),
            request_timeout: Duration::from_millis(positive("RECALL_UPSTREAM_TIMEOUT_MS", 30_000)?),
        };

        let port = parse_optional_u64("PORT")?.unwrap_or(8080);
        let port = u16::try_from(port).with_context(|| format!("PORT {} is out of range", port))?;

        Ok(Self {
            keyset,
            cache,
            documents,
            rate_limit,
            admin_api_key: optional("RECALL_ADMIN_API_KEY"),
            max_request_bytes: parse_optional_u64("RECALL_MAX_REQUEST_BYTES")?.map(|v| v as usize),
            search_top_k: positive("RECALL_SEARCH_TOP_K", 50)? as usize,
            providers,
            port,
        })
    }
}

fn optional(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(var: &str) -> Result<String> {
    optional(var).ok_or_else(|| anyhow!("{} must be set", var))
}

/// Optional integer that must be at least 1 when given.
fn positive(var: &str, default: u64) -> Result<u64> {
    match parse_optional_u64(var)? {
        Some(0) => Err(anyhow!("{} must be greater than zero", var)),
        Some(v) => Ok(v),
        None => Ok(default),
    }
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}
