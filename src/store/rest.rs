use std::time::Duration;

use serde_json::{json, Value};

use super::{glob_prefix, CacheStore, StoreError};

/// [`CacheStore`] over a Redis-compatible REST endpoint.
///
/// Every command is POSTed to the base URL as a JSON array
/// (`["INCR", "key"]`) with a bearer token; replies are
/// `{"result": ...}` or `{"error": "..."}`.
pub struct RestStore {
    url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl RestStore {
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            token,
            client,
        })
    }

    async fn command(&self, args: Value) -> Result<Value, StoreError> {
        let mut rb = self.client.post(&self.url).json(&args);
        if let Some(tok) = &self.token {
            rb = rb.bearer_auth(tok);
        }
        let resp = rb
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| StoreError::Protocol(format!("unreadable reply (status {}): {}", status, e)))?;
        if let Some(err) = body.get("error").and_then(Value::as_str) {
            return Err(StoreError::Protocol(err.to_string()));
        }
        if !status.is_success() {
            return Err(StoreError::Unavailable(format!("status {}", status)));
        }
        body.get("result")
            .cloned()
            .ok_or_else(|| StoreError::Protocol("reply without result".into()))
    }
}

fn as_int(v: &Value) -> Result<i64, StoreError> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| StoreError::Protocol(format!("non-integer reply {}", n))),
        // some deployments return integers as strings
        Value::String(s) => s
            .parse()
            .map_err(|_| StoreError::Protocol(format!("non-integer reply '{}'", s))),
        other => Err(StoreError::Protocol(format!("unexpected reply {}", other))),
    }
}

#[async_trait::async_trait]
impl CacheStore for RestStore {
    fn backend(&self) -> &'static str {
        "rest"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.command(json!(["GET", key])).await? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Ok(Some(other.to_string())),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let secs = ttl.as_secs().max(1);
        self.command(json!(["SET", key, value, "EX", secs])).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        let n = as_int(&self.command(json!(["INCR", key])).await?)?;
        u64::try_from(n).map_err(|_| StoreError::Protocol(format!("negative counter {}", n)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let secs = ttl.as_secs().max(1);
        Ok(as_int(&self.command(json!(["EXPIRE", key, secs])).await?)? == 1)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let secs = as_int(&self.command(json!(["TTL", key])).await?)?;
        // -2: missing key, -1: no expiry
        Ok((secs >= 0).then(|| Duration::from_secs(secs as u64)))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let keys = match self.command(json!(["KEYS", glob_prefix(prefix)])).await? {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect::<Vec<_>>(),
            Value::Null => Vec::new(),
            other => return Err(StoreError::Protocol(format!("unexpected KEYS reply {}", other))),
        };
        if keys.is_empty() {
            return Ok(0);
        }
        let mut args = vec![Value::from("DEL")];
        args.extend(keys.into_iter().map(Value::from));
        let n = as_int(&self.command(Value::Array(args)).await?)?;
        Ok(n.max(0) as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.command(json!(["PING"])).await.map(|_| ())
    }
}
