//! Route handlers behind the access gate. Each one marshals JSON and calls
//! into the session store, the ranker and the collaborators.

use axum::extract::rejection::{BytesRejection, FailedToBufferBody, JsonRejection};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::auth::AuthenticatedIdentity;
use crate::error::GateError;
use crate::gate::check_admin_key;
use crate::ranker;
use crate::services::{tweet_id_from_url, SavedDocument, VectorMetadata, VectorRecord};
use crate::session::{Role, Turn};
use crate::AppState;

/// Categories reported by `/api/usage`.
pub const USAGE_CATEGORIES: &[&str] = &["save", "save-tweet", "query", "reset-session", "session", "usage"];

const SYSTEM_PROMPT: &str = "You are a second brain for the user. Answer the question based only on the user's saved data provided in the context below. Keep the response concise and relevant.";

const DEFAULT_DATA_TYPE: &str = "text";
const TWEET_DATA_TYPE: &str = "tweet";

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, GateError> {
    match payload {
        Ok(Json(inner)) => Ok(inner),
        Err(JsonRejection::BytesRejection(BytesRejection::FailedToBufferBody(
            FailedToBufferBody::LengthLimitError(_),
        ))) => {
            tracing::warn!("request body exceeded configured limit");
            Err(GateError::PayloadTooLarge)
        }
        Err(other) => Err(GateError::BadRequest(other.body_text())),
    }
}

fn ensure_same_user(claimed: Option<&str>, identity: &AuthenticatedIdentity) -> Result<(), GateError> {
    match claimed {
        Some(user) if user != identity.as_str() => Err(GateError::IdentityMismatch),
        _ => Ok(()),
    }
}

#[derive(Debug, Deserialize)]
pub struct SaveRequest {
    pub text: String,
    #[serde(default)]
    pub selected_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UpsertResponse {
    pub message: &'static str,
    pub text: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub vector_id: String,
    pub timestamp: DateTime<Utc>,
}

pub async fn save(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthenticatedIdentity>,
    payload: Result<Json<SaveRequest>, JsonRejection>,
) -> Result<Json<UpsertResponse>, GateError> {
    let req = json_body(payload)?;
    if req.text.trim().is_empty() {
        return Err(GateError::BadRequest("missing required parameter: text".into()));
    }
    let kind = req
        .selected_type
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_DATA_TYPE.to_string());
    let saved = store_item(&state, identity, req.text, kind, "").await?;
    Ok(Json(saved))
}

/// Embed `text`, upsert it into the owner's index and record it in the
/// document store. A failed document write is logged, not returned.
async fn store_item(
    state: &AppState,
    identity: AuthenticatedIdentity,
    text: String,
    kind: String,
    id_tag: &str,
) -> Result<UpsertResponse, GateError> {
    let embedding = state
        .services
        .embedder
        .embed(&text)
        .await
        .map_err(GateError::upstream("failed to get embedding"))?;

    let now = Utc::now();
    let vector_id = format!(
        "{}-{}{}",
        identity,
        id_tag,
        now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros() * 1000)
    );
    state
        .services
        .index
        .upsert(VectorRecord {
            id: vector_id.clone(),
            values: embedding,
            metadata: VectorMetadata {
                text: text.clone(),
                user_id: identity.to_string(),
                kind: kind.clone(),
                timestamp: now.timestamp(),
            },
        })
        .await
        .map_err(GateError::upstream("failed to store vector"))?;

    let doc = SavedDocument {
        user_id: identity.to_string(),
        vector_id: vector_id.clone(),
        data_type: kind.clone(),
        data_value: text.clone(),
        chunk_index: 0,
        created_at: now,
    };
    if let Err(e) = state.services.documents.record(doc).await {
        // the vector is already searchable, so the save still succeeds
        tracing::warn!(vector_id = %vector_id, error = %e, "failed to record saved document");
    }

    Ok(UpsertResponse {
        message: "Data saved successfully",
        text,
        user_id: identity.into_inner(),
        kind,
        vector_id,
        timestamp: now,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveTweetRequest {
    pub tweet_url: String,
}

/// Import a tweet by link: fetch its text from the X API and save it like
/// any other item, typed `tweet`.
pub async fn save_tweet(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthenticatedIdentity>,
    payload: Result<Json<SaveTweetRequest>, JsonRejection>,
) -> Result<Json<UpsertResponse>, GateError> {
    let req = json_body(payload)?;
    let tweet_id = tweet_id_from_url(req.tweet_url.trim())
        .ok_or_else(|| GateError::BadRequest("invalid tweet URL format".into()))?;
    let tweets = state
        .services
        .tweets
        .as_ref()
        .ok_or(GateError::NotConfigured("X API bearer token"))?;
    let text = tweets
        .tweet_text(tweet_id)
        .await
        .map_err(GateError::upstream("failed to fetch tweet"))?;

    tracing::debug!(identity = %identity, tweet_id, "importing tweet");
    let mut saved = store_item(&state, identity, text, TWEET_DATA_TYPE.to_string(), "tweet-").await?;
    saved.message = "Tweet saved successfully";
    Ok(Json(saved))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub text: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub message: &'static str,
    pub answer: String,
    pub context_text: String,
    pub session_id: String,
    pub session_count: usize,
    pub timestamp: DateTime<Utc>,
}

pub async fn query(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthenticatedIdentity>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, GateError> {
    let req = json_body(payload)?;
    ensure_same_user(req.user_id.as_deref(), &identity)?;
    if req.text.trim().is_empty() {
        return Err(GateError::BadRequest("missing required parameter: text".into()));
    }

    let session_id = state
        .sessions
        .get_or_create(req.session_id.as_deref(), identity.as_str())?;

    let embedding = state
        .services
        .embedder
        .embed(&req.text)
        .await
        .map_err(GateError::upstream("failed to get embedding"))?;
    let matches = state
        .services
        .index
        .query(identity.as_str(), &embedding, state.search_top_k)
        .await
        .map_err(GateError::upstream("failed to query vector index"))?;
    let context_text = ranker::rank(&matches);

    state.sessions.append(&session_id, Role::User, req.text.as_str());

    let mut messages = Vec::with_capacity(crate::session::MAX_TURNS + 1);
    messages.push(Turn::new(
        Role::System,
        format!("{}\nContext from saved data:\n{}", SYSTEM_PROMPT, context_text),
    ));
    messages.extend(state.sessions.history(&session_id));

    let answer = state
        .services
        .chat
        .complete(&messages)
        .await
        .map_err(GateError::upstream("failed to get AI response"))?;

    state.sessions.append(&session_id, Role::Assistant, answer.as_str());
    let session_count = state
        .sessions
        .read(&session_id)
        .map(|s| s.turn_pairs())
        .unwrap_or_default();

    tracing::debug!(identity = %identity, session_id = %session_id, matches = matches.len(), "query answered");

    Ok(Json(QueryResponse {
        message: "Query successful",
        answer,
        context_text,
        session_id,
        session_count,
        timestamp: Utc::now(),
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    #[serde(default)]
    pub user_id: Option<String>,
}

pub async fn reset_session(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthenticatedIdentity>,
    payload: Result<Json<ResetRequest>, JsonRejection>,
) -> Result<Json<Value>, GateError> {
    let req = match payload {
        // a bare POST without a body is a reset for the caller
        Err(JsonRejection::MissingJsonContentType(_)) => ResetRequest::default(),
        other => json_body(other)?,
    };
    ensure_same_user(req.user_id.as_deref(), &identity)?;
    let session_id = state.sessions.get_or_create(None, identity.as_str())?;
    Ok(Json(json!({
        "message": "Session reset successfully",
        "sessionId": session_id,
    })))
}

pub async fn get_session(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthenticatedIdentity>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, GateError> {
    let session = state.sessions.read_owned(&session_id, identity.as_str())?;
    Ok(Json(json!({
        "sessionId": session_id,
        "messageCount": session.messages.len(),
        "messages": session.messages,
        "createdAt": session.created_at,
        "updatedAt": session.updated_at,
    })))
}

pub async fn usage(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthenticatedIdentity>,
) -> Json<Value> {
    let counters = state.limiter.usage(identity.as_str(), USAGE_CATEGORIES).await;
    let mut usage = Map::new();
    for c in counters {
        // -1 marks a counter that could not be read
        let value = c.count.map_or(json!(-1), |n| json!(n));
        usage.insert(c.category, value);
    }
    Json(json!({
        "user_id": identity.as_str(),
        "date": Utc::now().format("%Y-%m-%d").to_string(),
        "usage": usage,
        "limit_per_endpoint": state.limiter.policy().max_requests,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ClearQuery {
    #[serde(rename = "userId", default)]
    pub user_id: Option<String>,
}

pub async fn clear_cache(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ClearQuery>,
) -> Result<Json<Value>, GateError> {
    check_admin_key(&headers, state.admin_api_key.as_deref())?;
    let user_id = params
        .user_id
        .filter(|u| !u.is_empty())
        .ok_or_else(|| GateError::BadRequest("user id required".into()))?;
    let cleared = state
        .limiter
        .clear(&user_id)
        .await
        .map_err(|source| GateError::Store {
            context: "failed to clear rate limit counters",
            source,
        })?;
    Ok(Json(json!({
        "message": format!("cleared rate limit counters for user {}", user_id),
        "keys_cleared": cleared,
    })))
}
