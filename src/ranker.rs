//! Dedup and format similarity-search matches into a prompt context block.

use std::collections::HashSet;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// Context text used when the search returned nothing.
pub const NO_RESULTS: &str = "No relevant information found in your saved data.";

/// Matches considered, by descending score, before deduplication.
pub const CANDIDATE_LIMIT: usize = 10;
/// Characters of text forming the dedup key.
pub const DEDUP_KEY_CHARS: usize = 50;
/// Blocks emitted into the context.
pub const CONTEXT_LIMIT: usize = 5;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievalMatch {
    pub id: String,
    pub score: f32,
    pub text: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

fn dedup_key(text: &str) -> &str {
    match text.char_indices().nth(DEDUP_KEY_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Survivors of truncation and dedup, best score first.
///
/// Matches with a NaN or infinite score are dropped. The rest are stably
/// sorted by descending score and cut to [`CANDIDATE_LIMIT`]; of the matches
/// sharing a dedup key only the first, and so best scoring, one is kept.
pub fn select(matches: &[RetrievalMatch]) -> Vec<&RetrievalMatch> {
    let mut ordered: Vec<&RetrievalMatch> = matches.iter().filter(|m| m.score.is_finite()).collect();
    ordered.sort_by(|a, b| b.score.total_cmp(&a.score));
    ordered.truncate(CANDIDATE_LIMIT);

    let mut seen: HashSet<&str> = HashSet::new();
    let mut kept: Vec<&RetrievalMatch> = ordered
        .into_iter()
        .filter(|m| seen.insert(dedup_key(&m.text)))
        .collect();
    kept.truncate(CONTEXT_LIMIT);
    kept
}

/// Render the context block handed to the chat model.
pub fn rank(matches: &[RetrievalMatch]) -> String {
    let kept = select(matches);
    if kept.is_empty() {
        return NO_RESULTS.to_string();
    }
    let mut out = String::new();
    for (i, m) in kept.iter().enumerate() {
        let _ = write!(out, "Result {}: {} (Relevance: {:.2})\n\n", i + 1, m.text, m.score);
    }
    out
}
