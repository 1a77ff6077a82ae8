//! Generated stories: parsing raw model output, content fingerprints and the
//! quality rubric.
//!
//! A [`Story`] is immutable once created. Its fingerprint is a SHA-256 over the
//! canonicalized title, body and source episode and is the deduplication key in
//! both stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::assigner::Strategy;
use crate::state_machine::EpisodeId;

/// Root keys a story collection may be returned under, in priority order.
const COLLECTION_KEYS: &[&str] = &[
    "investing-dojo-stories",
    "stories",
    "newsletter_content",
    "content",
    "articles",
];

const REQUIRED_FIELDS: &[&str] = &["id", "title", "summary", "full_content", "content_type"];
const ENHANCED_FIELDS: &[&str] = &["actionable_practices", "discussion_prompts", "belt_levels"];
const FAMILY_FIELDS: &[&str] = &["family_security_relevance", "children_education_angle"];

/// Keys the pipeline computes itself. Model output using them is kept under
/// a `model_` prefix so the flattened payload never repeats a key.
const COMPUTED_FIELDS: &[&str] = &["source", "fingerprint", "quality_score"];

/// Why a raw model response is not a usable story collection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedOutput {
    #[error("response is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("no story collection found under a known root key")]
    MissingCollection,

    #[error("story collection is not a list")]
    NotAList,

    #[error("no valid stories in collection ({dropped} dropped)")]
    NoValidStories { dropped: usize },
}

/// Where a story came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorySource {
    pub episode_id: EpisodeId,
    pub episode_title: String,
    pub strategy: Strategy,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub full_content: String,
    pub content_type: String,
    pub source: StorySource,
    pub fingerprint: String,
    pub quality_score: f64,
    /// Every other field the model produced, forwarded untouched to the stores.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Story {
    /// Build a story from one JSON object, or `None` if a required field is
    /// missing or not a string.
    fn from_object(mut obj: Map<String, Value>, source: &StorySource) -> Option<Self> {
        let mut take = |key: &str| match obj.remove(key)? {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        };
        let id = take("id")?;
        let title = take("title")?;
        let summary = take("summary")?;
        let full_content = take("full_content")?;
        let content_type = take("content_type")?;
        for key in COMPUTED_FIELDS {
            if let Some(value) = obj.remove(*key) {
                debug!(field = *key, "renaming model-provided field");
                obj.entry(format!("model_{key}")).or_insert(value);
            }
        }

        let mut story = Story {
            fingerprint: fingerprint(&title, &full_content, source.episode_id.as_str()),
            id,
            title,
            summary,
            full_content,
            content_type,
            source: source.clone(),
            quality_score: 0.0,
            extra: obj,
        };
        story.quality_score = quality_score(&story);
        Some(story)
    }

    fn has_field(&self, name: &str) -> bool {
        match name {
            "id" => !self.id.trim().is_empty(),
            "title" => !self.title.trim().is_empty(),
            "summary" => !self.summary.trim().is_empty(),
            "full_content" => !self.full_content.trim().is_empty(),
            "content_type" => !self.content_type.trim().is_empty(),
            other => self.extra.get(other).is_some_and(is_truthy),
        }
    }
}

// Mirrors "non-empty" for JSON values: null, "", [], {} and false count as absent.
fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Number(_) => true,
    }
}

fn canonicalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Content-derived dedup key: SHA-256 over canonicalized title, body and source.
pub fn fingerprint(title: &str, body: &str, source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonicalize(title).as_bytes());
    hasher.update(b"\n");
    hasher.update(canonicalize(body).as_bytes());
    hasher.update(b"\n");
    hasher.update(source.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic 0-10 rubric. Used for metrics only, never for rejection.
pub fn quality_score(story: &Story) -> f64 {
    let mut score = 0.0;

    if REQUIRED_FIELDS.iter().all(|f| story.has_field(f)) {
        score += 3.0;
    }

    let length = story.full_content.chars().count();
    if length > 1000 {
        score += 2.0;
    } else if length > 500 {
        score += 1.0;
    }

    let enhanced = ENHANCED_FIELDS.iter().filter(|f| story.has_field(f)).count();
    score += enhanced as f64 / ENHANCED_FIELDS.len() as f64 * 2.0;

    let family = FAMILY_FIELDS.iter().filter(|f| story.has_field(f)).count();
    score += family as f64 / FAMILY_FIELDS.len() as f64 * 2.0;

    if REQUIRED_FIELDS.len() + story.extra.len() > 10 {
        score += 1.0;
    }

    score.min(10.0)
}

/// Mean quality of a story set; 0.0 for an empty set.
pub fn mean_quality(stories: &[Story]) -> f64 {
    if stories.is_empty() {
        return 0.0;
    }
    stories.iter().map(|s| s.quality_score).sum::<f64>() / stories.len() as f64
}

/// Remove Markdown code fences the model sometimes wraps JSON in.
fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.trim_end().strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

/// Parse raw model output into a well-formed story collection.
///
/// Individual stories missing a required field are dropped; a collection
/// with no valid story left is malformed.
pub fn parse_story_collection(raw: &str, source: &StorySource) -> Result<Vec<Story>, MalformedOutput> {
    let cleaned = strip_code_fences(raw);
    let value: Value =
        serde_json::from_str(cleaned).map_err(|e| MalformedOutput::InvalidJson(e.to_string()))?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut root) => {
            let key = COLLECTION_KEYS
                .iter()
                .find(|k| root.contains_key(**k))
                .ok_or(MalformedOutput::MissingCollection)?;
            debug!(key = *key, "found story collection");
            match root.remove(*key) {
                Some(Value::Array(items)) => items,
                _ => return Err(MalformedOutput::NotAList),
            }
        }
        _ => return Err(MalformedOutput::MissingCollection),
    };

    let total = items.len();
    let stories: Vec<Story> = items
        .into_iter()
        .enumerate()
        .filter_map(|(i, item)| {
            let parsed = match item {
                Value::Object(obj) => Story::from_object(obj, source),
                _ => None,
            };
            if parsed.is_none() {
                warn!(index = i + 1, episode_id = %source.episode_id, "dropping story with missing required fields");
            }
            parsed
        })
        .collect();

    if stories.is_empty() {
        return Err(MalformedOutput::NoValidStories { dropped: total });
    }
    Ok(stories)
}
