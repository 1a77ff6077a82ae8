use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable episode identity: the feed it came from plus the episode GUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpisodeId(String);

impl EpisodeId {
    pub fn new(feed_id: &str, guid: &str) -> Self {
        Self(format!("{}/{}", feed_id.trim(), guid.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EpisodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle status of an episode within a pipeline run.
///
/// `discovered → downloaded → transcribed → generated → imported → synced`,
/// or `failed` from any non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    Discovered,
    Downloaded,
    Transcribed,
    Generated,
    Imported,
    Synced,
    Failed,
}

impl EpisodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, EpisodeStatus::Synced | EpisodeStatus::Failed)
    }

    /// The status reached when the current stage succeeds.
    pub fn successor(self) -> Option<EpisodeStatus> {
        match self {
            EpisodeStatus::Discovered => Some(EpisodeStatus::Downloaded),
            EpisodeStatus::Downloaded => Some(EpisodeStatus::Transcribed),
            EpisodeStatus::Transcribed => Some(EpisodeStatus::Generated),
            EpisodeStatus::Generated => Some(EpisodeStatus::Imported),
            EpisodeStatus::Imported => Some(EpisodeStatus::Synced),
            EpisodeStatus::Synced | EpisodeStatus::Failed => None,
        }
    }
}

impl fmt::Display for EpisodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EpisodeStatus::Discovered => "discovered",
            EpisodeStatus::Downloaded => "downloaded",
            EpisodeStatus::Transcribed => "transcribed",
            EpisodeStatus::Generated => "generated",
            EpisodeStatus::Imported => "imported",
            EpisodeStatus::Synced => "synced",
            EpisodeStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A single unit of work flowing through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: EpisodeId,
    pub title: String,
    pub audio_ref: String,
    pub discovered_at: DateTime<Utc>,
    pub status: EpisodeStatus,
    pub status_history: Vec<EpisodeStatus>,
    pub updated_at: DateTime<Utc>,
}

impl Episode {
    pub fn new(id: EpisodeId, title: String, audio_ref: String, discovered_at: DateTime<Utc>) -> Self {
        Self {
            id,
            title,
            audio_ref,
            discovered_at,
            status: EpisodeStatus::Discovered,
            status_history: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Episode descriptor handed over by the RSS/audio collaborator, with its
/// already-validated transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeInput {
    pub feed_id: String,
    pub guid: String,
    pub title: String,
    #[serde(default)]
    pub audio_ref: String,
    pub discovered_at: DateTime<Utc>,
    pub transcript: String,
}

impl EpisodeInput {
    /// Builds the episode in `transcribed` status, with the collaborator's
    /// stages recorded in its history.
    pub fn into_episode(self) -> (Episode, String) {
        let mut episode = Episode::new(
            EpisodeId::new(&self.feed_id, &self.guid),
            self.title,
            self.audio_ref,
            self.discovered_at,
        );
        episode.status_history = vec![EpisodeStatus::Discovered, EpisodeStatus::Downloaded];
        episode.status = EpisodeStatus::Transcribed;
        (episode, self.transcript)
    }
}
