//! Two-phase persistence of generated stories.
//!
//! Stories are first committed to a local store, then a validation gate
//! decides whether the run may propagate them to the production store.
//! Both stores are keyed by the story fingerprint and safe to call
//! repeatedly with the same story.

mod local;
mod production;
mod staged;

pub use local::{SqliteStore, StoreTotals};
pub use production::HttpProductionStore;
pub use staged::{
    GateOutcome, LocalImportSummary, PersistenceReport, ProductionPhase, ProductionSummary,
    StagedPersistence, StoryFailure,
};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::state_machine::EpisodeId;
use crate::story::Story;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportOutcome {
    Committed,
    /// The fingerprint was already stored; counted, not an error.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Synced,
    /// Production already held this fingerprint.
    AlreadySynced,
}

/// Local-import status. A sync record is only written inside the import
/// transaction, so every record starts out committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalStatus {
    Committed,
}

impl LocalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LocalStatus::Committed => "committed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "committed" => Some(LocalStatus::Committed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductionStatus {
    Pending,
    Synced,
    Failed,
}

impl ProductionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProductionStatus::Pending => "pending",
            ProductionStatus::Synced => "synced",
            ProductionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProductionStatus::Pending),
            "synced" => Some(ProductionStatus::Synced),
            "failed" => Some(ProductionStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ProductionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-fingerprint persistence state. Production status only moves while
/// `local_status` is committed, so `synced` always implies `committed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub fingerprint: String,
    pub local_status: LocalStatus,
    pub production_status: ProductionStatus,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A stored row whose payload no longer parses as a story.
#[derive(Debug)]
pub struct UnreadableStory {
    pub fingerprint: String,
    pub episode_id: EpisodeId,
    pub error: StoreError,
}

/// Stories waiting for production, plus the rows that could not be read.
#[derive(Debug, Default)]
pub struct PendingSync {
    pub stories: Vec<Story>,
    pub unreadable: Vec<UnreadableStory>,
}

#[allow(async_fn_in_trait)]
pub trait LocalStore {
    async fn import_story(&self, story: &Story) -> Result<ImportOutcome, StoreError>;

    /// Read a committed story back by fingerprint.
    async fn get_story(&self, fingerprint: &str) -> Result<Option<Story>, StoreError>;

    /// Committed stories whose production status is not `synced`. A corrupt
    /// row is reported in `unreadable` and does not fail the listing.
    async fn pending_sync(&self) -> Result<PendingSync, StoreError>;

    async fn sync_record(&self, fingerprint: &str) -> Result<Option<SyncRecord>, StoreError>;

    async fn mark_synced(&self, fingerprint: &str) -> Result<(), StoreError>;

    async fn mark_sync_failed(&self, fingerprint: &str, error: &str) -> Result<(), StoreError>;
}

#[allow(async_fn_in_trait)]
pub trait ProductionStore {
    /// Idempotent upsert keyed by fingerprint.
    async fn upsert_story(&self, story: &Story) -> Result<SyncOutcome, StoreError>;
}
