use serde::Serialize;
use tracing::{error, info, warn};

use super::{ImportOutcome, LocalStore, ProductionStatus, ProductionStore, SyncOutcome};
use crate::config::PersistenceConfig;
use crate::error::{ErrorKind, StoreError};
use crate::state_machine::EpisodeId;
use crate::story::Story;

/// A single story that failed in either phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoryFailure {
    pub fingerprint: String,
    pub episode_id: EpisodeId,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LocalImportSummary {
    pub committed: Vec<String>,
    pub duplicates: Vec<String>,
    pub errors: Vec<StoryFailure>,
    /// Errors from the store itself rather than from one story.
    pub critical_errors: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateOutcome {
    pub passed: bool,
    pub committed: usize,
    pub required: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProductionSummary {
    pub attempted: usize,
    pub synced: Vec<String>,
    pub already_synced: Vec<String>,
    pub errors: Vec<StoryFailure>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProductionPhase {
    /// The local gate did not pass; nothing was attempted.
    Skipped { reason: String },
    /// Production sync is turned off in the configuration.
    Disabled,
    Completed(ProductionSummary),
}

impl ProductionPhase {
    pub fn summary(&self) -> Option<&ProductionSummary> {
        match self {
            ProductionPhase::Completed(summary) => Some(summary),
            _ => None,
        }
    }

    pub fn attempted(&self) -> usize {
        self.summary().map_or(0, |s| s.attempted)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PersistenceReport {
    pub local: LocalImportSummary,
    pub gate: GateOutcome,
    pub production: ProductionPhase,
}

/// Local import, validation gate, then production sync.
pub struct StagedPersistence<'a, L, P> {
    local: &'a L,
    production: Option<&'a P>,
    min_stories: usize,
    validation_checks: bool,
}

impl<'a, L: LocalStore, P: ProductionStore> StagedPersistence<'a, L, P> {
    /// `production` is `None` when syncing is disabled.
    pub fn new(local: &'a L, production: Option<&'a P>, config: &PersistenceConfig) -> Self {
        Self {
            local,
            production,
            min_stories: config.min_stories_for_sync,
            validation_checks: config.validation_checks,
        }
    }

    pub async fn run(&self, stories: &[Story]) -> PersistenceReport {
        let local = self.import(stories).await;
        let gate = self.validate(&local).await;

        let production = if !gate.passed {
            let reason = gate.reason.clone().unwrap_or_default();
            warn!(%reason, "validation gate closed, skipping production sync");
            ProductionPhase::Skipped { reason }
        } else if self.production.is_none() {
            info!("production sync disabled");
            ProductionPhase::Disabled
        } else {
            match self.sync().await {
                Ok(summary) => ProductionPhase::Completed(summary),
                Err(e) => {
                    error!(error = %e, "could not list stories pending production sync");
                    ProductionPhase::Skipped {
                        reason: format!("pending stories unavailable: {e}"),
                    }
                }
            }
        };

        PersistenceReport {
            local,
            gate,
            production,
        }
    }

    /// Phase 1: import every story into the local store.
    pub async fn import(&self, stories: &[Story]) -> LocalImportSummary {
        let mut summary = LocalImportSummary::default();
        for story in stories {
            match self.local.import_story(story).await {
                Ok(ImportOutcome::Committed) => summary.committed.push(story.fingerprint.clone()),
                Ok(ImportOutcome::Duplicate) => summary.duplicates.push(story.fingerprint.clone()),
                Err(e) => {
                    if e.is_critical() {
                        summary.critical_errors += 1;
                        error!(fingerprint = %story.fingerprint, error = %e, "local store failure");
                    } else {
                        warn!(fingerprint = %story.fingerprint, error = %e, "story rejected locally");
                    }
                    summary.errors.push(failure(story, ErrorKind::LocalImportError, &e));
                }
            }
        }
        info!(
            committed = summary.committed.len(),
            duplicates = summary.duplicates.len(),
            errors = summary.errors.len(),
            "local import finished"
        );
        summary
    }

    /// The gate between the phases.
    pub async fn validate(&self, summary: &LocalImportSummary) -> GateOutcome {
        let committed = summary.committed.len();
        let closed = |reason: String| GateOutcome {
            passed: false,
            committed,
            required: self.min_stories,
            reason: Some(reason),
        };

        if committed < self.min_stories {
            return closed(format!(
                "{committed} new stories committed, {} required",
                self.min_stories
            ));
        }
        if summary.critical_errors > 0 {
            return closed(format!(
                "{} critical local store errors",
                summary.critical_errors
            ));
        }
        if self.validation_checks {
            for fingerprint in &summary.committed {
                match self.local.get_story(fingerprint).await {
                    Ok(Some(_)) => {}
                    Ok(None) => return closed(format!("committed story {fingerprint} not found")),
                    Err(e) => return closed(format!("re-reading {fingerprint} failed: {e}")),
                }
            }
        }

        GateOutcome {
            passed: true,
            committed,
            required: self.min_stories,
            reason: None,
        }
    }

    /// Phase 2: push every committed, unsynced story to production.
    ///
    /// Failures are recorded per story and never stop the loop. Stories that
    /// fail stay pending and are retried by the next call. Rows that cannot be
    /// read are marked failed and reported without being sent.
    pub async fn sync(&self) -> Result<ProductionSummary, StoreError> {
        let mut summary = ProductionSummary::default();
        let Some(production) = self.production else {
            return Ok(summary);
        };

        let pending = self.local.pending_sync().await?;
        for row in pending.unreadable {
            let message = row.error.to_string();
            if let Err(mark) = self.local.mark_sync_failed(&row.fingerprint, &message).await {
                warn!(fingerprint = %row.fingerprint, error = %mark, "could not record sync failure");
            }
            summary.errors.push(StoryFailure {
                fingerprint: row.fingerprint,
                episode_id: row.episode_id,
                kind: ErrorKind::ProductionSyncError,
                message,
            });
        }

        for story in pending.stories {
            summary.attempted += 1;
            let outcome = match production.upsert_story(&story).await {
                Ok(outcome) => self
                    .local
                    .mark_synced(&story.fingerprint)
                    .await
                    .map(|()| outcome),
                Err(e) => {
                    if let Err(mark) = self
                        .local
                        .mark_sync_failed(&story.fingerprint, &e.to_string())
                        .await
                    {
                        warn!(fingerprint = %story.fingerprint, error = %mark, "could not record sync failure");
                    }
                    Err(e)
                }
            };
            match outcome {
                Ok(SyncOutcome::Synced) => summary.synced.push(story.fingerprint.clone()),
                Ok(SyncOutcome::AlreadySynced) => {
                    summary.already_synced.push(story.fingerprint.clone())
                }
                Err(e) => {
                    warn!(fingerprint = %story.fingerprint, error = %e, "production sync failed");
                    summary
                        .errors
                        .push(failure(&story, ErrorKind::ProductionSyncError, &e));
                }
            }
        }
        info!(
            attempted = summary.attempted,
            synced = summary.synced.len(),
            already_synced = summary.already_synced.len(),
            errors = summary.errors.len(),
            "production sync finished"
        );
        Ok(summary)
    }

    /// Whether `fingerprint` has reached production, in this run or earlier.
    pub async fn is_synced(&self, fingerprint: &str) -> bool {
        matches!(
            self.local.sync_record(fingerprint).await,
            Ok(Some(record)) if record.production_status == ProductionStatus::Synced
        )
    }
}

fn failure(story: &Story, kind: ErrorKind, error: &StoreError) -> StoryFailure {
    StoryFailure {
        fingerprint: story.fingerprint.clone(),
        episode_id: story.source.episode_id.clone(),
        kind,
        message: error.to_string(),
    }
}
