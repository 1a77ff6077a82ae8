//! The structured summary of one pipeline run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::assigner::Strategy;
use crate::error::ErrorKind;
use crate::monitor::{BreakerState, PerformanceComparison, StrategyTotals};
use crate::persistence::{GateOutcome, PersistenceReport, ProductionPhase};
use crate::rate_limiter::BudgetSnapshot;
use crate::state_machine::EpisodeId;

/// Episodes by the state they ended the run in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EpisodeCounts {
    pub total: usize,
    pub synced: usize,
    pub imported: usize,
    pub generated: usize,
    pub failed: usize,
    pub deferred: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StrategyReport {
    /// Episodes whose assignment landed on this strategy.
    pub assigned: u32,
    pub requests: u32,
    pub successes: u32,
    pub failures: u32,
    pub mean_quality: f64,
    pub error_rate_pct: f64,
    pub mean_duration_ms: f64,
}

impl StrategyReport {
    pub fn new(assigned: u32, totals: &StrategyTotals) -> Self {
        Self {
            assigned,
            requests: totals.requests,
            successes: totals.successes,
            failures: totals.failures,
            mean_quality: totals.mean_quality(),
            error_rate_pct: totals.error_rate_pct(),
            mean_duration_ms: totals.mean_duration_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LocalCounts {
    pub committed: usize,
    pub duplicates: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductionCounts {
    /// `completed`, `skipped` or `disabled`.
    pub status: &'static str,
    pub attempted: usize,
    pub synced: usize,
    pub already_synced: usize,
    pub errors: usize,
}

impl From<&ProductionPhase> for ProductionCounts {
    fn from(phase: &ProductionPhase) -> Self {
        let status = match phase {
            ProductionPhase::Completed(_) => "completed",
            ProductionPhase::Skipped { .. } => "skipped",
            ProductionPhase::Disabled => "disabled",
        };
        let summary = phase.summary();
        Self {
            status,
            attempted: summary.map_or(0, |s| s.attempted),
            synced: summary.map_or(0, |s| s.synced.len()),
            already_synced: summary.map_or(0, |s| s.already_synced.len()),
            errors: summary.map_or(0, |s| s.errors.len()),
        }
    }
}

/// One entry per failure, whatever stage it happened in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureEntry {
    pub episode_id: EpisodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub rollout_percentage: u8,
    pub episodes: EpisodeCounts,
    pub strategies: BTreeMap<Strategy, StrategyReport>,
    pub fallbacks: u32,
    pub breaker: BreakerState,
    pub comparison: PerformanceComparison,
    pub budget: BudgetSnapshot,
    pub local: LocalCounts,
    pub gate: GateOutcome,
    pub production: ProductionCounts,
    pub failures: Vec<FailureEntry>,
    pub deferred: Vec<EpisodeId>,
    pub recommendations: Vec<String>,
}

impl RunReport {
    /// Fold the persistence outcome into the report's counters and failures.
    pub fn absorb_persistence(&mut self, persistence: &PersistenceReport) {
        self.local = LocalCounts {
            committed: persistence.local.committed.len(),
            duplicates: persistence.local.duplicates.len(),
            errors: persistence.local.errors.len(),
        };
        self.gate = persistence.gate.clone();
        self.production = ProductionCounts::from(&persistence.production);

        let production_errors = persistence
            .production
            .summary()
            .map(|s| s.errors.as_slice())
            .unwrap_or_default();
        for failure in persistence.local.errors.iter().chain(production_errors) {
            self.failures.push(FailureEntry {
                episode_id: failure.episode_id.clone(),
                fingerprint: Some(failure.fingerprint.clone()),
                kind: failure.kind,
                message: failure.message.clone(),
            });
        }
        if !persistence.gate.passed {
            self.failures.push(FailureEntry {
                episode_id: EpisodeId::from("*"),
                fingerprint: None,
                kind: ErrorKind::ValidationGateFailed,
                message: persistence.gate.reason.clone().unwrap_or_default(),
            });
        }
    }

    pub fn file_name(&self) -> String {
        format!("run_report_{}.json", self.started_at.format("%Y%m%d_%H%M%S"))
    }

    /// Write the report as pretty JSON into `dir`, returning the file path.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating report directory {}", dir.display()))?;
        let path = dir.join(self.file_name());
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{LocalImportSummary, ProductionSummary, StoryFailure};

    fn empty_report() -> RunReport {
        let started_at = DateTime::parse_from_rfc3339("2026-03-01T08:30:05Z")
            .unwrap()
            .with_timezone(&Utc);
        RunReport {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: started_at,
            duration_secs: 0.0,
            rollout_percentage: 0,
            episodes: EpisodeCounts::default(),
            strategies: BTreeMap::new(),
            fallbacks: 0,
            breaker: BreakerState::Closed,
            comparison: crate::monitor::PerformanceMonitor::new(Default::default()).comparison(),
            budget: crate::rate_limiter::RateLimiter::new(10, 150).snapshot(),
            local: LocalCounts::default(),
            gate: GateOutcome {
                passed: false,
                committed: 0,
                required: 1,
                reason: None,
            },
            production: ProductionCounts::from(&ProductionPhase::Disabled),
            failures: Vec::new(),
            deferred: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    fn story_failure(kind: ErrorKind) -> StoryFailure {
        StoryFailure {
            fingerprint: "abc".into(),
            episode_id: EpisodeId::new("feed", "1"),
            kind,
            message: "boom".into(),
        }
    }

    #[test]
    fn file_name_uses_start_timestamp() {
        assert_eq!(empty_report().file_name(), "run_report_20260301_083005.json");
    }

    #[test]
    fn write_creates_directory_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = empty_report().write_to(&dir.path().join("logs")).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["breaker"]["state"], "closed");
        assert_eq!(json["production"]["status"], "disabled");
    }

    #[test]
    fn absorb_collects_story_failures() {
        let mut report = empty_report();
        let persistence = PersistenceReport {
            local: LocalImportSummary {
                committed: vec!["f1".into(), "f2".into()],
                duplicates: vec!["f0".into()],
                errors: vec![story_failure(ErrorKind::LocalImportError)],
                critical_errors: 0,
            },
            gate: GateOutcome {
                passed: true,
                committed: 2,
                required: 1,
                reason: None,
            },
            production: ProductionPhase::Completed(ProductionSummary {
                attempted: 2,
                synced: vec!["f1".into()],
                already_synced: vec![],
                errors: vec![story_failure(ErrorKind::ProductionSyncError)],
            }),
        };

        report.absorb_persistence(&persistence);

        assert_eq!(
            report.local,
            LocalCounts {
                committed: 2,
                duplicates: 1,
                errors: 1
            }
        );
        assert_eq!(report.production.attempted, 2);
        assert_eq!(report.production.errors, 1);
        let kinds: Vec<_> = report.failures.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![ErrorKind::LocalImportError, ErrorKind::ProductionSyncError]
        );
    }

    #[test]
    fn closed_gate_is_reported_as_failure() {
        let mut report = empty_report();
        report.absorb_persistence(&PersistenceReport {
            local: LocalImportSummary::default(),
            gate: GateOutcome {
                passed: false,
                committed: 0,
                required: 1,
                reason: Some("0 new stories committed, 1 required".into()),
            },
            production: ProductionPhase::Skipped {
                reason: "0 new stories committed, 1 required".into(),
            },
        });
        assert_eq!(report.production.status, "skipped");
        assert_eq!(report.production.attempted, 0);
        assert_eq!(report.failures[0].kind, ErrorKind::ValidationGateFailed);
    }
}
