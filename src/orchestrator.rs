use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use chrono::Utc;
use futures_util::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::anthropic::MessageSender;
use crate::assigner::{Strategy, WorkflowAssigner};
use crate::config::PipelineConfig;
use crate::error::ErrorKind;
use crate::fallback::{EpisodeSession, FallbackController, SessionResult};
use crate::generation::GenerationWorker;
use crate::monitor::{PerformanceMonitor, StrategyTotals};
use crate::persistence::{LocalStore, ProductionStore, StagedPersistence};
use crate::rate_limiter::RateLimiter;
use crate::report::{
    EpisodeCounts, FailureEntry, LocalCounts, ProductionCounts, RunReport, StrategyReport,
};
use crate::state_machine::{
    Episode, EpisodeId, EpisodeInput, EpisodeStatus, StageOutcome, StateMachine,
};
use crate::story::Story;

/// Events emitted while a run progresses, for terminal feedback.
#[derive(Debug, Clone, Copy)]
pub enum Progress<'a> {
    Started { episodes: usize },
    Batch { size: usize, remaining: usize },
    EpisodeFinished {
        episode_id: &'a EpisodeId,
        strategy: Strategy,
        status: EpisodeStatus,
    },
    EpisodeDeferred { episode_id: &'a EpisodeId },
    Persisting { stories: usize },
}

struct Tracked {
    episode: Episode,
    fingerprints: Vec<String>,
}

/// Drives a set of episodes through assignment, generation, fallback and
/// staged persistence, and summarizes the run.
pub struct PipelineOrchestrator<C, L, P> {
    config: PipelineConfig,
    client: C,
    local: L,
    production: Option<P>,
    limiter: RateLimiter,
    assigner: WorkflowAssigner,
    fallback: FallbackController,
    monitor: Mutex<PerformanceMonitor>,
}

impl<C: MessageSender, L: LocalStore, P: ProductionStore> PipelineOrchestrator<C, L, P> {
    /// `monitor` carries the windows and breaker state restored from the
    /// previous run. `production` is ignored when syncing is turned off.
    pub fn new(
        config: PipelineConfig,
        client: C,
        local: L,
        production: Option<P>,
        monitor: PerformanceMonitor,
    ) -> Self {
        let production = production.filter(|_| config.persistence.sync_to_production);
        Self {
            limiter: RateLimiter::from_config(&config.rate_limits),
            assigner: WorkflowAssigner::from_config(&config.rollout),
            fallback: FallbackController::new(config.breaker.auto_fallback),
            monitor: Mutex::new(monitor),
            config,
            client,
            local,
            production,
        }
    }

    pub fn monitor(&self) -> MutexGuard<'_, PerformanceMonitor> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn save_metrics(&self) -> Result<()> {
        self.monitor().save(&self.config.reporting.metrics_path)
    }

    /// Episodes per batch, so that the batch's worst-case consumption fits
    /// in one minute window.
    pub fn batch_size(&self) -> usize {
        let alternate_possible = self.assigner.alternate_possible(self.monitor().breaker());
        let worst_case = if alternate_possible {
            let fallback = if self.config.breaker.auto_fallback {
                Strategy::Primary.cost()
            } else {
                0
            };
            Strategy::Alternate.cost() + fallback
        } else {
            Strategy::Primary.cost()
        };
        let fits = (self.limiter.per_minute() / worst_case) as usize;
        fits.max(1).min(self.config.generation.max_concurrency.max(1))
    }

    pub async fn run(
        &self,
        inputs: Vec<EpisodeInput>,
        mut on_progress: impl FnMut(Progress<'_>),
    ) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();

        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        for input in inputs {
            let (episode, transcript) = input.into_episode();
            if !seen.insert(episode.id.clone()) {
                warn!(episode_id = %episode.id, "duplicate episode in input, skipping");
                continue;
            }
            queue.push_back((episode, transcript));
        }
        let total = queue.len();
        info!(%run_id, episodes = total, rollout = self.assigner.rollout_percentage(), "pipeline run started");
        on_progress(Progress::Started { episodes: total });

        let worker = GenerationWorker::new(&self.client, &self.limiter, &self.config.generation);
        let mut tracked: Vec<Tracked> = Vec::new();
        let mut stories: Vec<Story> = Vec::new();
        let mut failures: Vec<FailureEntry> = Vec::new();
        let mut deferred: Vec<EpisodeId> = Vec::new();
        let mut assigned: BTreeMap<Strategy, u32> = BTreeMap::new();
        let mut exhausted = false;

        while !exhausted && !queue.is_empty() {
            let size = self.batch_size().min(queue.len());
            let batch: Vec<(Episode, String)> = queue.drain(..size).collect();
            debug!(size, remaining = queue.len(), "dispatching batch");
            on_progress(Progress::Batch {
                size,
                remaining: queue.len(),
            });

            let sessions = join_all(batch.iter().map(|(episode, transcript)| {
                self.fallback
                    .run(&worker, &self.assigner, &self.monitor, episode, transcript)
            }))
            .await;

            for ((mut episode, _), session) in batch.into_iter().zip(sessions) {
                let EpisodeSession {
                    assignment, result, ..
                } = session;

                let fingerprints = match result {
                    SessionResult::Deferred(_) => {
                        on_progress(Progress::EpisodeDeferred {
                            episode_id: &episode.id,
                        });
                        deferred.push(episode.id);
                        continue;
                    }
                    SessionResult::Generated(generated) => {
                        advance(&mut episode, StageOutcome::Success);
                        let fingerprints: Vec<String> =
                            generated.iter().map(|s| s.fingerprint.clone()).collect();
                        stories.extend(generated);
                        fingerprints
                    }
                    SessionResult::Failed { kind, message } => {
                        advance(&mut episode, StageOutcome::Failure(kind));
                        failures.push(FailureEntry {
                            episode_id: episode.id.clone(),
                            fingerprint: None,
                            kind,
                            message,
                        });
                        Vec::new()
                    }
                };

                *assigned.entry(assignment.strategy).or_default() += 1;
                on_progress(Progress::EpisodeFinished {
                    episode_id: &episode.id,
                    strategy: assignment.strategy,
                    status: episode.status,
                });
                tracked.push(Tracked {
                    episode,
                    fingerprints,
                });
            }

            // A refused alternate reservation only defers that episode;
            // dispatch continues while a primary call still fits.
            exhausted = self.limiter.snapshot().day_remaining < Strategy::Primary.cost();
        }

        if !queue.is_empty() {
            warn!(deferred = queue.len(), "daily rate budget exhausted, deferring remaining episodes");
            deferred.extend(queue.drain(..).map(|(episode, _)| episode.id));
        }

        on_progress(Progress::Persisting {
            stories: stories.len(),
        });
        let staged = StagedPersistence::new(
            &self.local,
            self.production.as_ref(),
            &self.config.persistence,
        );
        let persistence = staged.run(&stories).await;

        let landed: HashSet<&str> = persistence
            .local
            .committed
            .iter()
            .chain(&persistence.local.duplicates)
            .map(String::as_str)
            .collect();
        let store_unhealthy = persistence.local.critical_errors > 0;
        let production_ran = persistence.production.summary().is_some();

        for t in tracked
            .iter_mut()
            .filter(|t| t.episode.status == EpisodeStatus::Generated)
        {
            if !t.fingerprints.iter().any(|f| landed.contains(f.as_str())) {
                // An unhealthy store leaves the episode generated for a later run.
                if !store_unhealthy {
                    advance(&mut t.episode, StageOutcome::Failure(ErrorKind::LocalImportError));
                }
                continue;
            }
            advance(&mut t.episode, StageOutcome::Success);

            if production_ran {
                let mut all_synced = true;
                for fingerprint in &t.fingerprints {
                    if !staged.is_synced(fingerprint).await {
                        all_synced = false;
                        break;
                    }
                }
                if all_synced {
                    advance(&mut t.episode, StageOutcome::Success);
                }
            }
        }

        let mut episodes = EpisodeCounts {
            total,
            deferred: deferred.len(),
            ..EpisodeCounts::default()
        };
        for t in &tracked {
            match t.episode.status {
                EpisodeStatus::Synced => episodes.synced += 1,
                EpisodeStatus::Imported => episodes.imported += 1,
                EpisodeStatus::Generated => episodes.generated += 1,
                EpisodeStatus::Failed => episodes.failed += 1,
                _ => {}
            }
        }

        let mut report = {
            let monitor = self.monitor();
            let none = StrategyTotals::default();
            let strategies = [Strategy::Primary, Strategy::Alternate]
                .into_iter()
                .map(|s| {
                    let totals = monitor.totals().get(&s).unwrap_or(&none);
                    (s, StrategyReport::new(assigned.get(&s).copied().unwrap_or(0), totals))
                })
                .collect();
            RunReport {
                run_id,
                started_at,
                finished_at: Utc::now(),
                duration_secs: clock.elapsed().as_secs_f64(),
                rollout_percentage: self.assigner.rollout_percentage(),
                episodes,
                strategies,
                fallbacks: monitor.fallbacks(),
                breaker: monitor.breaker().clone(),
                comparison: monitor.comparison(),
                budget: self.limiter.snapshot(),
                local: LocalCounts::default(),
                gate: persistence.gate.clone(),
                production: ProductionCounts::from(&persistence.production),
                failures,
                deferred,
                recommendations: monitor.recommendations(),
            }
        };
        report.absorb_persistence(&persistence);

        info!(
            %run_id,
            synced = report.episodes.synced,
            imported = report.episodes.imported,
            failed = report.episodes.failed,
            deferred = report.episodes.deferred,
            "pipeline run finished"
        );
        report
    }
}

fn advance(episode: &mut Episode, outcome: StageOutcome) {
    if let Err(e) = StateMachine::next(episode, outcome) {
        warn!(episode_id = %episode.id, error = %e, "illegal lifecycle transition");
    }
}
