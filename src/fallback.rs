//! One episode's generation session: assignment, the assigned request and, if
//! the alternate strategy fails, exactly one primary fallback.

use std::sync::{Mutex, PoisonError};

use tracing::{info, warn};

use crate::anthropic::MessageSender;
use crate::assigner::{Assignment, Strategy, WorkflowAssigner};
use crate::error::{ErrorKind, RateLimitError};
use crate::generation::{GenerationRequest, GenerationWorker, RequestOutcome};
use crate::monitor::PerformanceMonitor;
use crate::state_machine::Episode;
use crate::story::Story;

/// How a session ended.
#[derive(Debug, Clone)]
pub enum SessionResult {
    Generated(Vec<Story>),
    /// Both the assigned request and any fallback failed.
    Failed { kind: ErrorKind, message: String },
    /// The assigned request could not be started: the daily budget is gone.
    Deferred(RateLimitError),
}

#[derive(Debug, Clone)]
pub struct EpisodeSession {
    pub assignment: Assignment,
    /// Every request issued, in order. At most two.
    pub requests: Vec<GenerationRequest>,
    pub result: SessionResult,
}

impl EpisodeSession {
    pub fn fell_back(&self) -> bool {
        self.requests.len() > 1
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FallbackController {
    enabled: bool,
}

impl FallbackController {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Whether `request` warrants a primary retry in the same session.
    pub fn should_fall_back(&self, request: &GenerationRequest) -> bool {
        self.enabled
            && request.strategy == Strategy::Alternate
            && matches!(
                request.outcome,
                RequestOutcome::Error { .. } | RequestOutcome::Timeout
            )
    }

    /// Run the whole session for one episode.
    ///
    /// The strategy is chosen against the breaker state at this moment, and
    /// every finished request is recorded in `monitor` before returning, so the
    /// next assignment sees it.
    pub async fn run<C: MessageSender>(
        &self,
        worker: &GenerationWorker<'_, C>,
        assigner: &WorkflowAssigner,
        monitor: &Mutex<PerformanceMonitor>,
        episode: &Episode,
        transcript: &str,
    ) -> EpisodeSession {
        let assignment = {
            let monitor = monitor.lock().unwrap_or_else(PoisonError::into_inner);
            assigner.assign(&episode.id, monitor.breaker())
        };
        if assignment.forced_primary {
            info!(episode_id = %episode.id, bucket = assignment.bucket, "alternate disabled, forcing primary");
        }

        let mut session = EpisodeSession {
            assignment,
            requests: Vec::new(),
            result: SessionResult::Generated(Vec::new()),
        };

        let first = match worker
            .generate(assignment.strategy, episode, transcript, 1)
            .await
        {
            Ok(request) => request,
            Err(e) => {
                warn!(episode_id = %episode.id, error = %e, "rate budget exhausted, deferring episode");
                session.result = SessionResult::Deferred(e);
                return session;
            }
        };
        record(monitor, &first);

        if first.is_success() {
            session.result = SessionResult::Generated(first.stories.clone());
            session.requests.push(first);
            return session;
        }

        let first_kind = first.error_kind().unwrap_or(ErrorKind::GenerationError);
        let first_message = first.error_message().unwrap_or_default();
        let fall_back = self.should_fall_back(&first);
        session.requests.push(first);

        if !fall_back {
            session.result = SessionResult::Failed {
                kind: first_kind,
                message: first_message,
            };
            return session;
        }

        info!(episode_id = %episode.id, reason = %first_kind, "alternate failed, falling back to primary");
        monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_fallback();

        match worker.generate(Strategy::Primary, episode, transcript, 2).await {
            Ok(fallback) => {
                record(monitor, &fallback);
                session.result = if fallback.is_success() {
                    SessionResult::Generated(fallback.stories.clone())
                } else {
                    SessionResult::Failed {
                        kind: fallback.error_kind().unwrap_or(ErrorKind::GenerationError),
                        message: format!(
                            "alternate: {first_message}; primary fallback: {}",
                            fallback.error_message().unwrap_or_default()
                        ),
                    }
                };
                session.requests.push(fallback);
            }
            Err(e) => {
                warn!(episode_id = %episode.id, error = %e, "no budget left for the primary fallback");
                session.result = SessionResult::Failed {
                    kind: ErrorKind::RateBudgetExhausted,
                    message: format!("alternate: {first_message}; primary fallback not started: {e}"),
                };
            }
        }
        session
    }
}

fn record(monitor: &Mutex<PerformanceMonitor>, request: &GenerationRequest) {
    monitor
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .record(request.strategy, request.sample());
}
