//! Story generation with either strategy.
//!
//! A [`GenerationWorker`] turns one episode into one [`GenerationRequest`].
//! The primary strategy is a single call; the alternate strategy chains the
//! nine [`ALTERNATE_STAGES`], feeding each stage's raw output to the next.
//! Both draw from the shared [`RateLimiter`] and run under the per-request
//! timeout. A timeout drops the in-flight work, and with it the unused part
//! of the budget reservation.

pub mod stages;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::anthropic::{AnthropicError, Message, MessageSender, MessagesRequest};
use crate::assigner::Strategy;
use crate::config::GenerationConfig;
use crate::error::{ErrorKind, RateLimitError};
use crate::monitor::Sample;
use crate::rate_limiter::{RateLimiter, Reservation};
use crate::state_machine::{Episode, EpisodeId};
use crate::story::{self, MalformedOutput, Story, StorySource};

pub use stages::ALTERNATE_STAGES;

/// The `invoke(prompt, context) -> raw_text` contract of the AI service.
pub async fn invoke<C: MessageSender>(
    client: &C,
    model: &str,
    max_tokens: u32,
    prompt: &str,
    context: &str,
) -> Result<String, AnthropicError> {
    let req = MessagesRequest {
        model: model.to_string(),
        max_tokens,
        system: Some(prompt.to_string()),
        messages: vec![Message::user(context)],
    };
    let text = client.send_message(&req).await?.text();
    if text.trim().is_empty() {
        return Err(AnthropicError::EmptyResponse);
    }
    Ok(text)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestOutcome {
    Success,
    Error { kind: ErrorKind, message: String },
    Timeout,
}

/// Why a request produced no stories.
#[derive(Debug, Error)]
pub enum GenerationFailure {
    #[error(transparent)]
    Budget(#[from] RateLimitError),

    #[error("{stage} call failed: {source}")]
    Service {
        stage: &'static str,
        source: AnthropicError,
    },

    #[error("malformed output: {0}")]
    Malformed(#[from] MalformedOutput),
}

impl GenerationFailure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GenerationFailure::Budget(_) => ErrorKind::RateBudgetExhausted,
            GenerationFailure::Service { .. } => ErrorKind::GenerationError,
            GenerationFailure::Malformed(_) => ErrorKind::GenerationMalformedOutput,
        }
    }
}

/// One attempt at generating stories for one episode.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub episode_id: EpisodeId,
    pub strategy: Strategy,
    /// 1 for the assigned strategy, 2 for a fallback.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub outcome: RequestOutcome,
    pub stories: Vec<Story>,
    pub quality_score: f64,
    /// AI calls actually made (budget consumed).
    pub calls_made: u32,
}

impl GenerationRequest {
    pub fn is_success(&self) -> bool {
        self.outcome == RequestOutcome::Success
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            RequestOutcome::Success => None,
            RequestOutcome::Error { kind, .. } => Some(*kind),
            RequestOutcome::Timeout => Some(ErrorKind::GenerationTimeout),
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match &self.outcome {
            RequestOutcome::Success => None,
            RequestOutcome::Error { message, .. } => Some(message.clone()),
            RequestOutcome::Timeout => Some(format!(
                "{} request timed out after {}s",
                self.strategy,
                self.duration.as_secs()
            )),
        }
    }

    /// The metric sample this request contributes to its strategy's window.
    pub fn sample(&self) -> Sample {
        let duration_ms = self.duration.as_millis() as u64;
        if self.is_success() {
            Sample::success(self.quality_score, duration_ms)
        } else {
            Sample::failure(duration_ms)
        }
    }
}

pub struct GenerationWorker<'a, C> {
    client: &'a C,
    limiter: &'a RateLimiter,
    model: String,
    max_tokens: u32,
    timeout: Duration,
}

impl<'a, C: MessageSender> GenerationWorker<'a, C> {
    pub fn new(client: &'a C, limiter: &'a RateLimiter, config: &GenerationConfig) -> Self {
        Self {
            client,
            limiter,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            timeout: config.request_timeout(),
        }
    }

    /// Run `strategy` for `episode`.
    ///
    /// The strategy's worst-case cost is reserved before any call. If the
    /// daily budget cannot cover it the request never starts and the budget
    /// error is returned; every other failure is an outcome on the request.
    pub async fn generate(
        &self,
        strategy: Strategy,
        episode: &Episode,
        transcript: &str,
        attempt: u32,
    ) -> Result<GenerationRequest, RateLimitError> {
        let mut reservation = self.limiter.reserve(strategy.cost())?;
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(episode_id = %episode.id, %strategy, attempt, "generation started");

        let result = timeout(
            self.timeout,
            self.run(strategy, &mut reservation, episode, transcript),
        )
        .await;
        let calls_made = strategy.cost() - reservation.remaining();
        drop(reservation);

        let (outcome, stories) = match result {
            Ok(Ok(stories)) => (RequestOutcome::Success, stories),
            Ok(Err(failure)) => {
                warn!(episode_id = %episode.id, %strategy, error = %failure, "generation failed");
                (
                    RequestOutcome::Error {
                        kind: failure.kind(),
                        message: failure.to_string(),
                    },
                    Vec::new(),
                )
            }
            Err(_) => {
                warn!(episode_id = %episode.id, %strategy, timeout_secs = self.timeout.as_secs(), "generation timed out");
                (RequestOutcome::Timeout, Vec::new())
            }
        };

        let quality_score = story::mean_quality(&stories);
        if outcome == RequestOutcome::Success {
            info!(episode_id = %episode.id, %strategy, stories = stories.len(), quality = quality_score, "generation succeeded");
        }
        Ok(GenerationRequest {
            episode_id: episode.id.clone(),
            strategy,
            attempt,
            started_at,
            finished_at: Utc::now(),
            duration: clock.elapsed(),
            outcome,
            stories,
            quality_score,
            calls_made,
        })
    }

    async fn run(
        &self,
        strategy: Strategy,
        reservation: &mut Reservation<'_>,
        episode: &Episode,
        transcript: &str,
    ) -> Result<Vec<Story>, GenerationFailure> {
        let context = stages::transcript_context(&episode.title, transcript);
        let raw = match strategy {
            Strategy::Primary => {
                reservation.acquire(1).await?;
                self.call("primary", &stages::primary_prompt(), &context).await?
            }
            Strategy::Alternate => {
                let mut context = context;
                for (index, stage) in ALTERNATE_STAGES.iter().enumerate() {
                    reservation.acquire(1).await?;
                    debug!(episode_id = %episode.id, stage, "running stage");
                    context = self.call(stage, &stages::stage_prompt(index), &context).await?;
                }
                context
            }
        };

        let source = StorySource {
            episode_id: episode.id.clone(),
            episode_title: episode.title.clone(),
            strategy,
            generated_at: Utc::now(),
        };
        Ok(story::parse_story_collection(&raw, &source)?)
    }

    async fn call(
        &self,
        stage: &'static str,
        prompt: &str,
        context: &str,
    ) -> Result<String, GenerationFailure> {
        invoke(self.client, &self.model, self.max_tokens, prompt, context)
            .await
            .map_err(|source| GenerationFailure::Service { stage, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, ScriptedSender};

    fn config(timeout_secs: u64) -> GenerationConfig {
        GenerationConfig {
            request_timeout_secs: timeout_secs,
            ..GenerationConfig::default()
        }
    }

    #[tokio::test]
    async fn primary_makes_one_call() {
        let client = ScriptedSender::healthy(600);
        let limiter = RateLimiter::new(10, 150);
        let worker = GenerationWorker::new(&client, &limiter, &config(300));
        let (ep, transcript) = test_support::episode("e1");

        let req = worker.generate(Strategy::Primary, &ep, &transcript, 1).await.unwrap();

        assert!(req.is_success());
        assert_eq!(req.stories.len(), 2);
        assert_eq!(req.calls_made, 1);
        assert_eq!(client.calls(), 1);
        assert_eq!(limiter.snapshot().day_remaining, 149);
        assert!((req.quality_score - 4.0).abs() < 1e-9);
        assert_eq!(req.stories[0].source.strategy, Strategy::Primary);
    }

    #[tokio::test]
    async fn alternate_chains_nine_stages() {
        let client = ScriptedSender::new(|i, req| {
            let system = req.system.clone().unwrap_or_default();
            if system.starts_with("## Stage 9/9") {
                Ok(test_support::stories_json(1, 10))
            } else {
                // Each stage must see the previous stage's output.
                let expected = if i == 0 {
                    "Episode: Episode e1".to_string()
                } else {
                    format!("stage output {}", i - 1)
                };
                assert!(req.messages[0].content.starts_with(&expected));
                Ok(format!("stage output {i}"))
            }
        });
        let limiter = RateLimiter::new(10, 150);
        let worker = GenerationWorker::new(&client, &limiter, &config(300));
        let (ep, transcript) = test_support::episode("e1");

        let req = worker.generate(Strategy::Alternate, &ep, &transcript, 1).await.unwrap();

        assert!(req.is_success(), "{:?}", req.outcome);
        assert_eq!(client.calls(), 9);
        assert_eq!(req.calls_made, 9);
        let prompts = client.prompts();
        assert!(prompts[0].starts_with("## Stage 1/9: content_analyst"));
        assert!(prompts[8].starts_with("## Stage 9/9: quality_assurance"));
    }

    #[tokio::test]
    async fn stage_failure_aborts_remaining_stages() {
        let client = ScriptedSender::new(|i, _| {
            if i == 3 {
                Err(test_support::server_error())
            } else {
                Ok("partial".into())
            }
        });
        let limiter = RateLimiter::new(10, 150);
        let worker = GenerationWorker::new(&client, &limiter, &config(300));
        let (ep, transcript) = test_support::episode("e1");

        let req = worker.generate(Strategy::Alternate, &ep, &transcript, 1).await.unwrap();

        assert_eq!(req.error_kind(), Some(ErrorKind::GenerationError));
        assert!(req.error_message().unwrap().contains("comedy_expert"));
        assert_eq!(client.calls(), 4);
        assert_eq!(req.calls_made, 4);
        // Unused stages are refunded.
        assert_eq!(limiter.snapshot().day_remaining, 146);
        assert!(req.stories.is_empty());
        assert_eq!(req.sample(), Sample::failure(req.duration.as_millis() as u64));
    }

    #[tokio::test]
    async fn malformed_final_output_is_an_error_outcome() {
        let client = ScriptedSender::always("I could not produce JSON today");
        let limiter = RateLimiter::new(10, 150);
        let worker = GenerationWorker::new(&client, &limiter, &config(300));
        let (ep, transcript) = test_support::episode("e1");

        let req = worker.generate(Strategy::Primary, &ep, &transcript, 1).await.unwrap();
        assert_eq!(req.error_kind(), Some(ErrorKind::GenerationMalformedOutput));
    }

    #[tokio::test]
    async fn empty_response_is_a_service_error() {
        let client = ScriptedSender::always("   ");
        let limiter = RateLimiter::new(10, 150);
        let worker = GenerationWorker::new(&client, &limiter, &config(300));
        let (ep, transcript) = test_support::episode("e1");

        let req = worker.generate(Strategy::Primary, &ep, &transcript, 1).await.unwrap();
        assert_eq!(req.error_kind(), Some(ErrorKind::GenerationError));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_stops_further_calls() {
        // Each call takes 40s; with a 100s budget only stages 1-3 start.
        let client = ScriptedSender::always("stage").with_delay(Duration::from_secs(40));
        let limiter = RateLimiter::new(10, 150);
        let worker = GenerationWorker::new(&client, &limiter, &config(100));
        let (ep, transcript) = test_support::episode("e1");

        let req = worker.generate(Strategy::Alternate, &ep, &transcript, 1).await.unwrap();

        assert_eq!(req.outcome, RequestOutcome::Timeout);
        assert_eq!(req.error_kind(), Some(ErrorKind::GenerationTimeout));
        assert_eq!(client.calls(), 3);
        assert_eq!(req.duration, Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(client.calls(), 3);
        assert_eq!(limiter.snapshot().day_remaining, 147);
    }

    #[tokio::test]
    async fn reservation_failure_means_request_never_starts() {
        let client = ScriptedSender::healthy(10);
        let limiter = RateLimiter::new(10, 5);
        let worker = GenerationWorker::new(&client, &limiter, &config(300));
        let (ep, transcript) = test_support::episode("e1");

        let err = worker
            .generate(Strategy::Alternate, &ep, &transcript, 1)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RateLimitError::DailyExhausted {
                requested: 9,
                remaining: 5
            }
        );
        assert_eq!(client.calls(), 0);
    }
}
