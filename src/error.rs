use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::anthropic::AnthropicError;

/// Errors raised by the shared rate budget.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    /// The daily window cannot cover the request. Terminal for the run.
    #[error("daily rate budget exhausted: requested {requested}, remaining {remaining}")]
    DailyExhausted { requested: u32, remaining: u32 },

    /// The request is larger than a full minute window and can never be granted.
    #[error("request cost {requested} exceeds per-minute capacity {capacity}")]
    ExceedsMinuteCapacity { requested: u32, capacity: u32 },

    #[error("request cost {requested} exceeds the {reserved} units left in its reservation")]
    ReservationExceeded { requested: u32, reserved: u32 },
}

/// Errors returned by the local and production stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store refused this story. Affects only the story itself.
    #[error("story rejected: {0}")]
    Rejected(String),

    /// The store itself is unhealthy (connection, schema, IO).
    #[error("store backend failure: {0}")]
    Backend(String),

    #[error("production store returned status {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl StoreError {
    /// Critical errors close the local validation gate; per-story rejections do not.
    pub fn is_critical(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Rejected(e.to_string())
    }
}

/// Raised when an episode is pushed through an illegal lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("episode {episode_id} is terminal ({status}) and cannot change")]
    Terminal { episode_id: String, status: String },

    #[error("episode {episode_id} cannot move from {from} to {to}")]
    Illegal {
        episode_id: String,
        from: String,
        to: String,
    },
}

/// Failure taxonomy surfaced in the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Daily budget gone; the run stops dispatching.
    RateBudgetExhausted,
    GenerationTimeout,
    GenerationMalformedOutput,
    /// AI service error (HTTP, rate limit, network).
    GenerationError,
    LocalImportError,
    ProductionSyncError,
    ValidationGateFailed,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::RateBudgetExhausted => "RateBudgetExhausted",
            ErrorKind::GenerationTimeout => "GenerationTimeout",
            ErrorKind::GenerationMalformedOutput => "GenerationMalformedOutput",
            ErrorKind::GenerationError => "GenerationError",
            ErrorKind::LocalImportError => "LocalImportError",
            ErrorKind::ProductionSyncError => "ProductionSyncError",
            ErrorKind::ValidationGateFailed => "ValidationGateFailed",
        };
        write!(f, "{s}")
    }
}
