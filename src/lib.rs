//! storyforge: A/B story generation with circuit-breaking fallback and staged
//! local-then-production persistence.

pub mod anthropic;
pub mod assigner;
pub mod cli;
pub mod config;
pub mod error;
pub mod fallback;
pub mod generation;
pub mod monitor;
pub mod orchestrator;
pub mod persistence;
pub mod rate_limiter;
pub mod report;
pub mod state_machine;
pub mod story;
pub mod ui;

#[cfg(test)]
mod test_support;
