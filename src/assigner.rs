//! Deterministic A/B assignment of episodes to a generation strategy.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::RolloutConfig;
use crate::monitor::BreakerState;
use crate::state_machine::EpisodeId;

/// The two interchangeable generation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Single-call generation.
    Primary,
    /// Nine-stage dependent generation.
    Alternate,
}

impl Strategy {
    /// Worst-case rate budget a single request of this strategy consumes.
    pub fn cost(self) -> u32 {
        match self {
            Strategy::Primary => 1,
            Strategy::Alternate => crate::generation::ALTERNATE_STAGES.len() as u32,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Primary => write!(f, "primary"),
            Strategy::Alternate => write!(f, "alternate"),
        }
    }
}

/// Maps `seed + episode_id` into a stable bucket in `[0, 100)`.
///
/// Uses the first 32 bits of a SHA-256 digest, so the bucket is identical
/// across runs, processes and platforms.
pub fn bucket(episode_id: &str, seed: &str) -> u8 {
    let digest = Sha256::digest(format!("{seed}_{episode_id}").as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (prefix % 100) as u8
}

/// Pure assignment: `alternate` iff the bucket is strictly below the rollout.
pub fn assign(episode_id: &str, seed: &str, rollout_percentage: u8) -> Strategy {
    if bucket(episode_id, seed) < rollout_percentage {
        Strategy::Alternate
    } else {
        Strategy::Primary
    }
}

/// Assignment decision with the reason behind it, for logs and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub strategy: Strategy,
    pub bucket: u8,
    /// True when the hash chose `alternate` but the breaker or the feature
    /// flag forced `primary`.
    pub forced_primary: bool,
}

/// Applies the rollout configuration and breaker state on top of [`assign`].
#[derive(Debug, Clone)]
pub struct WorkflowAssigner {
    seed: String,
    rollout_percentage: u8,
    enabled: bool,
}

impl WorkflowAssigner {
    pub fn new(seed: impl Into<String>, rollout_percentage: u8) -> Self {
        Self {
            seed: seed.into(),
            rollout_percentage: rollout_percentage.min(100),
            enabled: true,
        }
    }

    pub fn from_config(config: &RolloutConfig) -> Self {
        Self {
            enabled: config.enabled,
            ..Self::new(config.seed.clone(), config.percentage)
        }
    }

    pub fn rollout_percentage(&self) -> u8 {
        self.rollout_percentage
    }

    /// Whether any episode could be routed to `alternate` under `breaker`.
    pub fn alternate_possible(&self, breaker: &BreakerState) -> bool {
        self.enabled && self.rollout_percentage > 0 && breaker.is_closed()
    }

    pub fn assign(&self, episode_id: &EpisodeId, breaker: &BreakerState) -> Assignment {
        let bucket = bucket(episode_id.as_str(), &self.seed);
        let hashed = if bucket < self.rollout_percentage {
            Strategy::Alternate
        } else {
            Strategy::Primary
        };
        let allowed = self.enabled && breaker.is_closed();
        let strategy = if allowed { hashed } else { Strategy::Primary };

        Assignment {
            strategy,
            bucket,
            forced_primary: hashed == Strategy::Alternate && strategy == Strategy::Primary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::TripReason;

    fn open_breaker() -> BreakerState {
        BreakerState::Open {
            reason: TripReason::LowQuality {
                mean_quality: 2.0,
                threshold: 5.5,
            },
            opened_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn assignment_is_deterministic() {
        for id in ["feed/a", "feed/b", "other/123"] {
            let first = assign(id, "investingdojo", 50);
            for _ in 0..10 {
                assert_eq!(assign(id, "investingdojo", 50), first);
            }
        }
        assert_eq!(bucket("feed/a", "s"), bucket("feed/a", "s"));
    }

    #[test]
    fn seed_changes_buckets() {
        let differing = (0..200)
            .filter(|i| {
                let id = format!("feed/{i}");
                bucket(&id, "seed-a") != bucket(&id, "seed-b")
            })
            .count();
        assert!(differing > 150);
    }

    #[test]
    fn rollout_zero_is_always_primary() {
        for i in 0..1000 {
            assert_eq!(assign(&format!("f/{i}"), "s", 0), Strategy::Primary);
        }
    }

    #[test]
    fn rollout_hundred_is_always_alternate() {
        for i in 0..1000 {
            assert_eq!(assign(&format!("f/{i}"), "s", 100), Strategy::Alternate);
        }
    }

    #[test]
    fn alternate_fraction_converges_to_rollout() {
        let n = 20_000;
        for pct in [10u8, 30, 75] {
            let alt = (0..n)
                .filter(|i| assign(&format!("feed/{i}"), "investingdojo", pct) == Strategy::Alternate)
                .count();
            let fraction = alt as f64 / n as f64;
            let expected = pct as f64 / 100.0;
            assert!(
                (fraction - expected).abs() < 0.02,
                "pct {pct}: got {fraction}"
            );
        }
    }

    #[test]
    fn open_breaker_forces_primary() {
        let assigner = WorkflowAssigner::new("s", 100);
        let id = EpisodeId::new("feed", "1");

        let closed = assigner.assign(&id, &BreakerState::Closed);
        assert_eq!(closed.strategy, Strategy::Alternate);
        assert!(!closed.forced_primary);

        let open = assigner.assign(&id, &open_breaker());
        assert_eq!(open.strategy, Strategy::Primary);
        assert!(open.forced_primary);
        assert_eq!(open.bucket, closed.bucket);
    }

    #[test]
    fn disabled_rollout_forces_primary() {
        let config = RolloutConfig {
            enabled: false,
            percentage: 100,
            seed: "s".into(),
        };
        let assigner = WorkflowAssigner::from_config(&config);
        let a = assigner.assign(&EpisodeId::new("f", "1"), &BreakerState::Closed);
        assert_eq!(a.strategy, Strategy::Primary);
        assert!(!assigner.alternate_possible(&BreakerState::Closed));
    }

    #[test]
    fn strategy_costs() {
        assert_eq!(Strategy::Primary.cost(), 1);
        assert_eq!(Strategy::Alternate.cost(), 9);
    }
}
