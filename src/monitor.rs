//! Rolling per-strategy metrics and the circuit breaker that disables the
//! alternate strategy.
//!
//! Every completed generation request appends one [`Sample`] to its
//! strategy's bounded [`MetricWindow`]. After each alternate sample the
//! breaker is evaluated; once it opens it stays open for the rest of the run
//! and across runs (the state is persisted) until an operator resets it.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::assigner::Strategy;
use crate::config::BreakerConfig;

/// Outcome of one completed generation request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// 0-10; failed requests record 0.0.
    pub quality: f64,
    pub success: bool,
    #[serde(default)]
    pub duration_ms: u64,
}

impl Sample {
    pub fn success(quality: f64, duration_ms: u64) -> Self {
        Self {
            quality,
            success: true,
            duration_ms,
        }
    }

    pub fn failure(duration_ms: u64) -> Self {
        Self {
            quality: 0.0,
            success: false,
            duration_ms,
        }
    }
}

/// Fixed-capacity ring buffer of the most recent samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricWindow {
    capacity: usize,
    samples: VecDeque<Sample>,
}

impl MetricWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, sample: Sample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn mean_quality(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.quality).sum::<f64>() / self.samples.len() as f64
    }

    /// Share of failed samples, in percent.
    pub fn error_rate_pct(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let failed = self.samples.iter().filter(|s| !s.success).count();
        failed as f64 / self.samples.len() as f64 * 100.0
    }

    fn resized(mut self, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        while self.samples.len() > capacity {
            self.samples.pop_front();
        }
        self.capacity = capacity;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TripReason {
    LowQuality { mean_quality: f64, threshold: f64 },
    HighErrorRate { error_rate_pct: f64, threshold_pct: f64 },
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TripReason::LowQuality {
                mean_quality,
                threshold,
            } => write!(f, "mean quality {mean_quality:.1} below {threshold:.1}"),
            TripReason::HighErrorRate {
                error_rate_pct,
                threshold_pct,
            } => write!(f, "error rate {error_rate_pct:.1}% above {threshold_pct:.1}%"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BreakerState {
    /// Alternate enabled.
    Closed,
    /// Alternate disabled; every episode is forced to primary.
    Open {
        reason: TripReason,
        opened_at: DateTime<Utc>,
    },
}

impl BreakerState {
    pub fn is_closed(&self) -> bool {
        matches!(self, BreakerState::Closed)
    }
}

/// Cumulative per-strategy totals for the current run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StrategyTotals {
    pub requests: u32,
    pub successes: u32,
    pub failures: u32,
    quality_sum: f64,
    duration_ms_sum: u64,
}

impl StrategyTotals {
    fn record(&mut self, sample: &Sample) {
        self.requests += 1;
        if sample.success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.quality_sum += sample.quality;
        self.duration_ms_sum += sample.duration_ms;
    }

    pub fn mean_quality(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.quality_sum / f64::from(self.requests)
        }
    }

    pub fn error_rate_pct(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            f64::from(self.failures) / f64::from(self.requests) * 100.0
        }
    }

    pub fn mean_duration_ms(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.duration_ms_sum as f64 / f64::from(self.requests)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    InsufficientData,
    IncreaseRollout,
    DecreaseRollout,
    MaintainCurrent,
}

/// Alternate-versus-primary comparison over the run totals.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceComparison {
    pub alternate_requests: u32,
    pub primary_requests: u32,
    pub quality_difference: f64,
    pub error_rate_difference: f64,
    pub duration_difference_ms: f64,
    pub recommendation: Recommendation,
}

/// What survives between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub breaker: BreakerState,
    pub windows: BTreeMap<Strategy, MetricWindow>,
}

#[derive(Debug)]
pub struct PerformanceMonitor {
    config: BreakerConfig,
    windows: BTreeMap<Strategy, MetricWindow>,
    totals: BTreeMap<Strategy, StrategyTotals>,
    breaker: BreakerState,
    fallbacks: u32,
}

impl PerformanceMonitor {
    pub fn new(config: BreakerConfig) -> Self {
        let windows = [Strategy::Primary, Strategy::Alternate]
            .into_iter()
            .map(|s| (s, MetricWindow::new(config.window_size)))
            .collect();
        Self {
            config,
            windows,
            totals: BTreeMap::new(),
            breaker: BreakerState::Closed,
            fallbacks: 0,
        }
    }

    /// Restore windows and breaker state saved by a previous run.
    pub fn from_snapshot(config: BreakerConfig, snapshot: MetricsSnapshot) -> Self {
        let mut monitor = Self::new(config);
        for (strategy, window) in snapshot.windows {
            monitor
                .windows
                .insert(strategy, window.resized(monitor.config.window_size));
        }
        monitor.breaker = snapshot.breaker;
        monitor
    }

    /// Load the snapshot at `path`, or start fresh if there is none.
    pub fn load(config: BreakerConfig, path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(config));
        }
        let contents = std::fs::read_to_string(path)?;
        let snapshot: MetricsSnapshot = serde_json::from_str(&contents)?;
        info!(path = %path.display(), breaker_closed = snapshot.breaker.is_closed(), "restored strategy metrics");
        Ok(Self::from_snapshot(config, snapshot))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&self.snapshot())?)?;
        Ok(())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            breaker: self.breaker.clone(),
            windows: self.windows.clone(),
        }
    }

    pub fn breaker(&self) -> &BreakerState {
        &self.breaker
    }

    pub fn window(&self, strategy: Strategy) -> Option<&MetricWindow> {
        self.windows.get(&strategy)
    }

    pub fn totals(&self) -> &BTreeMap<Strategy, StrategyTotals> {
        &self.totals
    }

    pub fn fallbacks(&self) -> u32 {
        self.fallbacks
    }

    pub fn record_fallback(&mut self) {
        self.fallbacks += 1;
    }

    /// Append a sample and re-evaluate the breaker. Returns the new state when
    /// this sample tripped it.
    pub fn record(&mut self, strategy: Strategy, sample: Sample) -> Option<BreakerState> {
        self.windows
            .entry(strategy)
            .or_insert_with(|| MetricWindow::new(self.config.window_size))
            .push(sample);
        self.totals.entry(strategy).or_default().record(&sample);

        if strategy != Strategy::Alternate || !self.breaker.is_closed() || !self.config.auto_fallback {
            return None;
        }

        let reason = self.evaluate()?;
        warn!(%reason, "alternate strategy disabled by circuit breaker");
        self.breaker = BreakerState::Open {
            reason,
            opened_at: Utc::now(),
        };
        self.windows.values_mut().for_each(MetricWindow::clear);
        Some(self.breaker.clone())
    }

    /// Whether the alternate window currently warrants opening the breaker.
    pub fn evaluate(&self) -> Option<TripReason> {
        let window = self.windows.get(&Strategy::Alternate)?;
        if window.len() < self.config.min_samples {
            return None;
        }
        let mean_quality = window.mean_quality();
        if mean_quality < self.config.quality_threshold {
            return Some(TripReason::LowQuality {
                mean_quality,
                threshold: self.config.quality_threshold,
            });
        }
        let error_rate_pct = window.error_rate_pct();
        if error_rate_pct > self.config.error_threshold_pct {
            return Some(TripReason::HighErrorRate {
                error_rate_pct,
                threshold_pct: self.config.error_threshold_pct,
            });
        }
        None
    }

    /// The external reconfiguration that re-enables the alternate strategy.
    pub fn reset_breaker(&mut self) {
        self.breaker = BreakerState::Closed;
        self.windows.values_mut().for_each(MetricWindow::clear);
        info!("circuit breaker reset, alternate strategy re-enabled");
    }

    pub fn comparison(&self) -> PerformanceComparison {
        let empty = StrategyTotals::default();
        let alt = self.totals.get(&Strategy::Alternate).unwrap_or(&empty);
        let primary = self.totals.get(&Strategy::Primary).unwrap_or(&empty);

        let quality_difference = alt.mean_quality() - primary.mean_quality();
        let error_rate_difference = alt.error_rate_pct() - primary.error_rate_pct();
        let recommendation = if alt.requests == 0 || primary.requests == 0 {
            Recommendation::InsufficientData
        } else if quality_difference > 1.0 && error_rate_difference < 5.0 {
            Recommendation::IncreaseRollout
        } else if quality_difference < -1.0 || error_rate_difference > 10.0 {
            Recommendation::DecreaseRollout
        } else {
            Recommendation::MaintainCurrent
        };

        PerformanceComparison {
            alternate_requests: alt.requests,
            primary_requests: primary.requests,
            quality_difference,
            error_rate_difference,
            duration_difference_ms: alt.mean_duration_ms() - primary.mean_duration_ms(),
            recommendation,
        }
    }

    /// Human-readable advice for the run report.
    pub fn recommendations(&self) -> Vec<String> {
        let comparison = self.comparison();
        let mut out = Vec::new();
        match comparison.recommendation {
            Recommendation::IncreaseRollout => out.push(
                "Consider increasing the alternate rollout percentage: quality is improving".to_string(),
            ),
            Recommendation::DecreaseRollout => out.push(
                "Consider decreasing the alternate rollout percentage: quality or reliability concerns"
                    .to_string(),
            ),
            Recommendation::InsufficientData => out.push(
                "Insufficient data for a recommendation: keep the current rollout to gather metrics"
                    .to_string(),
            ),
            Recommendation::MaintainCurrent => {}
        }
        if comparison.error_rate_difference > 5.0 {
            out.push("Alternate strategy shows a higher error rate: monitor closely".to_string());
        }
        if comparison.duration_difference_ms > 60_000.0 {
            out.push("Alternate strategy is significantly slower: consider optimizing its stages".to_string());
        }
        if let BreakerState::Open { reason, .. } = &self.breaker {
            out.push(format!(
                "Alternate strategy is disabled ({reason}); run `storyforge reset-breaker` after fixing it"
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            quality_threshold: 5.5,
            error_threshold_pct: 15.0,
            window_size: 10,
            min_samples: 5,
            auto_fallback: true,
        }
    }

    #[test]
    fn window_evicts_oldest() {
        let mut w = MetricWindow::new(3);
        for q in [1.0, 2.0, 3.0, 4.0] {
            w.push(Sample::success(q, 0));
        }
        assert_eq!(w.len(), 3);
        assert!((w.mean_quality() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn window_error_rate() {
        let mut w = MetricWindow::new(4);
        w.push(Sample::success(8.0, 0));
        w.push(Sample::failure(0));
        assert_eq!(w.error_rate_pct(), 50.0);
        assert_eq!(MetricWindow::new(4).error_rate_pct(), 0.0);
    }

    #[test]
    fn breaker_waits_for_min_samples() {
        let mut m = PerformanceMonitor::new(config());
        for _ in 0..4 {
            assert!(m.record(Strategy::Alternate, Sample::success(1.0, 0)).is_none());
        }
        assert!(m.breaker().is_closed());
        let tripped = m.record(Strategy::Alternate, Sample::success(1.0, 0));
        assert!(matches!(
            tripped,
            Some(BreakerState::Open {
                reason: TripReason::LowQuality { .. },
                ..
            })
        ));
    }

    #[test]
    fn breaker_trips_on_error_rate() {
        let mut m = PerformanceMonitor::new(config());
        for _ in 0..4 {
            m.record(Strategy::Alternate, Sample::success(9.0, 0));
        }
        // 1 failure in 5 = 20% > 15%, mean quality 7.2 stays above threshold.
        let tripped = m.record(Strategy::Alternate, Sample::failure(0));
        match tripped {
            Some(BreakerState::Open {
                reason: TripReason::HighErrorRate { error_rate_pct, .. },
                ..
            }) => assert_eq!(error_rate_pct, 20.0),
            other => panic!("expected error-rate trip, got {other:?}"),
        }
    }

    #[test]
    fn healthy_alternate_keeps_breaker_closed() {
        let mut m = PerformanceMonitor::new(config());
        for _ in 0..20 {
            assert!(m.record(Strategy::Alternate, Sample::success(8.0, 0)).is_none());
        }
        assert!(m.breaker().is_closed());
    }

    #[test]
    fn primary_samples_never_trip() {
        let mut m = PerformanceMonitor::new(config());
        for _ in 0..10 {
            assert!(m.record(Strategy::Primary, Sample::failure(0)).is_none());
        }
        assert!(m.breaker().is_closed());
    }

    #[test]
    fn open_breaker_stays_open_and_windows_reset() {
        let mut m = PerformanceMonitor::new(config());
        for _ in 0..5 {
            m.record(Strategy::Alternate, Sample::failure(0));
        }
        assert!(!m.breaker().is_closed());
        assert!(m.window(Strategy::Alternate).unwrap().is_empty());

        for _ in 0..10 {
            assert!(m.record(Strategy::Alternate, Sample::success(10.0, 0)).is_none());
        }
        assert!(!m.breaker().is_closed());
    }

    #[test]
    fn auto_fallback_off_disables_breaker() {
        let mut m = PerformanceMonitor::new(BreakerConfig {
            auto_fallback: false,
            ..config()
        });
        for _ in 0..10 {
            m.record(Strategy::Alternate, Sample::failure(0));
        }
        assert!(m.breaker().is_closed());
    }

    #[test]
    fn reset_breaker_closes_and_clears() {
        let mut m = PerformanceMonitor::new(config());
        for _ in 0..5 {
            m.record(Strategy::Alternate, Sample::failure(0));
        }
        m.record(Strategy::Primary, Sample::success(5.0, 0));
        m.reset_breaker();
        assert!(m.breaker().is_closed());
        assert!(m.window(Strategy::Primary).unwrap().is_empty());
    }

    #[test]
    fn snapshot_roundtrip_preserves_open_breaker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics/strategy_metrics.json");

        let mut m = PerformanceMonitor::new(config());
        for _ in 0..5 {
            m.record(Strategy::Alternate, Sample::failure(0));
        }
        m.record(Strategy::Alternate, Sample::success(7.0, 10));
        m.save(&path).unwrap();

        let restored = PerformanceMonitor::load(config(), &path).unwrap();
        assert!(!restored.breaker().is_closed());
        assert_eq!(restored.window(Strategy::Alternate).unwrap().len(), 1);
    }

    #[test]
    fn load_shrinks_window_to_configured_size() {
        let mut big = MetricWindow::new(10);
        for q in 0..10 {
            big.push(Sample::success(q as f64, 0));
        }
        let snapshot = MetricsSnapshot {
            breaker: BreakerState::Closed,
            windows: BTreeMap::from([(Strategy::Primary, big)]),
        };
        let m = PerformanceMonitor::from_snapshot(
            BreakerConfig {
                window_size: 5,
                min_samples: 5,
                ..config()
            },
            snapshot,
        );
        let w = m.window(Strategy::Primary).unwrap();
        assert_eq!(w.len(), 5);
        assert!((w.mean_quality() - 7.0).abs() < 1e-9);
    }

    #[test]
    fn comparison_recommendations() {
        let mut m = PerformanceMonitor::new(BreakerConfig {
            auto_fallback: false,
            ..config()
        });
        assert_eq!(m.comparison().recommendation, Recommendation::InsufficientData);

        m.record(Strategy::Primary, Sample::success(5.0, 1000));
        m.record(Strategy::Alternate, Sample::success(8.0, 2000));
        assert_eq!(m.comparison().recommendation, Recommendation::IncreaseRollout);

        m.record(Strategy::Alternate, Sample::failure(2000));
        // alternate: mean 4.0, 50% errors
        assert_eq!(m.comparison().recommendation, Recommendation::DecreaseRollout);
        assert!(m.recommendations().iter().any(|r| r.contains("higher error rate")));
    }
}
