//! Interface de terminal do storyforge: barra de progresso e saída colorida.
//!
//! Usa `indicatif` para acompanhar os lotes de episódios e `console` para
//! estilizar o resumo final da execução.

use std::path::Path;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::assigner::{Assignment, Strategy};
use crate::config::PipelineConfig;
use crate::monitor::{BreakerState, PerformanceMonitor};
use crate::orchestrator::Progress;
use crate::persistence::StoreTotals;
use crate::report::RunReport;
use crate::state_machine::{EpisodeId, EpisodeStatus};

/// Paleta usada em todas as saídas.
struct Palette {
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
    header: Style,
}

impl Palette {
    fn new() -> Self {
        Self {
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
            header: Style::new().cyan().bold(),
        }
    }

    fn breaker(&self, state: &BreakerState) -> String {
        match state {
            BreakerState::Closed => self.green.apply_to("closed").to_string(),
            BreakerState::Open { reason, opened_at } => format!(
                "{} ({reason}, since {})",
                self.red.apply_to("open"),
                opened_at.format("%Y-%m-%d %H:%M UTC")
            ),
        }
    }
}

/// Barra de progresso de uma execução do pipeline.
pub struct RunProgress {
    pb: ProgressBar,
    palette: Palette,
}

impl RunProgress {
    pub fn new() -> Self {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        pb.enable_steady_tick(std::time::Duration::from_millis(120));
        Self {
            pb,
            palette: Palette::new(),
        }
    }

    /// Atualiza a barra a partir de um evento do orquestrador.
    pub fn update(&self, event: Progress<'_>) {
        match event {
            Progress::Started { episodes } => {
                self.pb.set_length(episodes as u64);
                self.pb.set_message("generating");
            }
            Progress::Batch { size, remaining } => {
                self.pb
                    .set_message(format!("batch of {size}, {remaining} queued"));
            }
            Progress::EpisodeFinished {
                episode_id,
                strategy,
                status,
            } => {
                self.pb.inc(1);
                self.pb.println(self.episode_line(episode_id, strategy, status));
            }
            Progress::EpisodeDeferred { episode_id } => {
                self.pb.inc(1);
                self.pb.println(format!(
                    "  {} {episode_id} deferred (rate budget)",
                    self.palette.yellow.apply_to("⏸")
                ));
            }
            Progress::Persisting { stories } => {
                self.pb.set_message(format!("persisting {stories} stories"));
            }
        }
    }

    fn episode_line(&self, id: &EpisodeId, strategy: Strategy, status: EpisodeStatus) -> String {
        let mark = if status == EpisodeStatus::Failed {
            self.palette.red.apply_to("✗")
        } else {
            self.palette.green.apply_to("✓")
        };
        format!("  {mark} {id} {}", self.palette.dim.apply_to(strategy))
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

impl Default for RunProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Imprime o resumo de uma execução.
pub fn print_report(report: &RunReport, path: Option<&Path>) {
    let p = Palette::new();
    let e = &report.episodes;

    println!();
    println!("{}", p.header.apply_to("─── Run Report ───"));
    println!("  run        {}", report.run_id);
    println!("  duration   {:.1}s", report.duration_secs);
    println!(
        "  episodes   {} total: {} synced, {} imported, {} generated, {} failed, {} deferred",
        e.total,
        p.green.apply_to(e.synced),
        e.imported,
        e.generated,
        p.red.apply_to(e.failed),
        p.yellow.apply_to(e.deferred)
    );
    for (strategy, s) in &report.strategies {
        println!(
            "  {strategy:<10} {} assigned, {} requests, quality {:.1}, errors {:.1}%",
            s.assigned, s.requests, s.mean_quality, s.error_rate_pct
        );
    }
    println!("  fallbacks  {}", report.fallbacks);
    println!("  breaker    {}", p.breaker(&report.breaker));
    println!(
        "  budget     {} calls, {} left today",
        report.budget.calls_granted, report.budget.day_remaining
    );
    println!(
        "  local      {} committed, {} duplicates, {} errors",
        report.local.committed, report.local.duplicates, report.local.errors
    );
    let gate = if report.gate.passed {
        p.green.apply_to("passed").to_string()
    } else {
        format!(
            "{} ({})",
            p.red.apply_to("closed"),
            report.gate.reason.as_deref().unwrap_or("")
        )
    };
    println!("  gate       {gate}");
    println!(
        "  production {}: {} attempted, {} synced, {} already synced, {} errors",
        report.production.status,
        report.production.attempted,
        report.production.synced,
        report.production.already_synced,
        report.production.errors
    );

    if !report.failures.is_empty() {
        println!();
        println!("{}", p.red.apply_to("Failures"));
        for f in &report.failures {
            let target = f.fingerprint.as_deref().unwrap_or(f.episode_id.as_str());
            println!("  {} {target}: {}", p.yellow.apply_to(f.kind), f.message);
        }
    }
    if !report.recommendations.is_empty() {
        println!();
        println!("{}", p.header.apply_to("Recommendations"));
        for r in &report.recommendations {
            println!("  • {r}");
        }
    }
    if let Some(path) = path {
        println!();
        println!("  report written to {}", p.dim.apply_to(path.display()));
    }
}

/// Imprime as atribuições A/B calculadas pelo comando `assign`.
pub fn print_assignments(assignments: &[(String, Assignment)]) {
    let p = Palette::new();
    for (id, a) in assignments {
        let strategy = match a.strategy {
            Strategy::Alternate => p.yellow.apply_to(a.strategy),
            Strategy::Primary => p.green.apply_to(a.strategy),
        };
        let note = if a.forced_primary { " (forced by breaker)" } else { "" };
        println!("  {id:<40} bucket {:>2} → {strategy}{note}", a.bucket);
    }
}

/// Imprime a configuração efetiva, o estado persistido do monitor e os
/// totais do banco local (`None` se o banco ainda não existe).
pub fn print_status(
    config: &PipelineConfig,
    monitor: &PerformanceMonitor,
    store: Option<StoreTotals>,
) {
    let p = Palette::new();
    println!("{}", p.header.apply_to("─── storyforge status ───"));
    println!(
        "  rollout    {}% (seed \"{}\", {})",
        config.rollout.percentage,
        config.rollout.seed,
        if config.rollout.enabled { "enabled" } else { "disabled" }
    );
    println!(
        "  budget     {}/min, {}/day",
        config.rate_limits.per_minute, config.rate_limits.per_day
    );
    println!(
        "  breaker    {} (quality < {:.1} or errors > {:.1}% over {} samples)",
        p.breaker(monitor.breaker()),
        config.breaker.quality_threshold,
        config.breaker.error_threshold_pct,
        config.breaker.min_samples
    );
    match store {
        Some(t) => println!(
            "  local db   {} stories, {} synced, {} failed sync",
            t.stories,
            p.green.apply_to(t.synced),
            p.red.apply_to(t.failed)
        ),
        None => println!(
            "  local db   {}",
            p.dim.apply_to(format!(
                "{} not created yet",
                config.persistence.local_db_path.display()
            ))
        ),
    }
    for strategy in [Strategy::Primary, Strategy::Alternate] {
        if let Some(w) = monitor.window(strategy) {
            println!(
                "  {strategy:<10} window {} samples, quality {:.1}, errors {:.1}%",
                w.len(),
                w.mean_quality(),
                w.error_rate_pct()
            );
        }
    }
    for r in monitor.recommendations() {
        println!("  • {r}");
    }
}
