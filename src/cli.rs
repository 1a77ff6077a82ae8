//! Interface de linha de comando do storyforge baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, assign, status,
//! reset-breaker) e flags globais (--config, --rollout, --verbose, --log-json).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// storyforge: geração de histórias com teste A/B e persistência em duas fases.
#[derive(Debug, Parser)]
#[command(name = "storyforge", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: ./storyforge.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Sobrescreve o percentual de rollout da estratégia alternativa.
    #[arg(long, global = true, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub rollout: Option<u8>,

    /// Habilita logs de depuração.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Emite os logs em JSON.
    #[arg(long, global = true, default_value_t = false)]
    pub log_json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa o pipeline completo sobre episódios já transcritos.
    Run {
        /// Arquivo JSON com a lista de episódios e suas transcrições.
        #[arg(long)]
        episodes: PathBuf,
    },

    /// Mostra a estratégia atribuída a cada episódio, sem gerar nada.
    Assign {
        /// Identificadores no formato `feed/guid`.
        #[arg(required = true)]
        episode_ids: Vec<String>,
    },

    /// Mostra a configuração efetiva, o breaker e as métricas persistidas.
    Status,

    /// Fecha o circuit breaker e limpa as janelas de métricas persistidas.
    ResetBreaker,
}
