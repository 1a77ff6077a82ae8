//! Configuração do storyforge carregada a partir de `storyforge.toml`.
//!
//! A struct [`PipelineConfig`] contém todos os parâmetros do pipeline,
//! agrupados por seção. Valores não presentes no arquivo usam defaults
//! sensíveis. Variáveis de ambiente têm precedência sobre o arquivo.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Nome do arquivo de configuração procurado no diretório atual.
pub const DEFAULT_CONFIG_FILE: &str = "storyforge.toml";

/// Configuração de nível superior carregada de `storyforge.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Chave da API Anthropic.
    #[serde(default, skip_serializing)]
    pub api_key: String,

    #[serde(default)]
    pub rollout: RolloutConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub reporting: ReportingConfig,
}

/// Parâmetros do teste A/B entre as estratégias.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutConfig {
    /// Liga/desliga a estratégia alternativa por completo.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Percentual (0-100) de episódios atribuídos à estratégia alternativa.
    #[serde(default)]
    pub percentage: u8,

    /// Semente do hash determinístico de atribuição.
    #[serde(default = "default_seed")]
    pub seed: String,
}

/// Limiares do circuit breaker da estratégia alternativa.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Qualidade média mínima (0-10) aceitável na janela.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,

    /// Taxa de erro máxima, em pontos percentuais.
    #[serde(default = "default_error_threshold_pct")]
    pub error_threshold_pct: f64,

    /// Capacidade da janela deslizante de amostras por estratégia.
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Amostras mínimas antes de o breaker poder abrir.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Quando falso, nem o breaker nem o fallback atuam.
    #[serde(default = "default_true")]
    pub auto_fallback: bool,
}

/// Orçamento de chamadas ao serviço de IA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,

    #[serde(default = "default_per_day")]
    pub per_day: u32,
}

/// Parâmetros das chamadas de geração.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Tempo máximo de uma requisição completa (todas as etapas), em segundos.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Número máximo de episódios processados em paralelo por lote.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// URL alternativa da API (útil para testes e proxies).
    #[serde(default)]
    pub api_base_url: Option<String>,
}

/// Parâmetros da persistência em duas fases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_local_db_path")]
    pub local_db_path: PathBuf,

    /// Mínimo de histórias novas para liberar a sincronização com produção.
    #[serde(default = "default_min_stories_for_sync")]
    pub min_stories_for_sync: usize,

    #[serde(default = "default_true")]
    pub sync_to_production: bool,

    /// Relê as histórias do banco local antes de liberar a fase 2.
    #[serde(default = "default_true")]
    pub validation_checks: bool,

    #[serde(default)]
    pub production_url: String,

    #[serde(default, skip_serializing)]
    pub production_token: String,
}

/// Destino dos artefatos da execução.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportingConfig {
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,

    /// Arquivo JSON com as janelas de métricas e o estado do breaker.
    #[serde(default = "default_metrics_path")]
    pub metrics_path: PathBuf,
}

fn default_true() -> bool {
    true
}

fn default_seed() -> String {
    "investingdojo".to_string()
}

fn default_quality_threshold() -> f64 {
    5.5
}

fn default_error_threshold_pct() -> f64 {
    15.0
}

fn default_window_size() -> usize {
    10
}

fn default_min_samples() -> usize {
    5
}

fn default_per_minute() -> u32 {
    10
}

fn default_per_day() -> u32 {
    150
}

fn default_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

// 5 minutos, como o timeout de fallback original.
fn default_request_timeout_secs() -> u64 {
    300
}

fn default_max_concurrency() -> usize {
    3
}

fn default_local_db_path() -> PathBuf {
    PathBuf::from("data/storyforge.db")
}

fn default_min_stories_for_sync() -> usize {
    1
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_metrics_path() -> PathBuf {
    PathBuf::from("logs/strategy_metrics.json")
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            percentage: 0,
            seed: default_seed(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            quality_threshold: default_quality_threshold(),
            error_threshold_pct: default_error_threshold_pct(),
            window_size: default_window_size(),
            min_samples: default_min_samples(),
            auto_fallback: true,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: default_per_minute(),
            per_day: default_per_day(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
            max_concurrency: default_max_concurrency(),
            api_base_url: None,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            local_db_path: default_local_db_path(),
            min_stories_for_sync: default_min_stories_for_sync(),
            sync_to_production: true,
            validation_checks: true,
            production_url: String::new(),
            production_token: String::new(),
        }
    }
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            report_dir: default_report_dir(),
            metrics_path: default_metrics_path(),
        }
    }
}

impl GenerationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl PipelineConfig {
    /// Carrega a configuração de `path` ou de `storyforge.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<PipelineConfig>(&contents)?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Aplica as variáveis de ambiente sobre os valores do arquivo.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("ANTHROPIC_API_KEY").filter(|k| !k.is_empty()) {
            self.api_key = key;
        }
        if let Some(token) = lookup("STORYFORGE_PRODUCTION_TOKEN").filter(|t| !t.is_empty()) {
            self.persistence.production_token = token;
        }
        if let Some(pct) = lookup("STORYFORGE_ROLLOUT_PERCENTAGE").and_then(|v| v.parse().ok()) {
            self.rollout.percentage = pct;
        }
    }

    /// Rejeita combinações que tornariam a execução impossível.
    pub fn validate(&self) -> Result<()> {
        if self.rollout.percentage > 100 {
            bail!(
                "rollout.percentage must be within 0-100, got {}",
                self.rollout.percentage
            );
        }
        if self.rate_limits.per_minute == 0 || self.rate_limits.per_day == 0 {
            bail!("rate_limits.per_minute and rate_limits.per_day must be positive");
        }
        if self.breaker.window_size == 0 {
            bail!("breaker.window_size must be positive");
        }
        if self.breaker.window_size < self.breaker.min_samples {
            bail!(
                "breaker.window_size ({}) must be >= breaker.min_samples ({})",
                self.breaker.window_size,
                self.breaker.min_samples
            );
        }
        if self.generation.max_concurrency == 0 {
            bail!("generation.max_concurrency must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.rollout.percentage, 0);
        assert_eq!(config.rollout.seed, "investingdojo");
        assert_eq!(config.breaker.quality_threshold, 5.5);
        assert_eq!(config.breaker.error_threshold_pct, 15.0);
        assert_eq!(config.breaker.min_samples, 5);
        assert_eq!(config.rate_limits.per_minute, 10);
        assert_eq!(config.rate_limits.per_day, 150);
        assert_eq!(config.persistence.min_stories_for_sync, 1);
        assert!(config.api_key.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            api_key = "sk-test-123"

            [rollout]
            percentage = 25
            seed = "abtest"

            [rate_limits]
            per_day = 500
        "#;
        let config: PipelineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.api_key, "sk-test-123");
        assert_eq!(config.rollout.percentage, 25);
        assert_eq!(config.rollout.seed, "abtest");
        assert!(config.rollout.enabled);
        assert_eq!(config.rate_limits.per_day, 500);
        assert_eq!(config.rate_limits.per_minute, 10);
        assert_eq!(config.generation.request_timeout_secs, 300);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = PipelineConfig::default();
        config.apply_env(|key| match key {
            "ANTHROPIC_API_KEY" => Some("sk-env".into()),
            "STORYFORGE_ROLLOUT_PERCENTAGE" => Some("40".into()),
            "STORYFORGE_PRODUCTION_TOKEN" => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.api_key, "sk-env");
        assert_eq!(config.rollout.percentage, 40);
        assert!(config.persistence.production_token.is_empty());
    }

    #[test]
    fn validate_rejects_out_of_range_rollout() {
        let mut config = PipelineConfig::default();
        config.rollout.percentage = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_window_smaller_than_min_samples() {
        let mut config = PipelineConfig::default();
        config.breaker.window_size = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[breaker]\nmin_samples = 2\nwindow_size = 4\n").unwrap();

        let config = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.breaker.min_samples, 2);
        assert_eq!(config.breaker.window_size, 4);
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::load(Some(&dir.path().join("missing.toml"))).unwrap();
        assert_eq!(config.rate_limits.per_day, 150);
    }
}
