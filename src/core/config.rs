use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Application settings, layered from defaults, `config/*.toml` and `INVOICE__*` env vars.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub storage: StorageConfig,
    pub extraction: ExtractionConfig,
    pub validation: ValidationConfig,
    pub pipeline: PipelineConfig,
    pub quota: QuotaConfig,
}

impl Settings {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();

        config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("INVOICE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Per-owner submission rate limit on the HTTP surface.
    pub submissions_per_minute: u32,
    pub submission_burst: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            submissions_per_minute: 100,
            submission_burst: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres URL; the in-memory record store is used when absent.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// When set, the extraction cache is shared through Redis instead of process memory.
    pub url: Option<String>,
    pub ttl_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            url: None,
            ttl_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    S3,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub bucket: String,
    pub cdn_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: StorageBackend::Memory,
            bucket: "invoices".to_string(),
            cdn_url: None,
        }
    }
}

/// Extraction source configuration, tagged by adapter kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    Spreadsheet,
    DocumentIntelligence {
        endpoint: String,
        api_key: String,
        #[serde(default = "default_di_model")]
        model: String,
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
        #[serde(default = "default_max_polls")]
        max_polls: u32,
    },
    OpenaiVision {
        api_key: String,
        #[serde(default = "default_openai_model")]
        model: String,
        #[serde(default = "default_openai_base_url")]
        base_url: String,
    },
    AnthropicVision {
        api_key: String,
        #[serde(default = "default_anthropic_model")]
        model: String,
        #[serde(default = "default_anthropic_base_url")]
        base_url: String,
    },
}

fn default_di_model() -> String {
    "prebuilt-invoice".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_max_polls() -> u32 {
    60
}

fn default_openai_model() -> String {
    "gpt-4o".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_anthropic_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com/v1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub template_matching: bool,
    pub template_threshold: f64,
    pub template_working_set: usize,
    pub provider_threshold: f64,
    pub early_return_threshold: f64,
    pub merge_line_item_min_confidence: f64,
    pub name_similarity_threshold: f64,
    pub cache_capacity: usize,
    pub request_timeout_secs: u64,
    pub providers: Vec<ProviderConfig>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        ExtractionConfig {
            template_matching: true,
            template_threshold: 0.85,
            template_working_set: 50,
            provider_threshold: 0.7,
            early_return_threshold: 0.9,
            merge_line_item_min_confidence: 0.6,
            name_similarity_threshold: 0.8,
            cache_capacity: 100,
            request_timeout_secs: 120,
            providers: vec![ProviderConfig::Spreadsheet],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub retention_years: i32,
    pub max_payment_terms_days: i64,
    pub auto_fix_min_confidence: f64,
    /// Results are keyed by invoice number + date + total, which can collide.
    pub cache_enabled: bool,
    pub cache_capacity: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        ValidationConfig {
            retention_years: 5,
            max_payment_terms_days: 120,
            auto_fix_min_confidence: 0.8,
            cache_enabled: false,
            cache_capacity: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticalOutcome {
    Draft,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub workers: usize,
    pub jobs_per_second: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub job_timeout_secs: u64,
    pub max_file_bytes: u64,
    pub auto_submit: bool,
    pub critical_outcome: CriticalOutcome,
    /// How long finished jobs stay visible to `get_status`.
    pub job_retention_secs: u64,
    /// Upper bound on finished jobs kept in memory.
    pub retained_jobs: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            workers: 4,
            jobs_per_second: 5,
            max_attempts: 3,
            backoff_base_ms: 2000,
            job_timeout_secs: 300,
            max_file_bytes: 10 * 1024 * 1024,
            auto_submit: false,
            critical_outcome: CriticalOutcome::Draft,
            job_retention_secs: 3600,
            retained_jobs: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Monthly invoice limit per plan; `None` means unlimited.
    pub plans: HashMap<String, Option<u64>>,
    pub default_plan: String,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        let plans = HashMap::from([
            ("free".to_string(), Some(50)),
            ("starter".to_string(), Some(200)),
            ("professional".to_string(), Some(1000)),
            ("enterprise".to_string(), None),
        ]);
        QuotaConfig {
            plans,
            default_plan: "free".to_string(),
        }
    }
}
