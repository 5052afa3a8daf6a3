use std::fmt;
use thiserror::Error;

/// Failure of a single extraction source.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider {provider} unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("provider {provider} does not support {mime_type}")]
    Unsupported { provider: String, mime_type: String },

    #[error("provider {provider} request failed: {message}")]
    Http { provider: String, message: String },

    #[error("provider {provider} returned an unreadable response: {message}")]
    Parse { provider: String, message: String },
}

impl ProviderError {
    pub fn http(provider: &str, message: impl fmt::Display) -> Self {
        ProviderError::Http {
            provider: provider.to_string(),
            message: message.to_string(),
        }
    }

    pub fn parse(provider: &str, message: impl fmt::Display) -> Self {
        ProviderError::Parse {
            provider: provider.to_string(),
            message: message.to_string(),
        }
    }

    pub fn unavailable(provider: &str, reason: impl fmt::Display) -> Self {
        ProviderError::Unavailable {
            provider: provider.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        let provider = err
            .url()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        if err.is_connect() || err.is_timeout() {
            ProviderError::Unavailable { provider, reason: err.to_string() }
        } else {
            ProviderError::Http { provider, message: err.to_string() }
        }
    }
}

/// A provider failure recorded by the orchestrator.
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    pub source: String,
    pub message: String,
    /// The source could not be reached, as opposed to answering badly.
    pub unavailable: bool,
}

impl ProviderFailure {
    pub fn new(source: &str, error: &ProviderError) -> Self {
        ProviderFailure {
            source: source.to_string(),
            message: error.to_string(),
            unavailable: matches!(error, ProviderError::Unavailable { .. }),
        }
    }
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source, self.message)
    }
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("all extraction sources failed: {}", join_failures(.0))]
    AllProvidersFailed(Vec<ProviderFailure>),

    /// Nothing was attempted: no configured source accepts the document.
    #[error("no configured extraction source accepts {0}")]
    NoEligibleProvider(String),
}

fn join_failures(failures: &[ProviderFailure]) -> String {
    if failures.is_empty() {
        return "no source attempted".to_string();
    }
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StorageError::NotFound("row".to_string()),
            other => StorageError::Backend(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        StorageError::Backend(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("invoice cannot be rendered: {0}")]
    Incomplete(String),
}

/// Pipeline-level error taxonomy.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("extraction failed: {0}")]
    ExtractionFailed(ExtractionError),

    #[error("validation found {count} critical issue(s)")]
    ValidationCritical { count: usize },

    #[error("quota exceeded: {usage}/{limit} invoices this billing period")]
    QuotaExceeded { usage: u64, limit: u64 },

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("document generation failed: {0}")]
    DocumentGenerationFailed(String),

    #[error("giving up after {attempts} attempt(s): {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("file too large: {size} bytes (max {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("record store error: {0}")]
    Record(String),

    #[error("job cancelled")]
    Cancelled,

    #[error("job attempt timed out after {0}s")]
    TimedOut(u64),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid job transition: {0}")]
    InvalidTransition(String),

    #[error("pipeline is shutting down")]
    ShuttingDown,
}

impl PipelineError {
    /// Transient errors trigger the retry policy; the rest fail the job outright.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::ExtractionFailed(ExtractionError::NoEligibleProvider(_)) => false,
            PipelineError::ProviderUnavailable(_)
            | PipelineError::ExtractionFailed(_)
            | PipelineError::UploadFailed(_)
            | PipelineError::DownloadFailed(_)
            | PipelineError::DocumentGenerationFailed(_)
            | PipelineError::Record(_)
            | PipelineError::TimedOut(_) => true,
            _ => false,
        }
    }
}

impl From<ExtractionError> for PipelineError {
    /// Every attempted source being unreachable is reported as such.
    fn from(err: ExtractionError) -> Self {
        match err {
            ExtractionError::AllProvidersFailed(failures)
                if !failures.is_empty() && failures.iter().all(|f| f.unavailable) =>
            {
                PipelineError::ProviderUnavailable(join_failures(&failures))
            }
            other => PipelineError::ExtractionFailed(other),
        }
    }
}

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => PipelineError::NotFound(what),
            StorageError::Backend(msg) => PipelineError::Record(msg),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
pub type StorageResult<T> = Result<T, StorageError>;
