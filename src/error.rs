use thiserror::Error;

/// Failure of a single fetch unit (one file, one page, one series).
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("could not decode response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("staging I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            FetchError::Transport { source, .. } => source.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("failed to load {table} ({rows} rows): {message}")]
    Load {
        table: String,
        rows: usize,
        message: String,
    },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("artifact error: {0}")]
    Artifact(#[from] parquet::errors::ParquetError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("unknown step: {0}")]
    UnknownStep(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
