//! Error types for mail-guard.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Initialization error: {0}")]
    Init(#[from] InitError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Startup failures. Always fatal.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("Credentials file not found at {path}. Download an OAuth client from the Google Cloud Console and place it there")]
    MissingCredentials { path: PathBuf },

    #[error("Invalid credentials file {path}: {reason}")]
    InvalidCredentials { path: PathBuf, reason: String },

    #[error("Authorization failed: {0}")]
    Authorization(String),

    #[error("Token store error: {0}")]
    TokenStore(String),

    #[error("Failed to set up label {name}: {source}")]
    LabelSetup {
        name: String,
        #[source]
        source: MailboxError,
    },

    #[error("Failed to create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Mailbox provider errors. Any RPC may fail with one of these.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication rejected by {provider}")]
    Auth { provider: String },

    #[error("{provider} API returned {status}: {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("Message {id} not found")]
    NotFound { id: String },

    #[error("Malformed response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for MailboxError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures of either disposition effect.
#[derive(Debug, thiserror::Error)]
pub enum DispositionError {
    #[error("Label mutation failed for {message_id}: {source}")]
    Label {
        message_id: String,
        #[source]
        source: MailboxError,
    },

    #[error("Archive write failed for {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive file {path} is malformed: {reason}")]
    MalformedArchive { path: PathBuf, reason: String },
}

/// Coarse classification of pipeline failures, used for logging and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Fetch,
    Stage,
    Disposition,
    MessageProcessing,
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Fetch failed: {0}")]
    Fetch(#[source] MailboxError),

    #[error("Stage {stage} failed: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: LlmError,
    },

    #[error("Disposition failed: {0}")]
    Disposition(#[from] DispositionError),

    #[error("Processing message {id} failed: {reason}")]
    MessageProcessing { id: String, reason: String },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(_) => ErrorKind::Fetch,
            Self::Stage { .. } => ErrorKind::Stage,
            Self::Disposition(_) => ErrorKind::Disposition,
            Self::MessageProcessing { .. } => ErrorKind::MessageProcessing,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
