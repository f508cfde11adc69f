//! Configuration types, built from environment variables.

use std::path::PathBuf;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};

/// Name of the label applied to flagged messages.
pub const DEFAULT_FLAGGED_LABEL: &str = "Flagged_Suspicious";

/// Folder scanned when none is given.
pub const DEFAULT_FOLDER: &str = "INBOX";

/// Batch size used when the operator does not pick one.
pub const DEFAULT_BATCH_LIMIT: usize = 5;

/// Upper bound on a single batch requested by the operator.
pub const MAX_BATCH_LIMIT: usize = 50;

/// Log file written next to the console output.
pub const LOG_FILE_NAME: &str = "email_processing.log";

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub llm: LlmConfig,
    /// Label applied to flagged messages (looked up case-insensitively).
    pub flagged_label: String,
    /// Default folder for scans.
    pub folder: String,
    /// Directory receiving one archive file per flagged message.
    pub output_dir: PathBuf,
    /// Directory holding `email_processing.log`.
    pub log_dir: PathBuf,
    /// OAuth client secrets downloaded from the Google Cloud Console.
    pub credentials_path: PathBuf,
    /// Persisted authorization token.
    pub token_path: PathBuf,
    /// Operator HTTP port.
    pub port: u16,
}

impl GuardConfig {
    /// Build config from environment variables.
    ///
    /// Fails only when the API key for the selected backend is missing or a
    /// value cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match env_or("MAIL_GUARD_LLM_BACKEND", "openai")
            .to_lowercase()
            .as_str()
        {
            "openai" => LlmBackend::OpenAi,
            "anthropic" => LlmBackend::Anthropic,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "MAIL_GUARD_LLM_BACKEND".into(),
                    message: format!("unknown backend '{other}' (expected openai or anthropic)"),
                });
            }
        };

        let key_var = match backend {
            LlmBackend::OpenAi => "OPENAI_API_KEY",
            LlmBackend::Anthropic => "ANTHROPIC_API_KEY",
        };
        let api_key = std::env::var(key_var)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar(key_var.to_string()))?;

        let model = std::env::var("MAIL_GUARD_MODEL")
            .unwrap_or_else(|_| backend.default_model().to_string());

        let port = match std::env::var("MAIL_GUARD_PORT") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "MAIL_GUARD_PORT".into(),
                message: format!("'{raw}' is not a port number"),
            })?,
            Err(_) => 8080,
        };

        let (credentials_path, token_path) = credential_paths_from_env();
        Ok(Self {
            llm: LlmConfig {
                backend,
                api_key: SecretString::from(api_key),
                model,
            },
            flagged_label: env_or("MAIL_GUARD_LABEL", DEFAULT_FLAGGED_LABEL),
            folder: env_or("MAIL_GUARD_FOLDER", DEFAULT_FOLDER),
            output_dir: PathBuf::from(env_or("MAIL_GUARD_OUTPUT_DIR", "flagged_emails")),
            log_dir: log_dir_from_env(),
            credentials_path,
            token_path,
            port,
        })
    }
}

/// Log directory. Read on its own so logging can start before the rest of
/// the config is validated.
pub fn log_dir_from_env() -> PathBuf {
    PathBuf::from(env_or("MAIL_GUARD_LOG_DIR", "."))
}

/// OAuth client secrets and token file locations.
pub fn credential_paths_from_env() -> (PathBuf, PathBuf) {
    (
        PathBuf::from(env_or("MAIL_GUARD_CREDENTIALS", "credentials.json")),
        PathBuf::from(env_or("MAIL_GUARD_TOKEN", "token.json")),
    )
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Check an operator-supplied batch size against `1..=MAX_BATCH_LIMIT`.
pub fn validate_batch_limit(limit: usize) -> Result<usize, ConfigError> {
    if (1..=MAX_BATCH_LIMIT).contains(&limit) {
        Ok(limit)
    } else {
        Err(ConfigError::InvalidValue {
            key: "limit".into(),
            message: format!("must be between 1 and {MAX_BATCH_LIMIT}, got {limit}"),
        })
    }
}
