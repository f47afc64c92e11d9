//! Error taxonomy for the generation pipeline.
//!
//! Every stage reports failures through [`PipelineError`]. The variant decides how the
//! coordinator reacts: validation and resource-limit errors end the job at once,
//! throttling and deck timeouts are retried within their stage, everything else fails
//! the job with the error's kind and message.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the pipeline's error type.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum PipelineError {
    /// The URL is not a well-formed or reachable repository reference.
    #[error("Invalid repository '{url}': {reason}")]
    InvalidRepository { url: String, reason: String },

    /// The clone grew past the configured ceiling.
    #[error("Repository size ({size_bytes} bytes) exceeds maximum allowed ({limit_bytes} bytes)")]
    RepositoryTooLarge { size_bytes: u64, limit_bytes: u64 },

    /// Transport or authentication failure while cloning.
    #[error("Failed to clone repository: {message}")]
    CloneFailed { message: String },

    /// The local digest could not be produced.
    #[error("Failed to build digest: {message}")]
    Digest { message: String },

    #[error("LLM response could not be parsed into a slide outline: {message}")]
    MalformedLlmResponse { message: String },

    #[error("LLM provider '{provider}' is rate limiting requests")]
    LlmRateLimit {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("LLM provider '{provider}' failed: {message}")]
    LlmProvider { provider: String, message: String },

    #[error("Deck service error{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    DeckService { status: Option<u16>, message: String },

    #[error("Deck service did not answer within {}s", .after.as_secs())]
    DeckServiceTimeout { after: Duration },

    /// Invalid settings or request parameters.
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("Job was cancelled")]
    Cancelled,

    /// A pipeline invariant was violated.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Stable, serializable name of an error variant. Carried by failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "InvalidRepositoryError")]
    InvalidRepository,
    #[serde(rename = "RepositoryTooLargeError")]
    RepositoryTooLarge,
    #[serde(rename = "CloneError")]
    CloneFailed,
    #[serde(rename = "DigestError")]
    Digest,
    #[serde(rename = "MalformedLLMResponseError")]
    MalformedLlmResponse,
    #[serde(rename = "LLMRateLimitError")]
    LlmRateLimit,
    #[serde(rename = "LLMProviderError")]
    LlmProvider,
    #[serde(rename = "DeckServiceError")]
    DeckService,
    #[serde(rename = "DeckServiceTimeoutError")]
    DeckServiceTimeout,
    #[serde(rename = "ConfigError")]
    Config,
    Cancelled,
    #[serde(rename = "InternalError")]
    Internal,
}

impl PipelineError {
    #[must_use]
    pub fn invalid_repository(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRepository {
            url: url.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn clone_failed(message: impl Into<String>) -> Self {
        Self::CloneFailed {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn digest(message: impl Into<String>) -> Self {
        Self::Digest {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedLlmResponse {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LlmProvider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn deck(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::DeckService {
            status,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRepository { .. } => ErrorKind::InvalidRepository,
            Self::RepositoryTooLarge { .. } => ErrorKind::RepositoryTooLarge,
            Self::CloneFailed { .. } => ErrorKind::CloneFailed,
            Self::Digest { .. } => ErrorKind::Digest,
            Self::MalformedLlmResponse { .. } => ErrorKind::MalformedLlmResponse,
            Self::LlmRateLimit { .. } => ErrorKind::LlmRateLimit,
            Self::LlmProvider { .. } => ErrorKind::LlmProvider,
            Self::DeckService { .. } => ErrorKind::DeckService,
            Self::DeckServiceTimeout { .. } => ErrorKind::DeckServiceTimeout,
            Self::Config { .. } => ErrorKind::Config,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Errors raised before any external cost is spent; never retried.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidRepository { .. } | Self::RepositoryTooLarge { .. } | Self::Config { .. }
        )
    }
}

impl ErrorKind {
    /// Name used in user-facing messages and API responses.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRepository => "InvalidRepositoryError",
            Self::RepositoryTooLarge => "RepositoryTooLargeError",
            Self::CloneFailed => "CloneError",
            Self::Digest => "DigestError",
            Self::MalformedLlmResponse => "MalformedLLMResponseError",
            Self::LlmRateLimit => "LLMRateLimitError",
            Self::LlmProvider => "LLMProviderError",
            Self::DeckService => "DeckServiceError",
            Self::DeckServiceTimeout => "DeckServiceTimeoutError",
            Self::Config => "ConfigError",
            Self::Cancelled => "Cancelled",
            Self::Internal => "InternalError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal {
            message: format!("IO error: {e}"),
        }
    }
}
