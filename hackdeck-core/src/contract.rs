#![allow(unused)]

//! # contract: service seams of the generation pipeline
//!
//! The coordinator talks to the outside world only through the traits in this module:
//! a [`RepositoryFetcher`] (version-control host), a [`LanguageModel`] (LLM provider),
//! a [`DeckService`] (slide-generation API) and a [`Clock`].
//!
//! ## Mocking & Testing
//! - Every trait is annotated for `mockall`; the generated `Mock*` types are exported
//!   behind the `test-export-mocks` feature so downstream crates can script pipelines.
//! - Real implementations live next to their concern: [`crate::download::GitFetcher`],
//!   [`crate::llm::AnthropicClient`] / [`crate::llm::OpenAiClient`] and
//!   [`crate::deck::PresentonClient`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockall::{automock, predicate::*};
use serde::{Deserialize, Serialize};

use crate::config::ExportFormat;
use crate::deck::DeckRequest;
use crate::download::{RepositorySnapshot, RepositoryUrl};
use crate::error::Result;

/// One request to a language model.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Terminal output of a successful job: where the rendered deck lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub presentation_id: String,
    pub download_url: String,
    pub edit_url: Option<String>,
    pub export_format: ExportFormat,
    pub credits_consumed: Option<f64>,
}

/// Produces local snapshots of remote repositories.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait RepositoryFetcher: Send + Sync {
    /// Resolve the commit the remote default branch points at, without cloning.
    async fn resolve_reference(&self, url: &RepositoryUrl) -> Result<String>;

    /// Clone the repository into a fresh, uniquely named directory.
    ///
    /// Fails with `InvalidRepository`, `RepositoryTooLarge` or `CloneFailed`.
    async fn fetch(&self, url: &RepositoryUrl) -> Result<RepositorySnapshot>;
}

/// A chat-style language model provider.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Provider name used in logs and error messages.
    fn provider(&self) -> &'static str;

    /// Send one completion request and return the raw text of the answer.
    ///
    /// Throttling must be reported as `LlmRateLimit`; every other failure as `LlmProvider`.
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// The remote slide-generation service.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait DeckService: Send + Sync {
    /// Render a deck. Deadline overruns must be reported as `DeckServiceTimeout`.
    async fn generate(&self, request: &DeckRequest) -> Result<Artifact>;

    /// Re-export an existing presentation in another format.
    async fn export(&self, presentation_id: &str, export_as: ExportFormat) -> Result<Artifact>;
}

/// Source of "now", injected so expiry and job timestamps are testable.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
