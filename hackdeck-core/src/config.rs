use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};

/// Smallest deck a request may ask for.
pub const MIN_SLIDES: u32 = 5;
/// Largest deck a request may ask for.
pub const MAX_SLIDES: u32 = 15;

/// Upper bound for hour-based windows (one century).
const MAX_WINDOW_HOURS: u64 = 876_000;

fn hours(h: u64) -> chrono::Duration {
    chrono::Duration::hours(i64::try_from(h.min(MAX_WINDOW_HOURS)).unwrap_or(0))
}

/// Process-wide pipeline settings. Every field has a default so partial YAML files load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub temp_repo_dir: PathBuf,
    pub max_repo_size_mb: u64,
    pub default_slide_count: u32,
    pub cleanup_after_generation: bool,
    pub clone_timeout_secs: u64,
    pub digest_timeout_secs: u64,
    /// URL schemes accepted for repositories.
    pub allowed_schemes: Vec<String>,
    /// Hosts accepted for repositories; empty accepts any host.
    pub allowed_hosts: Vec<String>,
    /// How long finished job records stay queryable.
    pub job_retention_hours: u64,
    pub cache: CacheSettings,
    pub digest: DigestPolicy,
    pub llm: LlmSettings,
    pub deck: DeckSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            temp_repo_dir: PathBuf::from("./temp_repos"),
            max_repo_size_mb: 500,
            default_slide_count: 8,
            cleanup_after_generation: true,
            clone_timeout_secs: 300,
            digest_timeout_secs: 300,
            allowed_schemes: vec!["https".into(), "http".into()],
            allowed_hosts: Vec::new(),
            job_retention_hours: 24,
            cache: CacheSettings::default(),
            digest: DigestPolicy::default(),
            llm: LlmSettings::default(),
            deck: DeckSettings::default(),
        }
    }
}

impl PipelineSettings {
    pub fn trace_loaded(&self) {
        info!(
            temp_repo_dir = %self.temp_repo_dir.display(),
            max_repo_size_mb = self.max_repo_size_mb,
            default_slide_count = self.default_slide_count,
            cleanup_after_generation = self.cleanup_after_generation,
            cache_enabled = self.cache.enabled,
            "Loaded pipeline settings"
        );
        debug!(?self, "Pipeline settings loaded (full debug)");
    }

    #[must_use]
    pub const fn max_repo_size_bytes(&self) -> u64 {
        self.max_repo_size_mb * 1024 * 1024
    }

    #[must_use]
    pub const fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs)
    }

    #[must_use]
    pub const fn digest_timeout(&self) -> Duration {
        Duration::from_secs(self.digest_timeout_secs)
    }

    #[must_use]
    pub fn job_retention(&self) -> chrono::Duration {
        hours(self.job_retention_hours)
    }

    /// Checks cross-field constraints once, at startup.
    pub fn validate(&self) -> Result<()> {
        if self.max_repo_size_mb == 0 {
            return Err(PipelineError::config("max_repo_size_mb must be positive"));
        }
        if !(MIN_SLIDES..=MAX_SLIDES).contains(&self.default_slide_count) {
            return Err(PipelineError::config(format!(
                "default_slide_count must be between {MIN_SLIDES} and {MAX_SLIDES}, got {}",
                self.default_slide_count
            )));
        }
        if self.allowed_schemes.is_empty() {
            return Err(PipelineError::config("allowed_schemes must not be empty"));
        }
        self.digest.validate()?;
        self.llm.validate()?;
        self.deck.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub expiry_hours: u64,
    pub max_entries: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            expiry_hours: 24,
            max_entries: 256,
        }
    }
}

impl CacheSettings {
    #[must_use]
    pub fn expiry(&self) -> chrono::Duration {
        hours(self.expiry_hours)
    }
}

/// Layout of the rendered digest text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestFormat {
    #[default]
    Markdown,
    Text,
}

/// What the digest builder walks and how much of it it keeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DigestPolicy {
    pub max_depth: usize,
    pub output_format: DigestFormat,
    /// Glob patterns matched against entry names and repository-relative paths.
    pub ignore_patterns: Vec<String>,
    pub max_file_bytes: usize,
    pub max_total_bytes: usize,
}

impl Default for DigestPolicy {
    fn default() -> Self {
        Self {
            max_depth: 10,
            output_format: DigestFormat::Markdown,
            ignore_patterns: default_ignore_patterns(),
            max_file_bytes: 10 * 1024,
            max_total_bytes: 50_000,
        }
    }
}

impl DigestPolicy {
    /// Smallest aggregate size that still fits a header and the truncation marker.
    pub const MIN_TOTAL_BYTES: usize = 1024;

    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            return Err(PipelineError::config("digest.max_depth must be positive"));
        }
        if self.max_file_bytes == 0 {
            return Err(PipelineError::config("digest.max_file_bytes must be positive"));
        }
        if self.max_total_bytes < Self::MIN_TOTAL_BYTES {
            return Err(PipelineError::config(format!(
                "digest.max_total_bytes must be at least {}",
                Self::MIN_TOTAL_BYTES
            )));
        }
        Ok(())
    }
}

/// Patterns excluded from every digest unless the policy overrides them: VCS metadata,
/// dependency and build directories, lockfiles, binaries and secrets-bearing files.
#[must_use]
pub fn default_ignore_patterns() -> Vec<String> {
    [
        ".git", ".svn", ".hg", ".gitignore",
        "node_modules", "bower_components", "vendor", "target", "build", "dist", "out",
        "__pycache__", "*.pyc", "*.pyo", "*.pyd", "*.egg-info",
        "venv", ".venv", "env", ".idea", ".vscode",
        ".env", ".env.*", "*.env", "credentials*", "*.pem", "*.key", "*.p12", "id_rsa*",
        "id_ed25519*", ".npmrc", ".pypirc",
        "*.log", "*.bak", "*.swp", "*.tmp", ".DS_Store", "Thumbs.db",
        "*.so", "*.dylib", "*.dll", "*.exe", "*.o", "*.a", "*.class", "*.jar",
        "package-lock.json", "yarn.lock", "pnpm-lock.yaml", "poetry.lock", "Cargo.lock",
        "Gemfile.lock", "composer.lock", "go.sum",
        "*.min.js", "*.map",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetrySettings {
    /// Delay before retry number `attempt` (1-based), doubling from the initial backoff.
    #[must_use]
    pub fn backoff(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.initial_backoff_ms.saturating_mul(1u64 << exp);
        let delay = Duration::from_millis(base.min(self.max_backoff_ms));
        let cap = Duration::from_millis(self.max_backoff_ms);
        hint.map_or(delay, |h| h.max(delay).min(cap))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// Model identifier; each provider falls back to its own default when unset.
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
    pub retry: RetrySettings,
    pub anthropic_base_url: String,
    pub openai_base_url: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 4000,
            temperature: 0.7,
            timeout_secs: 120,
            retry: RetrySettings::default(),
            anthropic_base_url: "https://api.anthropic.com".into(),
            openai_base_url: "https://api.openai.com".into(),
        }
    }
}

impl LlmSettings {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(PipelineError::config("llm.max_tokens must be positive"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(PipelineError::config(format!(
                "llm.temperature must be within 0.0..=2.0, got {}",
                self.temperature
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::config("llm.retry.max_attempts must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeckSettings {
    pub api_url: String,
    pub tone: Tone,
    pub verbosity: Verbosity,
    pub template: String,
    pub include_title_slide: bool,
    pub include_table_of_contents: bool,
    pub export_as: ExportFormat,
    pub language: String,
    pub timeout_secs: u64,
    pub web_search: bool,
    pub image_type: String,
    /// Free-form styling instructions forwarded to the deck service.
    pub instructions: String,
}

impl Default for DeckSettings {
    fn default() -> Self {
        Self {
            api_url: "https://api.presenton.ai".into(),
            tone: Tone::Professional,
            verbosity: Verbosity::Concise,
            template: "general".into(),
            include_title_slide: true,
            include_table_of_contents: false,
            export_as: ExportFormat::Pptx,
            language: "English".into(),
            timeout_secs: 180,
            web_search: false,
            image_type: "stock".into(),
            instructions: "Create a modern, visually engaging presentation.\n\
                - Use bold colors and clean layouts\n\
                - Include relevant icons where appropriate\n\
                - Keep text minimal and impactful\n\
                - Focus on visual hierarchy\n"
                .into(),
        }
    }
}

impl DeckSettings {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_url.trim().is_empty() {
            return Err(PipelineError::config("deck.api_url must not be empty"));
        }
        if self.template.trim().is_empty() {
            return Err(PipelineError::config("deck.template must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Default,
    Casual,
    #[default]
    Professional,
    Funny,
    Educational,
    SalesPitch,
}

impl Tone {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Casual => "casual",
            Self::Professional => "professional",
            Self::Funny => "funny",
            Self::Educational => "educational",
            Self::SalesPitch => "sales_pitch",
        }
    }

    /// Wording used in the LLM prompt.
    #[must_use]
    pub const fn descriptor(self) -> &'static str {
        match self {
            Self::Default => "neutral and clear",
            Self::Casual => "relaxed and conversational, as if talking to fellow developers",
            Self::Professional => "formal, confident and precise, suitable for judges or stakeholders",
            Self::Funny => "light-hearted and witty without losing technical accuracy",
            Self::Educational => "explanatory, introducing concepts step by step for learners",
            Self::SalesPitch => "persuasive and benefit-driven, emphasising impact and value",
        }
    }
}

impl fmt::Display for Tone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tone {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "casual" => Ok(Self::Casual),
            "professional" => Ok(Self::Professional),
            "funny" => Ok(Self::Funny),
            "educational" => Ok(Self::Educational),
            "sales_pitch" | "sales-pitch" => Ok(Self::SalesPitch),
            other => Err(PipelineError::config(format!(
                "Tone must be one of: default, casual, professional, funny, educational, sales_pitch (got '{other}')"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Verbosity {
    #[default]
    #[serde(rename = "concise")]
    Concise,
    #[serde(rename = "standard")]
    Standard,
    #[serde(rename = "text-heavy")]
    TextHeavy,
}

impl Verbosity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Concise => "concise",
            Self::Standard => "standard",
            Self::TextHeavy => "text-heavy",
        }
    }

    #[must_use]
    pub const fn descriptor(self) -> &'static str {
        match self {
            Self::Concise => "2 to 3 short bullet points per slide, at most 12 words each",
            Self::Standard => "3 to 5 bullet points per slide, one sentence each",
            Self::TextHeavy => "4 to 6 detailed bullet points per slide, up to two sentences each",
        }
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verbosity {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "concise" => Ok(Self::Concise),
            "standard" => Ok(Self::Standard),
            "text-heavy" | "text_heavy" => Ok(Self::TextHeavy),
            other => Err(PipelineError::config(format!(
                "Verbosity must be one of: concise, standard, text-heavy (got '{other}')"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Pptx,
    Pdf,
}

impl ExportFormat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pptx => "pptx",
            Self::Pdf => "pdf",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pptx" => Ok(Self::Pptx),
            "pdf" => Ok(Self::Pdf),
            other => Err(PipelineError::config(format!(
                "Export format must be 'pptx' or 'pdf' (got '{other}')"
            ))),
        }
    }
}

/// Inbound "submit generation request". Unset fields fall back to the settings defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationRequest {
    #[serde(alias = "github_url")]
    pub repo_url: String,
    #[serde(default, alias = "n_slides")]
    pub slide_count: Option<u32>,
    #[serde(default)]
    pub tone: Option<Tone>,
    #[serde(default)]
    pub verbosity: Option<Verbosity>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub export_as: Option<ExportFormat>,
    #[serde(default)]
    pub include_title_slide: Option<bool>,
    #[serde(default)]
    pub include_table_of_contents: Option<bool>,
}

impl GenerationRequest {
    pub fn new(repo_url: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            ..Self::default()
        }
    }
}

/// Fully resolved, validated parameters of one job. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    pub slide_count: u32,
    pub tone: Tone,
    pub verbosity: Verbosity,
    pub template: String,
    pub language: String,
    pub export_as: ExportFormat,
    pub include_title_slide: bool,
    pub include_table_of_contents: bool,
}

impl JobParameters {
    pub fn resolve(request: &GenerationRequest, settings: &PipelineSettings) -> Result<Self> {
        let slide_count = request.slide_count.unwrap_or(settings.default_slide_count);
        if !(MIN_SLIDES..=MAX_SLIDES).contains(&slide_count) {
            return Err(PipelineError::config(format!(
                "slide count must be between {MIN_SLIDES} and {MAX_SLIDES}, got {slide_count}"
            )));
        }
        let template = request
            .template
            .clone()
            .unwrap_or_else(|| settings.deck.template.clone());
        if template.trim().is_empty() {
            return Err(PipelineError::config("template must not be empty"));
        }
        let language = request
            .language
            .clone()
            .unwrap_or_else(|| settings.deck.language.clone());
        if language.trim().is_empty() {
            return Err(PipelineError::config("language must not be empty"));
        }
        Ok(Self {
            slide_count,
            tone: request.tone.unwrap_or(settings.deck.tone),
            verbosity: request.verbosity.unwrap_or(settings.deck.verbosity),
            template,
            language,
            export_as: request.export_as.unwrap_or(settings.deck.export_as),
            include_title_slide: request
                .include_title_slide
                .unwrap_or(settings.deck.include_title_slide),
            include_table_of_contents: request
                .include_table_of_contents
                .unwrap_or(settings.deck.include_table_of_contents),
        })
    }
}
