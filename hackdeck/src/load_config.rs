//! Configuration loading for the hackdeck binary.
//!
//! Settings come from three layers, later layers winning:
//! 1. [`PipelineSettings::default`]
//! 2. an optional YAML file (every key optional, same shape as `PipelineSettings`
//!    plus a top-level `log_level`)
//! 3. environment variables (`.env` is loaded by `main` before this runs)
//!
//! Credentials are never read from the YAML file, only from the environment.
//!
//! # Example YAML
//! ```yaml
//! temp_repo_dir: /var/tmp/hackdeck
//! max_repo_size_mb: 200
//! default_slide_count: 10
//! cache:
//!   enabled: true
//!   expiry_hours: 6
//! llm:
//!   model: claude-3-5-sonnet-latest
//! deck:
//!   api_url: http://presenton:5000
//! log_level: debug
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use hackdeck_core::config::PipelineSettings;
use hackdeck_core::llm::ProviderCredentials;
use serde::Deserialize;
use tracing::{error, info};

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(flatten)]
    settings: PipelineSettings,
    #[serde(default)]
    log_level: Option<String>,
}

/// Secrets for the outbound services. Never logged.
#[derive(Clone, Default)]
pub struct Credentials {
    pub providers: ProviderCredentials,
    pub presenton_api_key: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("providers", &self.providers)
            .field("presenton_api_key", &self.presenton_api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub settings: PipelineSettings,
    pub log_level: Option<String>,
    pub credentials: Credentials,
}

/// Load settings from `path` (if given), apply environment overrides and validate.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let file = match path {
        Some(path) => read_config_file(path)?,
        None => ConfigFile::default(),
    };
    let mut config = AppConfig {
        settings: file.settings,
        log_level: file.log_level,
        credentials: Credentials::default(),
    };
    apply_env_overrides(&mut config)?;
    config.credentials = credentials_from_env();
    config
        .settings
        .validate()
        .context("Configuration failed validation")?;
    Ok(config)
}

/// Log level to start tracing with, before the full configuration is loaded:
/// `LOG_LEVEL`, then the file's `log_level`. Unreadable files are reported later by
/// [`load_config`].
pub fn configured_log_level(path: Option<&Path>) -> Option<String> {
    env_var("LOG_LEVEL").or_else(|| {
        let contents = std::fs::read_to_string(path?).ok()?;
        serde_yaml::from_str::<ConfigFile>(&contents).ok()?.log_level
    })
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let path_display = path.display();
    let contents = std::fs::read_to_string(path).map_err(|e| {
        error!(path = %path_display, error = %e, "Failed to read config file");
        anyhow!("Failed to read config file '{}': {}", path_display, e)
    })?;
    info!(path = %path_display, "Read config file");

    // An empty file is valid and means "all defaults".
    if contents.trim().is_empty() {
        return Ok(ConfigFile::default());
    }
    let parsed: ConfigFile = serde_yaml::from_str(&contents).map_err(|e| {
        error!(path = %path_display, error = %e, "Failed to parse config file");
        anyhow!("Failed to parse config file '{}': {}", path_display, e)
    })?;
    info!(path = %path_display, "Parsed config file");
    Ok(parsed)
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env_var(name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("Invalid value for {name} ('{raw}'): {e}")),
        None => Ok(None),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(raw) = env_var(name) else {
        return Ok(None);
    };
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(Some(true)),
        "false" | "0" | "no" | "off" => Ok(Some(false)),
        _ => bail!("Invalid value for {name} ('{raw}'): expected true or false"),
    }
}

fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    let settings = &mut config.settings;
    if let Some(dir) = env_var("TEMP_REPO_DIR") {
        settings.temp_repo_dir = PathBuf::from(dir);
    }
    if let Some(mb) = env_parse("MAX_REPO_SIZE_MB")? {
        settings.max_repo_size_mb = mb;
    }
    if let Some(count) = env_parse("DEFAULT_SLIDE_COUNT")? {
        settings.default_slide_count = count;
    }
    if let Some(cleanup) = env_bool("CLEANUP_AFTER_GENERATION")? {
        settings.cleanup_after_generation = cleanup;
    }
    if let Some(enabled) = env_bool("ENABLE_DIGEST_CACHE")? {
        settings.cache.enabled = enabled;
    }
    if let Some(hours) = env_parse("CACHE_EXPIRY_HOURS")? {
        settings.cache.expiry_hours = hours;
    }
    if let Some(model) = env_var("LLM_MODEL") {
        settings.llm.model = Some(model);
    }
    if let Some(max_tokens) = env_parse("LLM_MAX_TOKENS")? {
        settings.llm.max_tokens = max_tokens;
    }
    if let Some(temperature) = env_parse("LLM_TEMPERATURE")? {
        settings.llm.temperature = temperature;
    }
    if let Some(url) = env_var("PRESENTON_API_URL") {
        settings.deck.api_url = url;
    }
    if let Some(level) = env_var("LOG_LEVEL") {
        config.log_level = Some(level);
    }
    Ok(())
}

fn credentials_from_env() -> Credentials {
    Credentials {
        providers: ProviderCredentials {
            anthropic_api_key: env_var("ANTHROPIC_API_KEY"),
            openai_api_key: env_var("OPENAI_API_KEY"),
        },
        presenton_api_key: env_var("PRESENTON_API_KEY"),
    }
}
