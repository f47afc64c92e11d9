//! Deck builder: translates a slide outline into a Presenton request and returns the
//! artifact locations.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::{DeckSettings, ExportFormat, JobParameters, Tone, Verbosity};
use crate::contract::{Artifact, DeckService};
use crate::error::{PipelineError, Result};
use crate::outline::SlideOutline;

/// Body of `POST /api/v1/ppt/presentation/generate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeckRequest {
    pub content: String,
    pub instructions: String,
    pub tone: Tone,
    pub verbosity: Verbosity,
    pub n_slides: u32,
    pub language: String,
    pub template: String,
    pub include_title_slide: bool,
    pub include_table_of_contents: bool,
    pub export_as: ExportFormat,
    pub markdown_emphasis: bool,
    pub web_search: bool,
    pub image_type: String,
}

/// Combines an outline with the job's formatting parameters and hands it to a [`DeckService`].
pub struct DeckBuilder {
    service: Arc<dyn DeckService>,
    settings: DeckSettings,
}

impl DeckBuilder {
    pub fn new(service: Arc<dyn DeckService>, settings: DeckSettings) -> Self {
        Self { service, settings }
    }

    #[must_use]
    pub fn request(&self, outline: &SlideOutline, params: &JobParameters) -> DeckRequest {
        DeckRequest {
            content: outline.to_markdown(),
            instructions: self.settings.instructions.clone(),
            tone: params.tone,
            verbosity: params.verbosity,
            n_slides: u32::try_from(outline.len()).unwrap_or(params.slide_count),
            language: params.language.clone(),
            template: params.template.clone(),
            include_title_slide: params.include_title_slide,
            include_table_of_contents: params.include_table_of_contents,
            export_as: params.export_as,
            markdown_emphasis: true,
            web_search: self.settings.web_search,
            image_type: self.settings.image_type.clone(),
        }
    }

    /// One attempt against the deck service.
    pub async fn build(&self, outline: &SlideOutline, params: &JobParameters) -> Result<Artifact> {
        let request = self.request(outline, params);
        self.service.generate(&request).await
    }

    pub async fn export(&self, presentation_id: &str, export_as: ExportFormat) -> Result<Artifact> {
        self.service.export(presentation_id, export_as).await
    }
}

#[derive(Debug, Deserialize)]
struct PresentonResponse {
    presentation_id: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    edit_path: Option<String>,
    #[serde(default)]
    credits_consumed: Option<f64>,
}

#[derive(Serialize)]
struct ExportRequest<'a> {
    id: &'a str,
    export_as: ExportFormat,
}

/// Presenton HTTP API client.
pub struct PresentonClient {
    client: Client,
    base: Url,
    api_key: Option<String>,
    timeout: Duration,
}

impl PresentonClient {
    pub fn new(settings: &DeckSettings, api_key: Option<String>) -> Result<Self> {
        let mut raw = settings.api_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw)
            .map_err(|e| PipelineError::config(format!("invalid deck.api_url '{raw}': {e}")))?;
        let client = Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| PipelineError::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            timeout: settings.timeout(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| PipelineError::internal(format!("bad endpoint {path}: {e}")))
    }

    /// Absolute URLs are kept; relative paths are resolved against the API base.
    fn resolve(&self, path: &str) -> Result<String> {
        if let Ok(url) = Url::parse(path) {
            return Ok(url.into());
        }
        self.base
            .join(path)
            .map(Into::into)
            .map_err(|e| PipelineError::deck(None, format!("unusable artifact path '{path}': {e}")))
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
        export_as: ExportFormat,
    ) -> Result<Artifact> {
        let url = self.endpoint(path)?;
        let mut request = self.client.post(url.clone()).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                error!(url = %url, timeout_secs = self.timeout.as_secs(), "Deck service request timed out");
                PipelineError::DeckServiceTimeout {
                    after: self.timeout,
                }
            } else {
                error!(url = %url, error = %e, "Deck service request failed");
                PipelineError::deck(None, format!("failed to connect: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            error!(url = %url, status = status.as_u16(), detail = %detail, "Deck service returned an error");
            return Err(PipelineError::deck(
                Some(status.as_u16()),
                if detail.is_empty() { "No error details".to_string() } else { detail },
            ));
        }
        let parsed: PresentonResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                PipelineError::DeckServiceTimeout {
                    after: self.timeout,
                }
            } else {
                PipelineError::deck(Some(status.as_u16()), format!("unusable response body: {e}"))
            }
        })?;
        self.artifact(parsed, export_as)
    }

    fn artifact(&self, parsed: PresentonResponse, export_format: ExportFormat) -> Result<Artifact> {
        let path = parsed
            .path
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| PipelineError::deck(None, "response has no download path"))?;
        let artifact = Artifact {
            download_url: self.resolve(&path)?,
            edit_url: parsed
                .edit_path
                .filter(|p| !p.trim().is_empty())
                .map(|p| self.resolve(&p))
                .transpose()?,
            presentation_id: parsed.presentation_id,
            export_format,
            credits_consumed: parsed.credits_consumed,
        };
        info!(
            presentation_id = %artifact.presentation_id,
            download_url = %artifact.download_url,
            "Presentation generated"
        );
        Ok(artifact)
    }
}

#[async_trait::async_trait]
impl DeckService for PresentonClient {
    async fn generate(&self, request: &DeckRequest) -> Result<Artifact> {
        info!(n_slides = request.n_slides, template = %request.template, export_as = %request.export_as, "Requesting presentation");
        self.post("api/v1/ppt/presentation/generate", request, request.export_as)
            .await
    }

    async fn export(&self, presentation_id: &str, export_as: ExportFormat) -> Result<Artifact> {
        info!(presentation_id, export_as = %export_as, "Exporting presentation");
        self.post(
            "api/v1/ppt/presentation/export",
            &ExportRequest {
                id: presentation_id,
                export_as,
            },
            export_as,
        )
        .await
    }
}
