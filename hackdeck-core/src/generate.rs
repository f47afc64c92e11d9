//! Content generator: prompts a language model with the digest and turns its answer
//! into a slide outline of exactly the requested length.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{JobParameters, LlmSettings};
use crate::contract::{CompletionRequest, LanguageModel};
use crate::digest::Digest;
use crate::error::Result;
use crate::outline::{conform, parse_outline, SlideOutline};

pub const SYSTEM_PROMPT: &str = "You are a hackathon presentation expert. You analyze codebases \
and write concise, impactful slide content focused on what judges care about: the problem, \
the solution, the technology and what makes the project stand out. You answer with JSON only.";

const OUTPUT_SCHEMA: &str = r#"{"slides": [{"title": "string", "content": ["string", "..."]}]}"#;

pub struct ContentGenerator {
    model: Arc<dyn LanguageModel>,
    settings: LlmSettings,
}

impl ContentGenerator {
    pub fn new(model: Arc<dyn LanguageModel>, settings: LlmSettings) -> Self {
        Self { model, settings }
    }

    #[must_use]
    pub fn provider(&self) -> &'static str {
        self.model.provider()
    }

    /// The request sent for `digest` and `params`. Deterministic for equal inputs.
    #[must_use]
    pub fn completion_request(&self, digest: &Digest, params: &JobParameters) -> CompletionRequest {
        CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt: build_prompt(digest, params),
            model: self.settings.model.clone(),
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        }
    }

    /// One model call. Rate limits and provider errors are returned as-is for the
    /// coordinator to retry or fail on.
    pub async fn generate(&self, digest: &Digest, params: &JobParameters) -> Result<SlideOutline> {
        let request = self.completion_request(digest, params);
        info!(
            provider = self.model.provider(),
            slide_count = params.slide_count,
            digest_bytes = digest.len(),
            "Requesting slide outline"
        );
        let raw = self.model.complete(&request).await?;
        debug!(response_bytes = raw.len(), "Model answered");
        let slides = parse_outline(&raw)?;
        let returned = slides.len();
        let outline = conform(slides, params.slide_count as usize);
        info!(returned, slides = outline.len(), "Slide outline ready");
        Ok(outline)
    }
}

fn build_prompt(digest: &Digest, params: &JobParameters) -> String {
    format!(
        "Analyze this codebase and write the content of a presentation about it.\n\n\
         CODEBASE STRUCTURE AND CONTENT:\n{digest}\n\n\
         INSTRUCTIONS:\n\
         - Produce exactly {count} slides.\n\
         - Tone: {tone}.\n\
         - Bullet density: {verbosity}.\n\
         - Write all text in {language}.\n\
         - Cover the project name and tagline, the problem, the solution, the tech stack, key features, \
           what is innovative, the architecture, demo highlights and future scope, as far as the slide count allows.\n\
         - Be specific, not generic. Use active voice. Keep it exciting but honest.\n\
         - Do not add a separate title slide or table of contents; they are added automatically.\n\n\
         OUTPUT FORMAT: valid JSON only, no Markdown and no code fences, matching this shape:\n{schema}\n",
        digest = digest.text(),
        count = params.slide_count,
        tone = params.tone.descriptor(),
        verbosity = params.verbosity.descriptor(),
        language = params.language,
        schema = OUTPUT_SCHEMA,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DigestPolicy, GenerationRequest, PipelineSettings, Tone};
    use crate::contract::MockLanguageModel;
    use crate::digest::DigestBuilder;
    use crate::error::PipelineError;

    fn digest() -> Digest {
        let repo = tempfile::tempdir().unwrap();
        std::fs::write(repo.path().join("main.py"), "print('hello hackathon')").unwrap();
        DigestBuilder::new(DigestPolicy::default())
            .unwrap()
            .build(repo.path(), "org/tiny-repo")
            .unwrap()
    }

    fn params(count: u32) -> JobParameters {
        let request = GenerationRequest {
            slide_count: Some(count),
            tone: Some(Tone::Professional),
            ..GenerationRequest::new("https://example.com/org/tiny-repo")
        };
        JobParameters::resolve(&request, &PipelineSettings::default()).unwrap()
    }

    #[test]
    fn prompt_embeds_digest_and_parameters() {
        let generator = ContentGenerator::new(
            Arc::new(MockLanguageModel::new()),
            LlmSettings::default(),
        );
        let request = generator.completion_request(&digest(), &params(6));
        assert!(request.prompt.contains("print('hello hackathon')"));
        assert!(request.prompt.contains("exactly 6 slides"));
        assert!(request.prompt.contains(Tone::Professional.descriptor()));
        assert!(request.prompt.contains("English"));
        assert!(request.prompt.contains("\"slides\""));
        assert_eq!(request.max_tokens, 4000);
        assert!((request.temperature - 0.7).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn undershoot_is_padded_to_requested_count() {
        let mut model = MockLanguageModel::new();
        model.expect_provider().return_const("claude");
        model.expect_complete().times(1).returning(|_| {
            Ok(r#"{"slides":[{"title":"Intro","content":["a"]},{"title":"Stack","content":["Rust"]}]}"#.into())
        });
        let generator = ContentGenerator::new(Arc::new(model), LlmSettings::default());
        let outline = generator.generate(&digest(), &params(5)).await.unwrap();
        assert_eq!(outline.len(), 5);
        assert_eq!(outline.slides()[2].title, "Summary");
    }

    #[tokio::test]
    async fn garbage_answer_is_malformed() {
        let mut model = MockLanguageModel::new();
        model.expect_provider().return_const("openai");
        model
            .expect_complete()
            .returning(|_| Ok("Sorry, I can't do that".into()));
        let generator = ContentGenerator::new(Arc::new(model), LlmSettings::default());
        let err = generator.generate(&digest(), &params(5)).await.unwrap_err();
        assert!(matches!(err, PipelineError::MalformedLlmResponse { .. }));
    }
}
