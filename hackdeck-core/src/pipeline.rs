//! Pipeline coordinator: runs one generation job from repository URL to deck artifact.
//!
//! A job walks `CREATED → CLONING → DIGESTING → GENERATING_CONTENT → BUILDING_DECK →
//! COMPLETED`, or ends in `FAILED` / `CANCELLED` from any live state.
//!
//! # Responsibilities
//! - Validate the request before a job exists ([`Coordinator::create_job`]).
//! - Run the stages strictly in sequence, each under its own timeout.
//! - Retry within a stage: rate-limited model calls with capped exponential backoff,
//!   deck-service timeouts once.
//! - Check the cancellation token at every stage boundary and between retries.
//! - Release the repository snapshot whatever the outcome; cleanup errors are logged only.
//! - Publish a job snapshot after every change to an optional `watch` channel.
//!
//! # Digest cache
//! With a [`DigestCache`], `CLONING` first resolves the remote commit. A cached digest for
//! (URL, commit) skips the clone entirely and `DIGESTING` reuses it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{DigestCache, DigestCacheKey};
use crate::config::{GenerationRequest, JobParameters, PipelineSettings};
use crate::contract::{Artifact, Clock, DeckService, LanguageModel, RepositoryFetcher};
use crate::deck::DeckBuilder;
use crate::digest::{Digest, DigestBuilder};
use crate::download::{RepositorySnapshot, RepositoryUrl};
use crate::error::{PipelineError, Result};
use crate::generate::ContentGenerator;
use crate::job::{GenerationJob, JobState};
use crate::outline::SlideOutline;

/// Attempts allowed when the deck service times out.
const DECK_ATTEMPTS: u32 = 2;

pub struct Coordinator {
    settings: PipelineSettings,
    fetcher: Arc<dyn RepositoryFetcher>,
    generator: ContentGenerator,
    deck: DeckBuilder,
    digests: Arc<DigestBuilder>,
    cache: Option<Arc<DigestCache>>,
    clock: Arc<dyn Clock>,
}

/// Mutable state of one execution: the job record, its observer and the snapshot it owns.
struct Run<'a> {
    job: GenerationJob,
    observer: Option<&'a watch::Sender<GenerationJob>>,
    snapshot: Option<RepositorySnapshot>,
}

impl Run<'_> {
    fn publish(&self) {
        if let Some(tx) = self.observer {
            tx.send_replace(self.job.clone());
        }
    }
}

async fn bounded<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T>>,
    on_timeout: impl FnOnce() -> PipelineError,
) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or_else(|_| Err(on_timeout()))
}

impl Coordinator {
    /// Build a coordinator. A digest cache is created when `settings.cache.enabled` is set.
    pub fn new(
        settings: PipelineSettings,
        fetcher: Arc<dyn RepositoryFetcher>,
        model: Arc<dyn LanguageModel>,
        deck: Arc<dyn DeckService>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        settings.validate()?;
        let digests = Arc::new(DigestBuilder::new(settings.digest.clone())?);
        let cache = settings
            .cache
            .enabled
            .then(|| Arc::new(DigestCache::new(&settings.cache, Arc::clone(&clock))));
        Ok(Self {
            generator: ContentGenerator::new(model, settings.llm.clone()),
            deck: DeckBuilder::new(deck, settings.deck.clone()),
            fetcher,
            digests,
            cache,
            clock,
            settings,
        })
    }

    /// Share an existing cache instead of the one built from settings.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<DigestCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    #[must_use]
    pub fn cache(&self) -> Option<&Arc<DigestCache>> {
        self.cache.as_ref()
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn parse_url(&self, raw: &str) -> Result<RepositoryUrl> {
        RepositoryUrl::parse_with(
            raw,
            &self.settings.allowed_schemes,
            &self.settings.allowed_hosts,
        )
    }

    /// Validate a request and create its job in `CREATED`. Invalid input never yields a job.
    pub fn create_job(&self, request: &GenerationRequest) -> Result<GenerationJob> {
        let url = self.parse_url(&request.repo_url)?;
        let params = JobParameters::resolve(request, &self.settings)?;
        let job = GenerationJob::new(url.as_str(), params, self.clock.now());
        info!(job_id = %job.id, repo_url = %job.repo_url, slide_count = job.params.slide_count, "[PIPELINE] Job created");
        Ok(job)
    }

    /// Synchronous path: create, run and unwrap one job.
    pub async fn generate(&self, request: &GenerationRequest) -> Result<Artifact> {
        self.generate_job(request).await.map(|(_, artifact)| artifact)
    }

    /// Like [`generate`](Self::generate), also handing back the finished job record.
    pub async fn generate_job(&self, request: &GenerationRequest) -> Result<(GenerationJob, Artifact)> {
        let job = self.create_job(request)?;
        let (job, result) = self.run(job, &CancellationToken::new(), None).await;
        result.map(|artifact| (job, artifact))
    }

    /// Run `job` to a terminal state. The returned job is always terminal.
    pub async fn execute(
        &self,
        job: GenerationJob,
        cancel: &CancellationToken,
        observer: Option<&watch::Sender<GenerationJob>>,
    ) -> GenerationJob {
        self.run(job, cancel, observer).await.0
    }

    async fn run(
        &self,
        job: GenerationJob,
        cancel: &CancellationToken,
        observer: Option<&watch::Sender<GenerationJob>>,
    ) -> (GenerationJob, Result<Artifact>) {
        let mut run = Run {
            job,
            observer,
            snapshot: None,
        };
        info!(job_id = %run.job.id, repo_url = %run.job.repo_url, "[PIPELINE] Starting job");
        let result = self.stages(&mut run, cancel).await;

        let now = self.clock.now();
        let recorded = match &result {
            Ok(artifact) => run.job.complete(artifact.clone(), now),
            Err(PipelineError::Cancelled) => run.job.cancel(now),
            Err(e) => run.job.fail(e, now),
        };
        if let Err(e) = recorded {
            // Only reachable if a stage already moved the job to a terminal state.
            error!(job_id = %run.job.id, error = %e, "[PIPELINE] Could not record job outcome");
        }
        match &result {
            Ok(artifact) => info!(job_id = %run.job.id, download_url = %artifact.download_url, "[PIPELINE] Job completed"),
            Err(PipelineError::Cancelled) => warn!(job_id = %run.job.id, "[PIPELINE] Job cancelled"),
            Err(e) => error!(job_id = %run.job.id, kind = %e.kind(), error = %e, "[PIPELINE][ERROR] Job failed"),
        }

        self.release(&run.job, run.snapshot.take());
        run.publish();
        (run.job, result)
    }

    /// Cleanup on every outcome, except a completed job with cleanup disabled keeps its snapshot.
    fn release(&self, job: &GenerationJob, snapshot: Option<RepositorySnapshot>) {
        let Some(snapshot) = snapshot else {
            return;
        };
        if job.state() == JobState::Completed && !self.settings.cleanup_after_generation {
            let path = snapshot.persist();
            info!(job_id = %job.id, path = %path.display(), "Retaining repository snapshot");
            return;
        }
        let path = snapshot.path().to_path_buf();
        match snapshot.cleanup() {
            Ok(()) => info!(job_id = %job.id, path = %path.display(), "Cleaned up repository snapshot"),
            Err(e) => error!(job_id = %job.id, path = %path.display(), error = ?e, "Failed to clean up repository snapshot"),
        }
    }

    fn enter(&self, run: &mut Run<'_>, state: JobState, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        run.job.transition(state, self.clock.now())?;
        run.publish();
        Ok(())
    }

    async fn stages(&self, run: &mut Run<'_>, cancel: &CancellationToken) -> Result<Artifact> {
        let url = self.parse_url(&run.job.repo_url)?;

        self.enter(run, JobState::Cloning, cancel)?;
        let cached = self.acquire(run, &url).await?;

        self.enter(run, JobState::Digesting, cancel)?;
        let digest = match cached {
            Some(digest) => digest,
            None => self.digest(run, &url).await?,
        };

        self.enter(run, JobState::GeneratingContent, cancel)?;
        let outline = self.outline(run, &digest, cancel).await?;

        self.enter(run, JobState::BuildingDeck, cancel)?;
        let artifact = self.render(run, &outline, cancel).await?;

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(artifact)
    }

    /// CLONING: serve from cache when possible, otherwise clone into a fresh snapshot.
    async fn acquire(&self, run: &mut Run<'_>, url: &RepositoryUrl) -> Result<Option<Arc<Digest>>> {
        let clone_timeout = self.settings.clone_timeout();
        if let Some(cache) = &self.cache {
            let resolved = bounded(clone_timeout, self.fetcher.resolve_reference(url), || {
                PipelineError::clone_failed("resolving the remote reference timed out")
            })
            .await;
            match resolved {
                Ok(commit) => {
                    run.job.commit = Some(commit.clone());
                    if let Some(digest) = cache.get(&DigestCacheKey::new(url.normalized(), &commit)) {
                        info!(job_id = %run.job.id, commit = %commit, "Digest cache hit, skipping clone");
                        run.job.cache_hit = true;
                        run.publish();
                        return Ok(Some(digest));
                    }
                    debug!(job_id = %run.job.id, commit = %commit, "Digest cache miss");
                }
                Err(e) if e.is_validation() => return Err(e),
                Err(e) => {
                    warn!(job_id = %run.job.id, error = %e, "Could not resolve remote reference, cloning without cache");
                }
            }
        }

        let snapshot = bounded(clone_timeout, self.fetcher.fetch(url), || {
            PipelineError::clone_failed(format!(
                "git clone timed out after {}s",
                clone_timeout.as_secs()
            ))
        })
        .await?;
        if run.job.commit.is_none() {
            run.job.commit = snapshot.commit().map(str::to_string);
        }
        info!(
            job_id = %run.job.id,
            path = %snapshot.path().display(),
            size_bytes = snapshot.size_bytes(),
            file_count = snapshot.file_count(),
            "Repository snapshot ready"
        );
        run.snapshot = Some(snapshot);
        run.publish();
        Ok(None)
    }

    /// DIGESTING: build from the snapshot and remember the result when the commit is known.
    async fn digest(&self, run: &mut Run<'_>, url: &RepositoryUrl) -> Result<Arc<Digest>> {
        let path = run
            .snapshot
            .as_ref()
            .map(|s| s.path().to_path_buf())
            .ok_or_else(|| PipelineError::internal("no snapshot to digest"))?;
        let title = format!("{}/{}", url.owner(), url.name());
        let digest = Arc::clone(&self.digests)
            .build_in_background(path, title, self.settings.digest_timeout())
            .await?;
        match (&self.cache, &run.job.commit) {
            (Some(cache), Some(commit)) => {
                Ok(cache.insert(DigestCacheKey::new(url.normalized(), commit), digest))
            }
            _ => Ok(digest),
        }
    }

    /// GENERATING_CONTENT: rate limits are retried with backoff up to `llm.retry.max_attempts`.
    async fn outline(
        &self,
        run: &mut Run<'_>,
        digest: &Digest,
        cancel: &CancellationToken,
    ) -> Result<SlideOutline> {
        let retry = &self.settings.llm.retry;
        let llm_timeout = self.settings.llm.timeout();
        let provider = self.generator.provider();
        let mut attempt = 0;
        loop {
            attempt += 1;
            run.job.attempts.generating_content = attempt;
            run.publish();

            let result = bounded(llm_timeout, self.generator.generate(digest, &run.job.params), || {
                PipelineError::provider(
                    provider,
                    format!("no answer within {}s", llm_timeout.as_secs()),
                )
            })
            .await;
            match result {
                Ok(outline) => {
                    if outline.len() != run.job.params.slide_count as usize {
                        return Err(PipelineError::internal(format!(
                            "outline has {} slides, expected {}",
                            outline.len(),
                            run.job.params.slide_count
                        )));
                    }
                    return Ok(outline);
                }
                Err(PipelineError::LlmRateLimit { retry_after, .. }) if attempt < retry.max_attempts => {
                    let delay = retry.backoff(attempt, retry_after);
                    warn!(
                        job_id = %run.job.id,
                        attempt,
                        max_attempts = retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Rate limited by LLM provider, backing off"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Err(PipelineError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// BUILDING_DECK: a deck-service timeout is retried once.
    async fn render(
        &self,
        run: &mut Run<'_>,
        outline: &SlideOutline,
        cancel: &CancellationToken,
    ) -> Result<Artifact> {
        let deck_timeout = self.settings.deck.timeout();
        let mut attempt = 0;
        loop {
            attempt += 1;
            run.job.attempts.building_deck = attempt;
            run.publish();

            let result = bounded(deck_timeout, self.deck.build(outline, &run.job.params), || {
                PipelineError::DeckServiceTimeout {
                    after: deck_timeout,
                }
            })
            .await;
            match result {
                Err(PipelineError::DeckServiceTimeout { .. }) if attempt < DECK_ATTEMPTS => {
                    warn!(job_id = %run.job.id, attempt, "Deck service timed out, retrying");
                    if cancel.is_cancelled() {
                        return Err(PipelineError::Cancelled);
                    }
                }
                other => return other,
            }
        }
    }
}
