// End-to-end coordinator scenarios with scripted fetcher, model and deck service.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hackdeck_core::config::{ExportFormat, GenerationRequest, PipelineSettings, Tone};
use hackdeck_core::contract::{
    Artifact, MockDeckService, MockLanguageModel, MockRepositoryFetcher, SystemClock,
};
use hackdeck_core::deck::DeckRequest;
use hackdeck_core::download::RepositorySnapshot;
use hackdeck_core::error::{ErrorKind, PipelineError};
use hackdeck_core::job::JobState;
use hackdeck_core::pipeline::Coordinator;
use tempfile::{tempdir, TempDir};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const TINY_REPO: &str = "https://example.com/org/tiny-repo";

/// Writes the three-file, ~120 KB "tiny-repo" into a fresh directory under `root`.
fn tiny_repo(root: &Path) -> PathBuf {
    let repo = root.join(format!("org_tiny-repo-{}", uuid::Uuid::new_v4().simple()));
    fs::create_dir_all(repo.join("src")).unwrap();
    fs::write(repo.join("README.md"), "# tiny-repo\nTurns coffee into code.\n").unwrap();
    fs::write(repo.join("src/app.py"), "def main():\n    print('hello')\n").unwrap();
    fs::write(repo.join("src/data.csv"), "a,b\n".repeat(30 * 1024)).unwrap();
    repo
}

fn slides_json(n: usize) -> String {
    let slides: Vec<String> = (1..=n)
        .map(|i| format!(r#"{{"title":"Slide {i}","content":["point {i}"]}}"#))
        .collect();
    format!(r#"{{"slides":[{}]}}"#, slides.join(","))
}

fn artifact(request: &DeckRequest) -> Artifact {
    Artifact {
        presentation_id: "pres-1".into(),
        download_url: "https://api.presenton.ai/static/pres-1.pptx".into(),
        edit_url: Some("https://presenton.ai/edit/pres-1".into()),
        export_format: request.export_as,
        credits_consumed: Some(2.0),
    }
}

fn settings() -> PipelineSettings {
    let mut settings = PipelineSettings::default();
    settings.llm.retry.initial_backoff_ms = 1;
    settings.llm.retry.max_backoff_ms = 5;
    settings
}

fn request() -> GenerationRequest {
    GenerationRequest {
        slide_count: Some(5),
        tone: Some(Tone::Professional),
        ..GenerationRequest::new(TINY_REPO)
    }
}

/// Fetcher that hands out a new tiny-repo snapshot per call.
fn fetcher_for(root: &TempDir, times: usize) -> MockRepositoryFetcher {
    let root = root.path().to_path_buf();
    let mut fetcher = MockRepositoryFetcher::new();
    fetcher.expect_fetch().times(times).returning(move |_| {
        let path = tiny_repo(&root);
        Ok(RepositorySnapshot::new(path, 120 * 1024, 3, Some("abc123".into())))
    });
    fetcher
}

fn model_answering(answer: String, times: usize) -> MockLanguageModel {
    let mut model = MockLanguageModel::new();
    model.expect_provider().return_const("claude");
    model
        .expect_complete()
        .times(times)
        .returning(move |_| Ok(answer.clone()));
    model
}

fn deck_succeeding(times: usize) -> MockDeckService {
    let mut deck = MockDeckService::new();
    deck.expect_generate()
        .times(times)
        .returning(|req| Ok(artifact(req)));
    deck
}

fn coordinator(
    settings: PipelineSettings,
    fetcher: MockRepositoryFetcher,
    model: MockLanguageModel,
    deck: MockDeckService,
) -> Coordinator {
    Coordinator::new(
        settings,
        Arc::new(fetcher),
        Arc::new(model),
        Arc::new(deck),
        Arc::new(SystemClock),
    )
    .unwrap()
}

fn residual_entries(dir: &Path) -> usize {
    fs::read_dir(dir).map(|rd| rd.count()).unwrap_or(0)
}

#[tokio::test]
async fn tiny_repo_runs_through_every_state_and_cleans_up() {
    let work = tempdir().unwrap();
    let coordinator = coordinator(
        settings(),
        fetcher_for(&work, 1),
        model_answering(slides_json(5), 1),
        deck_succeeding(1),
    );

    let job = coordinator.create_job(&request()).unwrap();
    let (tx, mut rx) = watch::channel(job.clone());
    let job = coordinator
        .execute(job, &CancellationToken::new(), Some(&tx))
        .await;

    assert_eq!(
        job.states(),
        [
            JobState::Created,
            JobState::Cloning,
            JobState::Digesting,
            JobState::GeneratingContent,
            JobState::BuildingDeck,
            JobState::Completed,
        ]
    );
    let artifact = job.artifact().expect("completed job has an artifact");
    assert!(!artifact.download_url.is_empty());
    assert_eq!(artifact.export_format, ExportFormat::Pptx);
    assert_eq!(job.commit.as_deref(), Some("abc123"));
    assert_eq!(job.attempts.generating_content, 1);
    assert_eq!(job.attempts.building_deck, 1);
    assert_eq!(residual_entries(work.path()), 0);

    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().state(), JobState::Completed);
}

#[tokio::test]
async fn oversized_repository_fails_without_calling_services() {
    let mut fetcher = MockRepositoryFetcher::new();
    fetcher.expect_fetch().times(1).returning(|_| {
        Err(PipelineError::RepositoryTooLarge {
            size_bytes: 600 * 1024 * 1024,
            limit_bytes: 500 * 1024 * 1024,
        })
    });
    let mut model = MockLanguageModel::new();
    model.expect_provider().return_const("claude");
    model.expect_complete().never();
    let mut deck = MockDeckService::new();
    deck.expect_generate().never();

    let coordinator = coordinator(settings(), fetcher, model, deck);
    let job = coordinator.create_job(&request()).unwrap();
    let job = coordinator.execute(job, &CancellationToken::new(), None).await;

    assert_eq!(job.state(), JobState::Failed);
    assert_eq!(
        job.states(),
        [JobState::Created, JobState::Cloning, JobState::Failed]
    );
    assert_eq!(job.failure().unwrap().kind, ErrorKind::RepositoryTooLarge);
}

#[tokio::test]
async fn rate_limits_are_retried_up_to_the_bound_then_fail() {
    let work = tempdir().unwrap();
    let mut model = MockLanguageModel::new();
    model.expect_provider().return_const("claude");
    model.expect_complete().times(3).returning(|_| {
        Err(PipelineError::LlmRateLimit {
            provider: "claude".into(),
            retry_after: Some(Duration::from_millis(1)),
        })
    });
    let mut deck = MockDeckService::new();
    deck.expect_generate().never();

    let coordinator = coordinator(settings(), fetcher_for(&work, 1), model, deck);
    let job = coordinator.create_job(&request()).unwrap();
    let job = coordinator.execute(job, &CancellationToken::new(), None).await;

    assert_eq!(job.state(), JobState::Failed);
    assert_eq!(job.failure().unwrap().kind, ErrorKind::LlmRateLimit);
    assert_eq!(job.attempts.generating_content, 3);
    assert_eq!(residual_entries(work.path()), 0);
}

#[tokio::test]
async fn rate_limit_then_success_completes() {
    let work = tempdir().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let mut model = MockLanguageModel::new();
    model.expect_provider().return_const("claude");
    model.expect_complete().times(2).returning(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(PipelineError::LlmRateLimit {
                provider: "claude".into(),
                retry_after: None,
            })
        } else {
            Ok(slides_json(7))
        }
    });

    let coordinator = coordinator(settings(), fetcher_for(&work, 1), model, deck_succeeding(1));
    let job = coordinator.create_job(&request()).unwrap();
    let job = coordinator.execute(job, &CancellationToken::new(), None).await;

    assert_eq!(job.state(), JobState::Completed);
    assert_eq!(job.attempts.generating_content, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn deck_timeout_is_retried_exactly_once() {
    let work = tempdir().unwrap();
    let mut deck = MockDeckService::new();
    deck.expect_generate().times(2).returning(|_| {
        Err(PipelineError::DeckServiceTimeout {
            after: Duration::from_secs(180),
        })
    });

    let coordinator = coordinator(
        settings(),
        fetcher_for(&work, 1),
        model_answering(slides_json(5), 1),
        deck,
    );
    let job = coordinator.create_job(&request()).unwrap();
    let job = coordinator.execute(job, &CancellationToken::new(), None).await;

    assert_eq!(job.state(), JobState::Failed);
    assert_eq!(job.failure().unwrap().kind, ErrorKind::DeckServiceTimeout);
    assert_eq!(job.attempts.building_deck, 2);
    assert_eq!(residual_entries(work.path()), 0);
}

#[tokio::test]
async fn deck_error_is_not_retried() {
    let work = tempdir().unwrap();
    let mut deck = MockDeckService::new();
    deck.expect_generate()
        .times(1)
        .returning(|_| Err(PipelineError::deck(Some(500), "boom")));

    let coordinator = coordinator(
        settings(),
        fetcher_for(&work, 1),
        model_answering(slides_json(5), 1),
        deck,
    );
    let err = coordinator.generate(&request()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeckService);
}

#[tokio::test]
async fn cancellation_during_generation_stops_at_next_boundary() {
    let work = tempdir().unwrap();
    let token = CancellationToken::new();
    let trigger = token.clone();
    let answer = slides_json(5);
    let mut model = MockLanguageModel::new();
    model.expect_provider().return_const("claude");
    model.expect_complete().times(1).returning(move |_| {
        trigger.cancel();
        Ok(answer.clone())
    });
    let mut deck = MockDeckService::new();
    deck.expect_generate().never();

    let coordinator = coordinator(settings(), fetcher_for(&work, 1), model, deck);
    let job = coordinator.create_job(&request()).unwrap();
    let job = coordinator.execute(job, &token, None).await;

    assert_eq!(job.state(), JobState::Cancelled);
    assert_eq!(
        job.states().last().copied(),
        Some(JobState::Cancelled)
    );
    assert!(!job.states().contains(&JobState::BuildingDeck));
    assert_eq!(residual_entries(work.path()), 0);
}

#[tokio::test]
async fn cancelled_before_start_never_fetches() {
    let mut fetcher = MockRepositoryFetcher::new();
    fetcher.expect_fetch().never();
    let coordinator = coordinator(
        settings(),
        fetcher,
        MockLanguageModel::new(),
        MockDeckService::new(),
    );
    let token = CancellationToken::new();
    token.cancel();
    let job = coordinator.create_job(&request()).unwrap();
    let job = coordinator.execute(job, &token, None).await;
    assert_eq!(job.states(), [JobState::Created, JobState::Cancelled]);
}

#[tokio::test]
async fn snapshot_is_retained_when_cleanup_is_disabled() {
    let work = tempdir().unwrap();
    let mut settings = settings();
    settings.cleanup_after_generation = false;
    let coordinator = coordinator(
        settings,
        fetcher_for(&work, 1),
        model_answering(slides_json(5), 1),
        deck_succeeding(1),
    );
    let artifact = coordinator.generate(&request()).await.unwrap();
    assert_eq!(artifact.presentation_id, "pres-1");
    assert_eq!(residual_entries(work.path()), 1);
}

#[tokio::test]
async fn cached_digest_skips_second_clone() {
    let work = tempdir().unwrap();
    let mut settings = settings();
    settings.cache.enabled = true;

    let mut fetcher = fetcher_for(&work, 1);
    fetcher
        .expect_resolve_reference()
        .times(2)
        .returning(|_| Ok("ABC123".into()));
    let prompts = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
    let seen = Arc::clone(&prompts);
    let answer = slides_json(5);
    let mut model = MockLanguageModel::new();
    model.expect_provider().return_const("claude");
    model.expect_complete().times(2).returning(move |req| {
        seen.lock().unwrap().push(req.prompt.clone());
        Ok(answer.clone())
    });

    let coordinator = coordinator(settings, fetcher, model, deck_succeeding(2));

    let first = coordinator.create_job(&request()).unwrap();
    let first = coordinator.execute(first, &CancellationToken::new(), None).await;
    let second_request = GenerationRequest {
        repo_url: format!("{TINY_REPO}.git"),
        ..request()
    };
    let second = coordinator.create_job(&second_request).unwrap();
    let second = coordinator.execute(second, &CancellationToken::new(), None).await;

    assert_eq!(first.state(), JobState::Completed);
    assert_eq!(second.state(), JobState::Completed);
    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    let prompts = prompts.lock().unwrap();
    assert_eq!(prompts[0], prompts[1]);
    assert_eq!(residual_entries(work.path()), 0);
}

#[tokio::test]
async fn invalid_requests_never_create_a_job() {
    let coordinator = coordinator(
        settings(),
        MockRepositoryFetcher::new(),
        MockLanguageModel::new(),
        MockDeckService::new(),
    );
    let bad_url = coordinator
        .create_job(&GenerationRequest::new("ftp://example.com/org/repo"))
        .unwrap_err();
    assert_eq!(bad_url.kind(), ErrorKind::InvalidRepository);

    let bad_count = coordinator
        .create_job(&GenerationRequest {
            slide_count: Some(42),
            ..request()
        })
        .unwrap_err();
    assert_eq!(bad_count.kind(), ErrorKind::Config);
}

#[tokio::test]
async fn digest_failure_after_clone_fails_job_and_removes_snapshot() {
    let work = tempdir().unwrap();
    let root = work.path().to_path_buf();
    let mut fetcher = MockRepositoryFetcher::new();
    fetcher.expect_fetch().times(1).returning(move |_| {
        let path = root.join("org_secrets-only");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join(".env"), "TOKEN=hunter2\n").unwrap();
        fs::write(path.join("debug.log"), "started\n").unwrap();
        Ok(RepositorySnapshot::new(path, 22, 2, None))
    });
    let mut model = MockLanguageModel::new();
    model.expect_provider().return_const("claude");
    model.expect_complete().never();
    let mut deck = MockDeckService::new();
    deck.expect_generate().never();

    let coordinator = coordinator(settings(), fetcher, model, deck);
    let job = coordinator.create_job(&request()).unwrap();
    let job = coordinator.execute(job, &CancellationToken::new(), None).await;

    assert_eq!(
        job.states(),
        [
            JobState::Created,
            JobState::Cloning,
            JobState::Digesting,
            JobState::Failed,
        ]
    );
    assert_eq!(job.failure().unwrap().kind, ErrorKind::Digest);
    assert!(!work.path().join("org_secrets-only").exists());
    assert_eq!(residual_entries(work.path()), 0);
}

#[tokio::test]
async fn cancellation_interrupts_rate_limit_backoff() {
    let work = tempdir().unwrap();
    let mut settings = settings();
    settings.llm.retry.initial_backoff_ms = 60_000;
    settings.llm.retry.max_backoff_ms = 60_000;

    let token = CancellationToken::new();
    let trigger = token.clone();
    let mut model = MockLanguageModel::new();
    model.expect_provider().return_const("claude");
    model.expect_complete().times(1).returning(move |_| {
        trigger.cancel();
        Err(PipelineError::LlmRateLimit {
            provider: "claude".into(),
            retry_after: Some(Duration::from_secs(60)),
        })
    });
    let mut deck = MockDeckService::new();
    deck.expect_generate().never();

    let coordinator = coordinator(settings, fetcher_for(&work, 1), model, deck);
    let job = coordinator.create_job(&request()).unwrap();
    let job = tokio::time::timeout(
        Duration::from_secs(10),
        coordinator.execute(job, &token, None),
    )
    .await
    .expect("backoff sleep was not interrupted");

    assert_eq!(job.state(), JobState::Cancelled);
    assert_eq!(job.attempts.generating_content, 1);
    assert!(!job.states().contains(&JobState::BuildingDeck));
    assert_eq!(residual_entries(work.path()), 0);
}
