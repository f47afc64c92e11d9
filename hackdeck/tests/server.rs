// Router tests driven through tower's `oneshot`, with mocked pipeline services.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use hackdeck::server::router;
use hackdeck_core::config::PipelineSettings;
use hackdeck_core::contract::{
    Artifact, MockDeckService, MockLanguageModel, MockRepositoryFetcher, SystemClock,
};
use hackdeck_core::download::RepositorySnapshot;
use hackdeck_core::error::PipelineError;
use hackdeck_core::jobs::JobManager;
use hackdeck_core::pipeline::Coordinator;
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};
use tower::ServiceExt;

const OUTLINE: &str = r#"{"slides": [
  {"title":"Problem","content":["Slides take too long"]},
  {"title":"Solution","content":["Generate them"]},
  {"title":"Stack","content":["Rust","Tokio"]},
  {"title":"Demo","content":["Live run"]},
  {"title":"Next","content":["More templates"]}
]}"#;

fn snapshot_in(root: &Path) -> RepositorySnapshot {
    let dir = root.join(format!("org_repo-{}", uuid::Uuid::new_v4().simple()));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("README.md"), "# repo\nDemo project.\n").unwrap();
    RepositorySnapshot::new(dir, 22, 1, None)
}

struct Harness {
    app: Router,
    jobs: Arc<JobManager>,
    _work: TempDir,
}

fn harness(deck_result: fn() -> Result<Artifact, PipelineError>) -> Harness {
    let work = tempdir().unwrap();
    let root = work.path().to_path_buf();

    let mut fetcher = MockRepositoryFetcher::new();
    fetcher
        .expect_fetch()
        .returning(move |_| Ok(snapshot_in(&root)));
    let mut model = MockLanguageModel::new();
    model.expect_provider().return_const("claude");
    model
        .expect_complete()
        .returning(|_| Ok(OUTLINE.to_string()));
    let mut deck = MockDeckService::new();
    deck.expect_generate().returning(move |_| deck_result());

    let coordinator = Coordinator::new(
        PipelineSettings::default(),
        Arc::new(fetcher),
        Arc::new(model),
        Arc::new(deck),
        Arc::new(SystemClock),
    )
    .unwrap();
    let jobs = Arc::new(JobManager::new(Arc::new(coordinator)));
    Harness {
        app: router(Arc::clone(&jobs)),
        jobs,
        _work: work,
    }
}

fn rendered() -> Result<Artifact, PipelineError> {
    Ok(Artifact {
        presentation_id: "pres-1".into(),
        download_url: "https://decks.example.com/pres-1.pptx".into(),
        edit_url: None,
        export_format: Default::default(),
        credits_consumed: None,
    })
}

fn renderer_down() -> Result<Artifact, PipelineError> {
    Err(PipelineError::deck(Some(500), "renderer crashed"))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_version() {
    let h = harness(rendered);
    let (status, body) = send(&h.app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn synchronous_generate_returns_artifact() {
    let h = harness(rendered);
    let (status, body) = send(
        &h.app,
        post_json(
            "/api/v1/generate",
            json!({"github_url": "https://github.com/org/repo", "n_slides": 5}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["download_url"], "https://decks.example.com/pres-1.pptx");
    assert_eq!(body["export_format"], "pptx");
    assert_eq!(body["message"], "Presentation generated successfully");
    assert!(body["processing_time"].as_f64().unwrap() >= 0.0);
    assert!(body["job_id"].is_string());
}

#[tokio::test]
async fn invalid_repository_is_bad_request() {
    let h = harness(rendered);
    let (status, body) = send(
        &h.app,
        post_json("/api/v1/generate", json!({"repo_url": "ftp://example.com/x"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
    assert_eq!(body["kind"], "InvalidRepositoryError");
    assert!(body["error"].as_str().unwrap().contains("ftp://example.com/x"));
    assert!(h.jobs.is_empty());
}

#[tokio::test]
async fn upstream_deck_failure_is_bad_gateway() {
    let h = harness(renderer_down);
    let (status, body) = send(
        &h.app,
        post_json("/api/v1/generate", json!({"repo_url": "https://github.com/org/repo"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["kind"], "DeckServiceError");
}

#[tokio::test]
async fn submitted_job_can_be_polled_to_completion() {
    let h = harness(rendered);
    let (status, body) = send(
        &h.app,
        post_json("/api/v1/jobs", json!({"repo_url": "https://github.com/org/repo", "slide_count": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["job_id"].as_str().unwrap().to_string();

    h.jobs.wait(id.parse().unwrap()).await.unwrap();

    let (status, job) = send(&h.app, get(&format!("/api/v1/jobs/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["state"], "COMPLETED");
    assert_eq!(job["artifact"]["presentation_id"], "pres-1");
    assert_eq!(job["id"], id.as_str());
    assert_eq!(job["message"], "Presentation generated successfully");
    assert!(job["processing_time"].as_f64().unwrap() >= 0.0);

    let (status, ack) = send(&h.app, post_json(&format!("/api/v1/jobs/{id}/cancel"), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["outcome"], "already_finished");
}

#[tokio::test]
async fn unknown_jobs_are_not_found() {
    let h = harness(rendered);
    let missing = uuid::Uuid::new_v4();
    for uri in [
        format!("/api/v1/jobs/{missing}"),
        "/api/v1/jobs/not-a-uuid".to_string(),
    ] {
        let (status, body) = send(&h.app, get(&uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert_eq!(body["kind"], "NotFound");
    }
    let (status, _) = send(
        &h.app,
        post_json(&format!("/api/v1/jobs/{missing}/cancel"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn rejected_request_bodies_use_the_error_shape() {
    let h = harness(rendered);
    let (status, body) = send(
        &h.app,
        post_json(
            "/api/v1/jobs",
            json!({"repo_url": "https://github.com/org/repo", "tone": "shouty"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
    assert_eq!(body["status"], "error");
    assert_eq!(body["kind"], "ConfigError");
    assert!(body["error"].as_str().unwrap().contains("Invalid request body"));
    assert!(body["timestamp"].is_string());
    assert!(h.jobs.is_empty());

    let truncated = Request::post("/api/v1/generate")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"repo_url": "#))
        .unwrap();
    let (status, body) = send(&h.app, truncated).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "ConfigError");

    let untyped = Request::post("/api/v1/jobs")
        .body(Body::from(r#"{"repo_url": "https://github.com/org/repo"}"#))
        .unwrap();
    let (status, body) = send(&h.app, untyped).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
}
