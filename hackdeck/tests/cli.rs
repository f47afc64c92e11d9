use std::sync::{Arc, Mutex};

use assert_cmd::Command;
use hackdeck::cli::{run, Cli, Commands};
use predicates::prelude::*;
use tempfile::tempdir;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{layer::Context, Layer, Registry};

fn hackdeck() -> Command {
    let mut cmd = Command::cargo_bin("hackdeck").expect("binary exists");
    // Keep the developer's environment out of the assertions.
    for var in [
        "ANTHROPIC_API_KEY",
        "OPENAI_API_KEY",
        "PRESENTON_API_KEY",
        "HACKDECK_CONFIG",
        "MAX_REPO_SIZE_MB",
        "DEFAULT_SLIDE_COUNT",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn help_lists_subcommands() {
    hackdeck()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("generate")
                .and(predicate::str::contains("serve"))
                .and(predicate::str::contains("reap")),
        );
}

#[test]
fn generate_rejects_invalid_url_before_needing_credentials() {
    hackdeck()
        .args(["generate", "not-a-url"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("InvalidRepositoryError"));
}

#[test]
fn generate_rejects_out_of_range_slide_count() {
    hackdeck()
        .args(["generate", "https://github.com/org/repo", "--slides", "30"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ConfigError"));
}

#[test]
fn generate_without_provider_key_is_a_config_error() {
    let work = tempdir().unwrap();
    hackdeck()
        .args(["generate", "https://github.com/org/repo"])
        .env("TEMP_REPO_DIR", work.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("ANTHROPIC_API_KEY"));
}

#[test]
fn unknown_tone_is_a_usage_error() {
    hackdeck()
        .args(["generate", "https://github.com/org/repo", "--tone", "sarcastic"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Tone must be one of"));
}

#[test]
fn reap_removes_old_snapshots_and_keeps_other_directories() {
    let work = tempdir().unwrap();
    std::fs::create_dir(work.path().join("hackdeck-org_repo-1234")).unwrap();
    std::fs::create_dir(work.path().join("my-project")).unwrap();
    hackdeck()
        .args(["reap", "--older-than-hours", "0"])
        .env("TEMP_REPO_DIR", work.path())
        .assert()
        .success()
        .stdout("1\n");
    assert!(!work.path().join("hackdeck-org_repo-1234").exists());
    assert!(work.path().join("my-project").exists());
}

/// Collects the debug rendering of every event.
struct EventCollector {
    events: Arc<Mutex<Vec<String>>>,
}

impl<S> Layer<S> for EventCollector
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        self.events.lock().unwrap().push(format!("{event:?}"));
    }
}

#[tokio::test]
async fn run_emits_trace_initialised_event() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let subscriber = Registry::default().with(EventCollector {
        events: events.clone(),
    });
    let _guard = tracing::subscriber::set_default(subscriber);

    let cli = Cli {
        config: None,
        command: Commands::Generate {
            url: "not-a-url".into(),
            slides: None,
            tone: None,
            verbosity: None,
            template: None,
            language: None,
            export_as: None,
            no_title_slide: false,
            table_of_contents: false,
        },
    };
    assert!(run(cli).await.is_err());

    let events = events.lock().unwrap();
    assert!(
        events.iter().any(|msg| msg.contains("trace_initialised")),
        "expected a trace_initialised event, got: {events:?}"
    );
}
