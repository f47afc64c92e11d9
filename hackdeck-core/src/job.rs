//! Generation job record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::JobParameters;
use crate::contract::Artifact;
use crate::error::{ErrorKind, PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Created,
    Cloning,
    Digesting,
    GeneratingContent,
    BuildingDeck,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The next state on the success path, if any.
    #[must_use]
    pub const fn successor(self) -> Option<Self> {
        match self {
            Self::Created => Some(Self::Cloning),
            Self::Cloning => Some(Self::Digesting),
            Self::Digesting => Some(Self::GeneratingContent),
            Self::GeneratingContent => Some(Self::BuildingDeck),
            Self::BuildingDeck => Some(Self::Completed),
            Self::Completed | Self::Failed | Self::Cancelled => None,
        }
    }

    /// Forward-only: the success-path successor, or `Failed`/`Cancelled` from any live state.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(next, Self::Failed | Self::Cancelled) || self.successor() == Some(next)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Cloning => "CLONING",
            Self::Digesting => "DIGESTING",
            Self::GeneratingContent => "GENERATING_CONTENT",
            Self::BuildingDeck => "BUILDING_DECK",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: JobState,
    pub at: DateTime<Utc>,
}

/// Attempts made per retried stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAttempts {
    pub generating_content: u32,
    pub building_deck: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PipelineError> for FailureReason {
    fn from(e: &PipelineError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// One repository-to-deck run. Mutated only through the transition methods; observers
/// get clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: JobId,
    pub repo_url: String,
    pub params: JobParameters,
    state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    history: Vec<StateChange>,
    pub attempts: StageAttempts,
    /// Commit the digest was built from, once known.
    pub commit: Option<String>,
    pub cache_hit: bool,
    artifact: Option<Artifact>,
    failure: Option<FailureReason>,
}

impl GenerationJob {
    pub fn new(repo_url: impl Into<String>, params: JobParameters, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            repo_url: repo_url.into(),
            params,
            state: JobState::Created,
            created_at: now,
            started_at: None,
            finished_at: None,
            history: vec![StateChange {
                state: JobState::Created,
                at: now,
            }],
            attempts: StageAttempts::default(),
            commit: None,
            cache_hit: false,
            artifact: None,
            failure: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> JobState {
        self.state
    }

    #[must_use]
    pub fn history(&self) -> &[StateChange] {
        &self.history
    }

    /// The visited states in order.
    #[must_use]
    pub fn states(&self) -> Vec<JobState> {
        self.history.iter().map(|c| c.state).collect()
    }

    #[must_use]
    pub fn artifact(&self) -> Option<&Artifact> {
        self.artifact.as_ref()
    }

    #[must_use]
    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Time from leaving CREATED to reaching a terminal state; `None` while the job is live.
    #[must_use]
    pub fn processing_time(&self) -> Option<std::time::Duration> {
        let (started, finished) = (self.started_at?, self.finished_at?);
        (finished - started).to_std().ok()
    }

    /// Human-readable progress line for status reports.
    #[must_use]
    pub fn message(&self) -> String {
        match self.state {
            JobState::Created => "Job queued".into(),
            JobState::Cloning => "Cloning repository".into(),
            JobState::Digesting => "Building repository digest".into(),
            JobState::GeneratingContent => "Generating slide content".into(),
            JobState::BuildingDeck => "Building presentation".into(),
            JobState::Completed => "Presentation generated successfully".into(),
            JobState::Failed => self
                .failure
                .as_ref()
                .map_or_else(|| "Generation failed".into(), |f| f.message.clone()),
            JobState::Cancelled => "Job cancelled".into(),
        }
    }

    /// Move to `next`; illegal moves are an internal error and leave the job untouched.
    pub fn transition(&mut self, next: JobState, now: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::internal(format!(
                "illegal job transition {} -> {}",
                self.state, next
            )));
        }
        tracing::info!(job_id = %self.id, from = %self.state, to = %next, "Job state transition");
        if self.started_at.is_none() && next != JobState::Created {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.state = next;
        self.history.push(StateChange { state: next, at: now });
        Ok(())
    }

    pub fn complete(&mut self, artifact: Artifact, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Completed, now)?;
        self.artifact = Some(artifact);
        Ok(())
    }

    pub fn fail(&mut self, error: &PipelineError, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Failed, now)?;
        self.failure = Some(error.into());
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Cancelled, now)?;
        self.failure = Some((&PipelineError::Cancelled).into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExportFormat, GenerationRequest, PipelineSettings};

    fn job() -> GenerationJob {
        let params = JobParameters::resolve(
            &GenerationRequest::new("https://github.com/o/r"),
            &PipelineSettings::default(),
        )
        .unwrap();
        GenerationJob::new("https://github.com/o/r", params, Utc::now())
    }

    #[test]
    fn happy_path_visits_every_state_once() {
        let mut job = job();
        for state in [
            JobState::Cloning,
            JobState::Digesting,
            JobState::GeneratingContent,
            JobState::BuildingDeck,
        ] {
            job.transition(state, Utc::now()).unwrap();
        }
        job.complete(
            Artifact {
                presentation_id: "p".into(),
                download_url: "https://x/p.pptx".into(),
                edit_url: None,
                export_format: ExportFormat::Pptx,
                credits_consumed: None,
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(
            job.states(),
            [
                JobState::Created,
                JobState::Cloning,
                JobState::Digesting,
                JobState::GeneratingContent,
                JobState::BuildingDeck,
                JobState::Completed
            ]
        );
        assert!(job.started_at.is_some());
        assert!(job.finished_at.is_some());
        assert!(job.failure().is_none());
    }

    #[test]
    fn skipping_or_revisiting_states_is_rejected() {
        let mut job = job();
        assert!(job.transition(JobState::Digesting, Utc::now()).is_err());
        job.transition(JobState::Cloning, Utc::now()).unwrap();
        assert!(job.transition(JobState::Cloning, Utc::now()).is_err());
        assert!(job.transition(JobState::Created, Utc::now()).is_err());
        assert_eq!(job.state(), JobState::Cloning);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut job = job();
        job.transition(JobState::Cloning, Utc::now()).unwrap();
        job.fail(&PipelineError::clone_failed("network down"), Utc::now())
            .unwrap();
        assert!(job.cancel(Utc::now()).is_err());
        assert!(job.transition(JobState::Digesting, Utc::now()).is_err());
        let failure = job.failure().unwrap();
        assert_eq!(failure.kind, ErrorKind::CloneFailed);
        assert!(failure.message.contains("network down"));
    }

    #[test]
    fn processing_time_spans_start_to_finish() {
        let mut job = job();
        let start = Utc::now();
        assert_eq!(job.processing_time(), None);
        job.transition(JobState::Cloning, start).unwrap();
        assert_eq!(job.processing_time(), None);
        assert_eq!(job.message(), "Cloning repository");
        job.fail(
            &PipelineError::clone_failed("network down"),
            start + chrono::Duration::milliseconds(1500),
        )
        .unwrap();
        assert_eq!(
            job.processing_time(),
            Some(std::time::Duration::from_millis(1500))
        );
        assert!(job.message().contains("network down"));
    }

    #[test]
    fn cancel_from_created_is_allowed() {
        let mut job = job();
        job.cancel(Utc::now()).unwrap();
        assert_eq!(job.state(), JobState::Cancelled);
        assert_eq!(job.failure().unwrap().kind, ErrorKind::Cancelled);
    }

    #[test]
    fn state_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&JobState::GeneratingContent).unwrap();
        assert_eq!(json, "\"GENERATING_CONTENT\"");
    }
}
