//! Asynchronous job manager: one tokio task per job, polled through `watch` snapshots.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GenerationRequest;
use crate::error::{PipelineError, Result};
use crate::job::{GenerationJob, JobId};
use crate::pipeline::Coordinator;

struct JobEntry {
    snapshot: watch::Receiver<GenerationJob>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The token was set; the job stops at its next stage boundary.
    Requested,
    /// The job had already finished.
    AlreadyFinished,
}

pub struct JobManager {
    coordinator: Arc<Coordinator>,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
}

impl JobManager {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, JobEntry>> {
        // A poisoned map is still consistent: entries are only inserted or removed whole.
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate, register and start a job. Validation errors are returned before any job exists.
    pub fn submit(&self, request: &GenerationRequest) -> Result<JobId> {
        let job = self.coordinator.create_job(request)?;
        let id = job.id;
        let (tx, rx) = watch::channel(job.clone());
        let cancel = CancellationToken::new();

        let coordinator = Arc::clone(&self.coordinator);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let finished = coordinator.execute(job, &token, Some(&tx)).await;
            tx.send_replace(finished);
        });

        self.lock().insert(
            id,
            JobEntry {
                snapshot: rx,
                cancel,
                handle: Some(handle),
            },
        );
        info!(job_id = %id, "Job submitted");
        Ok(id)
    }

    /// Latest snapshot of a job, if it is still retained.
    #[must_use]
    pub fn status(&self, id: JobId) -> Option<GenerationJob> {
        self.lock().get(&id).map(|entry| entry.snapshot.borrow().clone())
    }

    pub fn cancel(&self, id: JobId) -> Option<CancelOutcome> {
        let jobs = self.lock();
        let entry = jobs.get(&id)?;
        if entry.snapshot.borrow().is_terminal() {
            return Some(CancelOutcome::AlreadyFinished);
        }
        entry.cancel.cancel();
        info!(job_id = %id, "Cancellation requested");
        Some(CancelOutcome::Requested)
    }

    /// Wait until the job reaches a terminal state and return that snapshot.
    pub async fn wait(&self, id: JobId) -> Result<GenerationJob> {
        let mut rx = self
            .lock()
            .get(&id)
            .map(|entry| entry.snapshot.clone())
            .ok_or_else(|| PipelineError::internal(format!("unknown job {id}")))?;
        let job = rx
            .wait_for(GenerationJob::is_terminal)
            .await
            .map_err(|_| PipelineError::internal(format!("job {id} stopped without a result")))?
            .clone();
        Ok(job)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop records of jobs that finished longer than `retention` ago. Returns how many went.
    pub fn reap_finished(&self, retention: chrono::Duration) -> usize {
        let now = self.coordinator.clock().now();
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|id, entry| {
            let snapshot = entry.snapshot.borrow();
            let expired = snapshot.is_terminal()
                && snapshot
                    .finished_at
                    .is_some_and(|finished| now - finished >= retention);
            if expired {
                debug!(job_id = %id, state = %snapshot.state(), "Archiving finished job");
            }
            !expired
        });
        let removed = before - jobs.len();
        if removed > 0 {
            info!(removed, remaining = jobs.len(), "Reaped finished jobs");
        }
        removed
    }

    /// Cancel every live job and wait for all tasks to finish their cleanup.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut jobs = self.lock();
            jobs.values_mut()
                .filter_map(|entry| {
                    entry.cancel.cancel();
                    entry.handle.take()
                })
                .collect()
        };
        info!(jobs = handles.len(), "Shutting down job manager");
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Job task ended abnormally");
            }
        }
    }
}
