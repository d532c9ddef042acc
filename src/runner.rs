//! Job runner — turns queue messages into check runs.
//!
//! The runner owns the concurrency budget (one semaphore permit per running
//! check), the registry of running checks used for aborts and callbacks, and
//! the reporting around each run.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aborted::AbortedChecks;
use crate::backend::{Backend, RunParams, RunResult};
use crate::error::{JobError, RunError};
use crate::job::JobParams;
use crate::queue::Message;
use crate::report::{CheckState, CheckStatus, ResultsUploader, StateUpdater};

/// What the reader does with a message once it has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processing is over; the message must not be delivered again.
    Delete,
    /// Leave the message in the queue for redelivery.
    Keep,
}

/// Snapshot of the runner's load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunnerStats {
    pub running: usize,
    pub capacity: usize,
}

#[derive(Debug)]
struct RunningCheck {
    cancel: CancellationToken,
    /// Last terminal status the check reported through the callback API.
    reported: Option<CheckStatus>,
}

/// Collaborators of the runner.
pub struct RunnerDeps {
    pub backend: Arc<dyn Backend>,
    pub aborted: Option<Arc<AbortedChecks>>,
    pub state: Arc<dyn StateUpdater>,
    pub uploader: Arc<dyn ResultsUploader>,
}

/// Runs checks with bounded concurrency.
pub struct JobRunner {
    deps: RunnerDeps,
    slots: Arc<Semaphore>,
    max_jobs: usize,
    default_timeout: Duration,
    running: RwLock<HashMap<String, RunningCheck>>,
    cancel: CancellationToken,
}

impl JobRunner {
    /// `cancel` is the parent of every check's token.
    pub fn new(
        deps: RunnerDeps,
        max_jobs: usize,
        default_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            deps,
            slots: Arc::new(Semaphore::new(max_jobs)),
            max_jobs,
            default_timeout,
            running: RwLock::new(HashMap::new()),
            cancel,
        }
    }

    /// Wait for a free slot. `None` when the runner no longer accepts work.
    pub async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).acquire_owned().await.ok()
    }

    /// A free slot, if one is available right now.
    pub fn try_acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }

    /// Wait until every slot is free again.
    pub async fn wait_idle(&self) {
        let all = u32::try_from(self.max_jobs).unwrap_or(u32::MAX);
        // The semaphore is never closed, so this only returns once all permits
        // have been released.
        let _ = self.slots.acquire_many(all).await;
    }

    pub async fn stats(&self) -> RunnerStats {
        RunnerStats {
            running: self.running.read().await.len(),
            capacity: self.max_jobs,
        }
    }

    /// Cancel a running check.
    pub async fn abort(&self, check_id: &str) -> Result<(), JobError> {
        let running = self.running.read().await;
        let check = running.get(check_id).ok_or_else(|| JobError::NotRunning {
            check_id: check_id.to_string(),
        })?;
        info!(check_id, "Aborting check");
        check.cancel.cancel();
        Ok(())
    }

    /// State reported by a running check about itself; forwarded upstream.
    pub async fn report_state(&self, state: CheckState) -> Result<(), crate::Error> {
        {
            let mut running = self.running.write().await;
            let check = running
                .get_mut(&state.check_id)
                .ok_or_else(|| JobError::NotRunning {
                    check_id: state.check_id.clone(),
                })?;
            if state.status.is_terminal() {
                check.reported = Some(state.status);
            }
        }
        self.deps.state.update_state(&state).await?;
        Ok(())
    }

    /// Process one message. The caller holds a slot for the duration.
    pub async fn process(&self, message: &Message) -> Disposition {
        let job: JobParams = match serde_json::from_str(&message.body) {
            Ok(job) => job,
            Err(e) => {
                let err = JobError::InvalidMessage {
                    message_id: message.id.clone(),
                    reason: e.to_string(),
                };
                error!(error = %err, "Discarding message");
                return Disposition::Delete;
            }
        };

        if let Some(aborted) = &self.deps.aborted {
            match aborted.is_aborted(&job.check_id).await {
                Ok(true) => {
                    info!(check_id = %job.check_id, "Check aborted before start");
                    let state = CheckState::new(&job.check_id, CheckStatus::Aborted);
                    return self.finish(&state).await;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(check_id = %job.check_id, error = %e, "Error querying aborted checks");
                    return Disposition::Keep;
                }
            }
        }

        let token = self.cancel.child_token();
        match self.running.write().await.entry(job.check_id.clone()) {
            Entry::Occupied(_) => {
                // Redelivery of a check still running here; that run reports for both.
                warn!(
                    check_id = %job.check_id,
                    message_id = %message.id,
                    "Check already running, dropping duplicate"
                );
                return Disposition::Delete;
            }
            Entry::Vacant(slot) => {
                slot.insert(RunningCheck {
                    cancel: token.clone(),
                    reported: None,
                });
            }
        }

        if let Err(e) = self
            .deps
            .state
            .update_state(&CheckState::new(&job.check_id, CheckStatus::Running))
            .await
        {
            warn!(check_id = %job.check_id, error = %e, "Error reporting running state");
        }

        let params = RunParams::from_job(&job, self.default_timeout);
        info!(check_id = %job.check_id, image = %job.image, timeout = ?params.timeout, "Check started");
        let result = match self.deps.backend.run(params, token).await {
            Ok(result) => result,
            Err(_) => Err(RunError::Dropped {
                check_id: job.check_id.clone(),
            }),
        };

        let reported = self
            .running
            .write()
            .await
            .remove(&job.check_id)
            .and_then(|check| check.reported);

        let state = self.final_state(&job, result, reported).await;
        self.finish(&state).await
    }

    async fn final_state(
        &self,
        job: &JobParams,
        result: RunResult,
        reported: Option<CheckStatus>,
    ) -> CheckState {
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                let status = match e {
                    RunError::Timeout { .. } => CheckStatus::Timeout,
                    RunError::Cancelled { .. } => CheckStatus::Aborted,
                    _ => CheckStatus::Failed,
                };
                if e.is_cancellation() {
                    info!(check_id = %job.check_id, reason = %e, ?status, "Check stopped");
                } else {
                    error!(check_id = %job.check_id, error = %e, ?status, "Check run failed");
                }
                return CheckState::new(&job.check_id, status);
            }
        };

        let raw = if output.is_empty() {
            None
        } else {
            match self
                .deps
                .uploader
                .upload_raw(&job.check_id, job.start_time, &output)
                .await
            {
                Ok(link) => Some(link),
                Err(e) => {
                    error!(check_id = %job.check_id, error = %e, "Error uploading raw results");
                    None
                }
            }
        };

        let status = reported.unwrap_or(CheckStatus::Finished);
        info!(check_id = %job.check_id, ?status, "Check finished");
        CheckState::new(&job.check_id, status).with_raw(raw)
    }

    async fn finish(&self, state: &CheckState) -> Disposition {
        match self.deps.state.update_state(state).await {
            Ok(()) => Disposition::Delete,
            Err(e) => {
                error!(check_id = %state.check_id, error = %e, "Error reporting final state");
                Disposition::Keep
            }
        }
    }
}
