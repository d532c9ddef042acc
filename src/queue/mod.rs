//! Queue reading — pulls job messages and hands them to the runner.
//!
//! - [`QueueReader`] loops over a [`MessageSource`] while slots are free
//! - [`IdleTracker`] fires when the reader has been idle for too long
//! - [`stdin::StdinSource`] reads line-delimited messages from stdin

pub mod stdin;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::QueueError;
use crate::runner::{Disposition, JobRunner};

pub use stdin::StdinSource;

/// Wait before asking an empty source again.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A queue message carrying a JSON-encoded job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub body: String,
}

/// A queue of job messages with at-least-once delivery.
#[async_trait]
pub trait MessageSource: Send + Sync + 'static {
    /// Next message, or `None` when there is nothing to read right now.
    async fn receive(&self) -> Result<Option<Message>, QueueError>;

    /// Acknowledge a message so it is not delivered again.
    async fn delete(&self, message: &Message) -> Result<(), QueueError>;
}

/// What the reader is doing, as seen by the idle tracker.
#[derive(Debug, Clone, Copy)]
pub struct ReaderActivity {
    /// Last message read, or last slot obtained after waiting for one.
    pub last: Instant,
    /// The reader is blocked until a running check finishes.
    pub waiting_for_slot: bool,
}

impl ReaderActivity {
    fn now() -> Self {
        Self {
            last: Instant::now(),
            waiting_for_slot: false,
        }
    }
}

/// Reads messages and dispatches them to the runner.
pub struct QueueReader {
    source: Arc<dyn MessageSource>,
    runner: Arc<JobRunner>,
    activity: watch::Sender<ReaderActivity>,
    poll_interval: Duration,
}

impl QueueReader {
    pub fn new(source: Arc<dyn MessageSource>, runner: Arc<JobRunner>) -> Self {
        let (activity, _) = watch::channel(ReaderActivity::now());
        Self {
            source,
            runner,
            activity,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Observe the reader's activity.
    pub fn activity(&self) -> watch::Receiver<ReaderActivity> {
        self.activity.subscribe()
    }

    pub fn idle_tracker(&self, max_idle: Duration) -> IdleTracker {
        IdleTracker::new(self.activity(), max_idle)
    }

    /// Spawn the read loop. The task completes after `cancel` fires and every
    /// message already read has been processed.
    pub fn start_reading(self, cancel: CancellationToken) -> JoinHandle<Result<(), QueueError>> {
        tokio::spawn(self.read_loop(cancel))
    }

    fn touch(&self) {
        self.activity.send_replace(ReaderActivity::now());
    }

    async fn read_loop(self, cancel: CancellationToken) -> Result<(), QueueError> {
        let result = loop {
            let slot = match self.runner.try_acquire_slot() {
                Some(slot) => slot,
                None => {
                    self.activity.send_modify(|a| a.waiting_for_slot = true);
                    let slot = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break Ok(()),
                        slot = self.runner.acquire_slot() => slot,
                    };
                    self.touch();
                    match slot {
                        Some(slot) => slot,
                        None => break Err(QueueError::Task("runner stopped accepting work".into())),
                    }
                }
            };

            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                received = self.source.receive() => received,
            };

            let message = match received {
                Ok(message) => message,
                Err(e) => {
                    error!(error = %e, "Error reading queue");
                    None
                }
            };

            let Some(message) = message else {
                drop(slot);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Ok(()),
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
                continue;
            };

            self.touch();
            let runner = Arc::clone(&self.runner);
            let source = Arc::clone(&self.source);
            tokio::spawn(async move {
                if runner.process(&message).await == Disposition::Delete
                    && let Err(e) = source.delete(&message).await
                {
                    error!(message_id = %message.id, error = %e, "Error deleting message");
                }
                drop(slot);
            });
        };

        info!("Queue reading stopped, waiting for running checks");
        self.runner.wait_idle().await;
        info!("All running checks finished");
        result
    }
}

/// How an [`IdleTracker`] finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// No activity for longer than the maximum idle interval.
    Idle,
    /// The tracker was cancelled first.
    Cancelled,
}

/// Fires once the reader has been idle for `max_idle`.
pub struct IdleTracker {
    activity: watch::Receiver<ReaderActivity>,
    max_idle: Duration,
}

impl IdleTracker {
    pub fn new(activity: watch::Receiver<ReaderActivity>, max_idle: Duration) -> Self {
        Self { activity, max_idle }
    }

    pub async fn track(mut self, cancel: CancellationToken) -> IdleOutcome {
        loop {
            let current = *self.activity.borrow_and_update();
            // No deadline while the reader waits for a slot.
            let deadline = (!current.waiting_for_slot).then(|| current.last + self.max_idle);
            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return IdleOutcome::Cancelled,
                changed = self.activity.changed() => {
                    if changed.is_err() {
                        // Reader gone; nothing left to observe.
                        cancel.cancelled().await;
                        return IdleOutcome::Cancelled;
                    }
                }
                _ = expired => {
                    info!(max_idle = ?self.max_idle, "No queue activity, stopping");
                    return IdleOutcome::Idle;
                }
            }
        }
    }
}
