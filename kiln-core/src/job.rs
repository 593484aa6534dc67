//! Jobs queued on the [`Dispatcher`](crate::Dispatcher) and the handles
//! callers await them through.
//!
//! Each job is split in two at submission. The [`Handle`] goes back to the
//! caller; the resolving half travels through the queue to the worker, which
//! is the only place a job's outcome is ever written.

use std::{fmt, sync::Arc, time::Duration};

use image::DynamicImage;
use tokio::{
    sync::{oneshot, watch, Mutex},
    time::{error::Elapsed, Instant},
};

use crate::{GenerationError, GenerationParams, JobError};

/// What a [`Handle`] resolves to.
pub type Outcome = Result<Arc<DynamicImage>, JobError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub(crate) u64);

impl JobId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Lifecycle of a job.
///
/// `Queued -> Running -> Fulfilled | Rejected`, or `Queued -> Abandoned` when
/// the dispatcher stops before the job reaches the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Fulfilled,
    Rejected,
    Abandoned,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Fulfilled | Self::Rejected | Self::Abandoned)
    }
}

/// The worker's half of a submitted job.
pub(crate) struct Job {
    pub(crate) id: JobId,
    pub(crate) params: GenerationParams,
    pub(crate) enqueued_at: Instant,
    result_tx: oneshot::Sender<Outcome>,
    state_tx: watch::Sender<JobState>,
}

impl Job {
    pub(crate) fn new(id: JobId, params: GenerationParams) -> (Self, Handle) {
        let (result_tx, result_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(JobState::Queued);
        let job = Self {
            id,
            params,
            enqueued_at: Instant::now(),
            result_tx,
            state_tx,
        };
        let handle = Handle {
            id,
            result: Mutex::new(Slot::Pending(result_rx)),
            state_rx,
        };
        (job, handle)
    }

    pub(crate) fn start(&self) {
        self.state_tx.send_replace(JobState::Running);
    }

    /// Writes the job's outcome. Consumes the job, so a job resolves at most once.
    ///
    /// The outcome is sent before the terminal state is published: once
    /// [`Handle::state`] reports a terminal state, the outcome is readable.
    pub(crate) fn resolve(self, result: Result<DynamicImage, GenerationError>) -> JobState {
        let state = match result {
            Ok(_) => JobState::Fulfilled,
            Err(_) => JobState::Rejected,
        };
        let outcome = result.map(Arc::new).map_err(JobError::from);
        if self.result_tx.send(outcome).is_err() {
            tracing::debug!(job = %self.id, "caller stopped waiting before the job finished");
        }
        self.state_tx.send_replace(state);
        state
    }
}

enum Slot {
    Pending(oneshot::Receiver<Outcome>),
    Resolved(Outcome),
}

/// Write-once result of a submitted job.
///
/// Waiting suspends until the worker resolves the job. Once resolved, every
/// read returns the same outcome. A job dropped unresolved by a stopping
/// dispatcher reads as [`JobError::Abandoned`].
pub struct Handle {
    id: JobId,
    result: Mutex<Slot>,
    state_rx: watch::Receiver<JobState>,
}

impl Handle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn state(&self) -> JobState {
        let state = *self.state_rx.borrow();
        // the worker's side is gone without reaching a terminal state
        if !state.is_terminal() && self.state_rx.has_changed().is_err() {
            JobState::Abandoned
        } else {
            state
        }
    }

    /// Waits for the job's outcome. Cancel safe: dropping the future leaves
    /// the handle readable.
    pub async fn wait(&self) -> Outcome {
        let mut slot = self.result.lock().await;
        let outcome = match &mut *slot {
            Slot::Resolved(outcome) => return outcome.clone(),
            Slot::Pending(rx) => rx.await.unwrap_or(Err(JobError::Abandoned)),
        };
        *slot = Slot::Resolved(outcome.clone());
        outcome
    }

    /// Like [`Handle::wait`], giving up after `timeout`. The job itself keeps
    /// its place in the queue and still runs.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<Outcome, Elapsed> {
        tokio::time::timeout(timeout, self.wait()).await
    }

    /// Returns the outcome if the job has already been resolved, without waiting.
    pub fn try_outcome(&self) -> Option<Outcome> {
        let mut slot = self.result.try_lock().ok()?;
        let outcome = match &mut *slot {
            Slot::Resolved(outcome) => return Some(outcome.clone()),
            Slot::Pending(rx) => match rx.try_recv() {
                Ok(outcome) => outcome,
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => Err(JobError::Abandoned),
            },
        };
        *slot = Slot::Resolved(outcome.clone());
        Some(outcome)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
