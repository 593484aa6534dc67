//! Serialized access to a single [`Engine`].
//!
//! [`Dispatcher`] is the cheap, cloneable admission side: any number of
//! callers append jobs to an in-memory FIFO queue and get a [`Handle`] back
//! immediately. [`Worker`] is the only owner of the engine. It drains the
//! queue one job at a time and runs each generation on the blocking pool, so
//! admission never waits on the engine and at most one generation is ever in
//! flight.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use image::DynamicImage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    job::Job, Engine, GenerationError, GenerationParams, Handle, JobId, JobState, QueueFull,
};

#[derive(Debug, Clone, Default)]
pub struct DispatcherConfig {
    /// Upper bound on waiting jobs enforced by [`Dispatcher::try_submit`].
    /// `None` leaves the queue unbounded.
    pub max_queued: Option<usize>,
}

struct Shared {
    model: String,
    queued: AtomicUsize,
    next_id: AtomicU64,
    max_queued: Option<usize>,
}

#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Job>,
}

impl Dispatcher {
    /// Takes ownership of `engine` and returns the admission side together
    /// with the worker that must be driven by [`Worker::run`].
    pub fn new(engine: Box<dyn Engine>, config: DispatcherConfig) -> (Self, Worker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            model: engine.name().to_string(),
            queued: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            max_queued: config.max_queued,
        });
        let dispatcher = Self {
            shared: shared.clone(),
            tx,
        };
        let worker = Worker { engine, rx, shared };
        (dispatcher, worker)
    }

    /// Appends a job to the tail of the queue. Never blocks and never touches
    /// the engine. If the worker has stopped, the returned handle reads as
    /// abandoned.
    pub fn submit(&self, params: GenerationParams) -> Handle {
        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        self.enqueue(params)
    }

    /// Like [`Dispatcher::submit`], but refuses the job when the configured
    /// queue limit is reached.
    pub fn try_submit(&self, params: GenerationParams) -> Result<Handle, QueueFull> {
        self.reserve(1)?;
        Ok(self.enqueue(params))
    }

    /// Queues every job or none of them. The batch is admitted only if it
    /// fits under the queue limit as a whole; its jobs stay adjacent in FIFO
    /// order.
    pub fn try_submit_all(&self, batch: Vec<GenerationParams>) -> Result<Vec<Handle>, QueueFull> {
        self.reserve(batch.len())?;
        Ok(batch.into_iter().map(|params| self.enqueue(params)).collect())
    }

    // counts `n` jobs in `queued` if they fit under the limit
    fn reserve(&self, n: usize) -> Result<(), QueueFull> {
        let Some(limit) = self.shared.max_queued else {
            self.shared.queued.fetch_add(n, Ordering::SeqCst);
            return Ok(());
        };
        self.shared
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                queued.checked_add(n).filter(|total| *total <= limit)
            })
            .map(|_| ())
            .map_err(|_| QueueFull { limit })
    }

    /// Jobs submitted but not yet picked up by the worker.
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    /// Name of the engine behind this dispatcher.
    pub fn model(&self) -> &str {
        &self.shared.model
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    // expects the caller to have counted the job in `queued`
    fn enqueue(&self, params: GenerationParams) -> Handle {
        let id = JobId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let (job, handle) = Job::new(id, params);
        match self.tx.send(job) {
            Ok(()) => tracing::debug!(job = %id, queued = self.queued(), "job queued"),
            Err(_) => {
                self.shared.queued.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!(job = %id, "dispatcher has stopped, job abandoned");
            }
        }
        handle
    }
}

/// Totals reported by [`Worker::run`] once it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub fulfilled: usize,
    pub rejected: usize,
    pub abandoned: usize,
}

/// Exclusive owner of the engine.
pub struct Worker {
    engine: Box<dyn Engine>,
    rx: mpsc::UnboundedReceiver<Job>,
    shared: Arc<Shared>,
}

impl Worker {
    /// Drains the queue until `cancel` fires or every [`Dispatcher`] is dropped.
    ///
    /// Cancellation is observed between jobs only: a running generation always
    /// completes and is delivered. Jobs still queued when the loop stops are
    /// dropped, which their handles read as abandoned.
    pub async fn run(self, cancel: CancellationToken) -> RunSummary {
        let Worker {
            mut engine,
            mut rx,
            shared,
        } = self;
        let mut summary = RunSummary::default();
        tracing::info!(model = %shared.model, "dispatcher worker started");

        loop {
            let job = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            shared.queued.fetch_sub(1, Ordering::SeqCst);

            job.start();
            tracing::info!(
                job = %job.id,
                seed = job.params.seed,
                width = job.params.width,
                height = job.params.height,
                steps = job.params.steps,
                waited_ms = job.enqueued_at.elapsed().as_millis() as u64,
                "job started"
            );

            let started = Instant::now();
            let params = job.params.clone();
            let task = tokio::task::spawn_blocking(move || {
                let result = generate_isolated(engine.as_mut(), &params);
                (engine, result)
            });
            let (returned, result) = match task.await {
                Ok(done) => done,
                Err(err) => {
                    // the engine went down with the task
                    tracing::error!(
                        job = %job.id,
                        error = %err,
                        "engine task failed, stopping worker"
                    );
                    job.resolve(Err(GenerationError::Panicked(err.to_string())));
                    summary.rejected += 1;
                    break;
                }
            };
            engine = returned;

            let elapsed_ms = started.elapsed().as_millis() as u64;
            let id = job.id;
            match &result {
                Ok(_) => tracing::info!(job = %id, elapsed_ms, "job fulfilled"),
                Err(err) => tracing::warn!(job = %id, elapsed_ms, error = %err, "job rejected"),
            }
            match job.resolve(result) {
                JobState::Fulfilled => summary.fulfilled += 1,
                _ => summary.rejected += 1,
            }
        }

        rx.close();
        while let Ok(job) = rx.try_recv() {
            shared.queued.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(job = %job.id, "abandoning queued job");
            summary.abandoned += 1;
        }
        tracing::info!(
            fulfilled = summary.fulfilled,
            rejected = summary.rejected,
            abandoned = summary.abandoned,
            "dispatcher worker stopped"
        );
        summary
    }
}

/// Runs one generation, turning invalid parameters and panics into errors.
fn generate_isolated(
    engine: &mut dyn Engine,
    params: &GenerationParams,
) -> Result<DynamicImage, GenerationError> {
    params.validate()?;
    panic::catch_unwind(AssertUnwindSafe(|| engine.generate(params)))
        .unwrap_or_else(|payload| Err(GenerationError::Panicked(panic_message(payload))))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
