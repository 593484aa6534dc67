use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use assert_matches::assert_matches;
use image::{DynamicImage, Rgb, RgbImage};
use kiln_core::{
    Dispatcher, DispatcherConfig, Engine, GenerationError, GenerationParams, Handle, JobError,
    JobState,
};
use tokio_util::sync::CancellationToken;

/// Stub engine that sleeps, records every call and tags its output with the seed.
#[derive(Clone, Default)]
struct Recorder {
    delay: Duration,
    fail_on: HashSet<u64>,
    panic_on: HashSet<u64>,
    calls: Arc<Mutex<Vec<u64>>>,
    in_flight: Arc<AtomicBool>,
    overlaps: Arc<AtomicUsize>,
}

impl Recorder {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn failing_on(mut self, seed: u64) -> Self {
        self.fail_on.insert(seed);
        self
    }

    fn panicking_on(mut self, seed: u64) -> Self {
        self.panic_on.insert(seed);
        self
    }

    fn calls(&self) -> Vec<u64> {
        self.calls.lock().unwrap().clone()
    }
}

impl Engine for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn generate(&mut self, params: &GenerationParams) -> Result<DynamicImage, GenerationError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.calls.lock().unwrap().push(params.seed);
        std::thread::sleep(self.delay);
        self.in_flight.store(false, Ordering::SeqCst);

        if self.panic_on.contains(&params.seed) {
            panic!("device lost on seed {}", params.seed);
        }
        if self.fail_on.contains(&params.seed) {
            return Err(anyhow::anyhow!("out of memory on seed {}", params.seed).into());
        }
        let mut img = RgbImage::new(1, 1);
        img.put_pixel(0, 0, Rgb([params.seed as u8, 0, 0]));
        Ok(DynamicImage::ImageRgb8(img))
    }
}

fn params(seed: u64) -> GenerationParams {
    GenerationParams::new(format!("prompt {seed}"), 64, 64, 4, seed).unwrap()
}

fn tag(image: &DynamicImage) -> u64 {
    image.to_rgb8().get_pixel(0, 0)[0] as u64
}

fn start(
    engine: &Recorder,
) -> (
    Dispatcher,
    CancellationToken,
    tokio::task::JoinHandle<kiln_core::RunSummary>,
) {
    let (dispatcher, worker) =
        Dispatcher::new(Box::new(engine.clone()), DispatcherConfig::default());
    let cancel = CancellationToken::new();
    let running = tokio::spawn(worker.run(cancel.clone()));
    (dispatcher, cancel, running)
}

async fn wait_for_state(handle: &Handle, state: JobState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.state() != state {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("job never reached the expected state");
}

#[tokio::test]
async fn engine_sees_jobs_in_submission_order() {
    let engine = Recorder::default();
    let (dispatcher, worker) =
        Dispatcher::new(Box::new(engine.clone()), DispatcherConfig::default());

    let handles: Vec<_> = (1..=10).map(|seed| dispatcher.submit(params(seed))).collect();
    assert_eq!(dispatcher.queued(), 10);

    let cancel = CancellationToken::new();
    let running = tokio::spawn(worker.run(cancel.clone()));
    for (seed, handle) in (1..=10).zip(&handles) {
        assert_eq!(tag(&handle.wait().await.unwrap()), seed);
    }
    assert_eq!(engine.calls(), (1..=10).collect::<Vec<_>>());

    cancel.cancel();
    assert_eq!(running.await.unwrap().fulfilled, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submitters_never_overlap_in_the_engine() {
    let engine = Recorder::with_delay(Duration::from_millis(5));
    let (dispatcher, cancel, running) = start(&engine);

    let submitters: Vec<_> = (0..16)
        .map(|seed| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let handle = dispatcher.submit(params(seed));
                let image = handle.wait().await.unwrap();
                assert_eq!(tag(&image), seed);
            })
        })
        .collect();
    for submitter in submitters {
        submitter.await.unwrap();
    }

    assert_eq!(engine.overlaps.load(Ordering::SeqCst), 0);
    let mut calls = engine.calls();
    calls.sort_unstable();
    assert_eq!(calls, (0..16).collect::<Vec<_>>());

    cancel.cancel();
    running.await.unwrap();
}

#[tokio::test]
async fn results_arrive_in_submission_order() {
    let engine = Recorder::with_delay(Duration::from_millis(20));
    let (dispatcher, cancel, running) = start(&engine);

    let handles: Vec<_> = [1, 2, 3]
        .into_iter()
        .map(|seed| Arc::new(dispatcher.submit(params(seed))))
        .collect();
    // submit returned for all three while the first is still generating
    assert_matches!(handles[2].state(), JobState::Queued | JobState::Running);
    assert!(handles[2].try_outcome().is_none());

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let waiters: Vec<_> = handles
        .iter()
        .cloned()
        .map(|handle| {
            let delivered = delivered.clone();
            tokio::spawn(async move {
                let seed = tag(&handle.wait().await.unwrap());
                delivered.lock().unwrap().push(seed);
            })
        })
        .collect();
    for waiter in waiters {
        waiter.await.unwrap();
    }

    assert_eq!(*delivered.lock().unwrap(), vec![1, 2, 3]);
    for handle in &handles {
        assert_eq!(handle.state(), JobState::Fulfilled);
    }

    cancel.cancel();
    running.await.unwrap();
}

#[tokio::test]
async fn failing_job_does_not_affect_its_neighbours() {
    let engine = Recorder::default().failing_on(2);
    let (dispatcher, cancel, running) = start(&engine);

    let first = dispatcher.submit(params(1));
    let second = dispatcher.submit(params(2));
    let third = dispatcher.submit(params(3));

    assert_eq!(tag(&first.wait().await.unwrap()), 1);
    assert_matches!(
        second.wait().await,
        Err(JobError::Generation(GenerationError::Engine(err))) if err.to_string().contains("seed 2")
    );
    assert_eq!(tag(&third.wait().await.unwrap()), 3);
    assert_eq!(second.state(), JobState::Rejected);

    cancel.cancel();
    let summary = running.await.unwrap();
    assert_eq!((summary.fulfilled, summary.rejected), (2, 1));
}

#[tokio::test]
async fn panicking_engine_rejects_only_that_job() {
    let engine = Recorder::default().panicking_on(2);
    let (dispatcher, cancel, running) = start(&engine);

    let handles: Vec<_> = (1..=3).map(|seed| dispatcher.submit(params(seed))).collect();

    assert!(handles[0].wait().await.is_ok());
    assert_matches!(
        handles[1].wait().await,
        Err(JobError::Generation(GenerationError::Panicked(msg))) if msg.contains("device lost")
    );
    assert_eq!(tag(&handles[2].wait().await.unwrap()), 3);
    assert_eq!(engine.calls(), vec![1, 2, 3]);

    cancel.cancel();
    running.await.unwrap();
}

#[tokio::test]
async fn cancelling_before_dequeue_abandons_every_job() {
    let engine = Recorder::default();
    let (dispatcher, worker) =
        Dispatcher::new(Box::new(engine.clone()), DispatcherConfig::default());

    let handles: Vec<_> = (1..=5).map(|seed| dispatcher.submit(params(seed))).collect();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = worker.run(cancel).await;

    assert_eq!(summary.abandoned, 5);
    assert!(engine.calls().is_empty());
    assert_eq!(dispatcher.queued(), 0);
    for handle in &handles {
        assert_eq!(handle.state(), JobState::Abandoned);
        assert_matches!(handle.wait().await, Err(JobError::Abandoned));
    }
}

#[tokio::test]
async fn cancellation_lets_the_running_job_finish() {
    let engine = Recorder::with_delay(Duration::from_millis(50));
    let (dispatcher, cancel, running) = start(&engine);

    let handles: Vec<_> = (1..=3).map(|seed| dispatcher.submit(params(seed))).collect();
    wait_for_state(&handles[0], JobState::Running).await;
    cancel.cancel();

    assert_eq!(tag(&handles[0].wait().await.unwrap()), 1);
    assert_matches!(handles[1].wait().await, Err(JobError::Abandoned));
    assert_matches!(handles[2].wait().await, Err(JobError::Abandoned));
    assert_eq!(engine.calls(), vec![1]);

    let summary = running.await.unwrap();
    assert_eq!((summary.fulfilled, summary.abandoned), (1, 2));
}

#[tokio::test]
async fn caller_timeout_does_not_cancel_the_job() {
    let engine = Recorder::with_delay(Duration::from_millis(40));
    let (dispatcher, cancel, running) = start(&engine);

    let slow = dispatcher.submit(params(1));
    assert!(slow.wait_timeout(Duration::from_millis(5)).await.is_err());
    drop(slow);

    let next = dispatcher.submit(params(2));
    assert_eq!(tag(&next.wait().await.unwrap()), 2);
    assert_eq!(engine.calls(), vec![1, 2]);

    cancel.cancel();
    assert_eq!(running.await.unwrap().fulfilled, 2);
}
