//! Fixed-size worker pool draining a job queue.
//!
//! Producers push [`JobEnvelope`]s into a [`JobQueue`]; `N` workers take
//! them, run the processing function and forward non-empty results to an
//! optional output channel. Shutdown pushes one poison envelope per worker.
//!
//! ```text
//!   producer --> JobQueue --> worker 0 --+
//!                        \--> worker 1 --+--> output
//!                         \-> worker N --+
//! ```
//!
//! Output order is not input order when `N > 1`.

use crate::schedule::panic_message;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, SendError, Sender};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Lifecycle tag carried by every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Initiated,
    Started,
    Running,
    Finished,
    Poison,
}

/// A payload travelling through a pipeline.
#[derive(Debug)]
pub struct JobEnvelope<T> {
    status: JobStatus,
    payload: Option<T>,
}

impl<T> JobEnvelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            status: JobStatus::Initiated,
            payload: Some(payload),
        }
    }

    /// The shutdown sentinel.
    pub fn poison() -> Self {
        Self {
            status: JobStatus::Poison,
            payload: None,
        }
    }

    pub fn is_poison(&self) -> bool {
        self.status == JobStatus::Poison
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
    }

    pub fn payload(&self) -> Option<&T> {
        self.payload.as_ref()
    }

    pub fn into_payload(self) -> Option<T> {
        self.payload
    }
}

/// Input queue of a pipeline; bounded queues block producers when full.
pub struct JobQueue<T> {
    tx: Sender<JobEnvelope<T>>,
    rx: Receiver<JobEnvelope<T>>,
}

impl<T> Clone for JobQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> JobQueue<T> {
    pub fn unbounded() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }

    /// Enqueue a payload, blocking while a bounded queue is full.
    pub fn put(&self, payload: T) -> Result<(), SendError<JobEnvelope<T>>> {
        self.tx.send(JobEnvelope::new(payload))
    }

    pub fn put_envelope(&self, envelope: JobEnvelope<T>) -> Result<(), SendError<JobEnvelope<T>>> {
        self.tx.send(envelope)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.tx.capacity()
    }
}

/// Result of processing one payload.
pub type ProcessResult<U> = Result<Option<U>, Box<dyn std::error::Error + Send + Sync>>;

/// Counters shared by all workers of a pipeline.
#[derive(Debug, Default)]
struct PipelineStats {
    processed: AtomicU64,
    failed: AtomicU64,
}

/// A running worker pool.
pub struct Pipeline<T> {
    name: String,
    queue: JobQueue<T>,
    workers: usize,
    exited: Receiver<usize>,
    stats: Arc<PipelineStats>,
}

impl<T: Send + 'static> Pipeline<T> {
    /// Start `workers` threads draining `queue` through `process`.
    pub fn start<U, F>(
        name: impl Into<String>,
        workers: usize,
        queue: JobQueue<T>,
        output: Option<Sender<U>>,
        process: F,
    ) -> io::Result<Self>
    where
        U: Send + 'static,
        F: Fn(T) -> ProcessResult<U> + Send + Sync + 'static,
    {
        let name = name.into();
        let workers = workers.max(1);
        let process = Arc::new(process);
        let stats = Arc::new(PipelineStats::default());
        let (exit_tx, exited) = unbounded();

        for worker_id in 0..workers {
            let rx = queue.rx.clone();
            let output = output.clone();
            let process = Arc::clone(&process);
            let stats = Arc::clone(&stats);
            let exit_tx = exit_tx.clone();
            let pipeline = name.clone();

            thread::Builder::new()
                .name(format!("{name}-{worker_id}"))
                .spawn(move || {
                    worker_loop(&pipeline, worker_id, rx, output, process.as_ref(), &stats);
                    let _ = exit_tx.send(worker_id);
                })?;
        }

        debug!(pipeline = %name, workers, "Pipeline started");
        Ok(Self {
            name,
            queue,
            workers,
            exited,
            stats,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn queue(&self) -> &JobQueue<T> {
        &self.queue
    }

    /// Enqueue a payload; blocks while a bounded queue is full.
    pub fn enqueue(&self, payload: T) -> io::Result<()> {
        self.queue
            .put(payload)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipeline queue closed"))
    }

    pub fn processed(&self) -> u64 {
        self.stats.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    /// Send one poison envelope per worker and wait for them to exit.
    ///
    /// Returns the number of workers still running when `timeout` elapsed;
    /// those are abandoned, not interrupted.
    pub fn shutdown(self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        for _ in 0..self.workers {
            if self
                .queue
                .tx
                .send_deadline(JobEnvelope::poison(), deadline)
                .is_err()
            {
                break;
            }
        }

        let mut remaining = self.workers;
        while remaining > 0 {
            match self.exited.recv_deadline(deadline) {
                Ok(_) => remaining -= 1,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if remaining > 0 {
            warn!(pipeline = %self.name, remaining, "Abandoning pipeline workers after shutdown timeout");
        } else {
            debug!(pipeline = %self.name, processed = self.processed(), "Pipeline shut down");
        }
        remaining
    }
}

/// Run the payload of `envelope` through `process`, moving the envelope
/// from `Started` to `Running` to `Finished`.
///
/// An envelope without payload stays `Started` and yields `None`.
fn execute<T, U>(
    envelope: &mut JobEnvelope<T>,
    process: &(dyn Fn(T) -> ProcessResult<U> + Send + Sync),
) -> Option<thread::Result<ProcessResult<U>>> {
    envelope.set_status(JobStatus::Started);
    let payload = envelope.payload.take()?;
    envelope.set_status(JobStatus::Running);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| process(payload)));
    envelope.set_status(JobStatus::Finished);
    Some(outcome)
}

fn worker_loop<T, U>(
    pipeline: &str,
    worker_id: usize,
    rx: Receiver<JobEnvelope<T>>,
    output: Option<Sender<U>>,
    process: &(dyn Fn(T) -> ProcessResult<U> + Send + Sync),
    stats: &PipelineStats,
) {
    while let Ok(mut envelope) = rx.recv() {
        if envelope.is_poison() {
            break;
        }
        let Some(outcome) = execute(&mut envelope, process) else {
            continue;
        };

        match outcome {
            Ok(Ok(Some(result))) => {
                stats.processed.fetch_add(1, Ordering::Relaxed);
                if let Some(output) = &output {
                    if output.send(result).is_err() {
                        warn!(pipeline, worker = worker_id, "Output channel closed, dropping result");
                    }
                }
            }
            Ok(Ok(None)) => {
                stats.processed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(pipeline, worker = worker_id, error = %e, "Pipeline job failed");
            }
            Err(payload) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    pipeline,
                    worker = worker_id,
                    panic = %panic_message(payload.as_ref()),
                    "Pipeline job panicked"
                );
            }
        }
    }
    debug!(pipeline, worker = worker_id, "Pipeline worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_all_items_processed_and_workers_exit() {
        let queue = JobQueue::unbounded();
        let (out_tx, out_rx) = unbounded();
        let pipeline = Pipeline::start("double", 4, queue.clone(), Some(out_tx), |n: u32| {
            Ok(Some(n * 2))
        })
        .unwrap();

        for n in 0..100u32 {
            pipeline.enqueue(n).unwrap();
        }
        assert_eq!(pipeline.shutdown(Duration::from_secs(5)), 0);

        let results: BTreeSet<u32> = out_rx.try_iter().collect();
        assert_eq!(results.len(), 100);
        assert!(results.contains(&198));
    }

    #[test]
    fn test_failures_do_not_kill_workers() {
        let queue = JobQueue::unbounded();
        let (out_tx, out_rx) = unbounded();
        let pipeline = Pipeline::start("flaky", 2, queue, Some(out_tx), |n: u32| {
            if n % 3 == 0 {
                return Err(format!("bad item {n}").into());
            }
            if n % 5 == 0 {
                panic!("worse item {n}");
            }
            Ok(Some(n))
        })
        .unwrap();

        for n in 1..=30u32 {
            pipeline.enqueue(n).unwrap();
        }
        let before_shutdown = Instant::now();
        assert_eq!(pipeline.shutdown(Duration::from_secs(5)), 0);
        assert!(before_shutdown.elapsed() < Duration::from_secs(5));

        let results: Vec<u32> = out_rx.try_iter().collect();
        // 10 multiples of 3, and 5, 10, 20, 25 are multiples of 5 only
        assert_eq!(results.len(), 30 - 10 - 4);
    }

    #[test]
    fn test_empty_results_are_not_forwarded() {
        let queue = JobQueue::unbounded();
        let (out_tx, out_rx) = unbounded();
        let pipeline = Pipeline::start("evens", 3, queue, Some(out_tx), |n: u32| {
            Ok((n % 2 == 0).then_some(n))
        })
        .unwrap();
        for n in 0..10u32 {
            pipeline.enqueue(n).unwrap();
        }
        assert_eq!(pipeline.shutdown(Duration::from_secs(5)), 0);
        assert_eq!(out_rx.try_iter().count(), 5);
    }

    #[test]
    fn test_shutdown_abandons_stuck_workers() {
        let queue = JobQueue::unbounded();
        let (release_tx, release_rx) = unbounded::<()>();
        let pipeline = Pipeline::start("stuck", 1, queue, None::<Sender<()>>, move |_: u32| {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
            Ok(None)
        })
        .unwrap();
        pipeline.enqueue(1).unwrap();
        thread::sleep(Duration::from_millis(20));

        assert_eq!(pipeline.shutdown(Duration::from_millis(50)), 1);
        let _ = release_tx.send(());
    }

    #[test]
    fn test_bounded_queue_applies_backpressure() {
        let queue: JobQueue<u32> = JobQueue::bounded(1);
        assert_eq!(queue.capacity(), Some(1));
        queue.put(1).unwrap();
        assert_eq!(queue.len(), 1);

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                let start = Instant::now();
                queue.put(2).unwrap();
                start.elapsed()
            })
        };
        thread::sleep(Duration::from_millis(50));

        let (out_tx, out_rx) = unbounded();
        let pipeline = Pipeline::start("drain", 1, queue, Some(out_tx), |n: u32| Ok(Some(n))).unwrap();
        let waited = producer.join().unwrap();
        assert!(waited >= Duration::from_millis(40));
        assert_eq!(pipeline.shutdown(Duration::from_secs(5)), 0);
        assert_eq!(out_rx.try_iter().count(), 2);
    }

    #[test]
    fn test_envelope_status() {
        let mut envelope = JobEnvelope::new("doc");
        assert_eq!(envelope.status(), JobStatus::Initiated);
        envelope.set_status(JobStatus::Running);
        assert_eq!(envelope.payload(), Some(&"doc"));
        assert!(!envelope.is_poison());
        assert!(JobEnvelope::<u8>::poison().is_poison());
        assert_eq!(JobEnvelope::<u8>::poison().into_payload(), None);
    }

    #[test]
    fn test_execute_moves_envelope_to_finished() {
        let double = |n: u32| -> ProcessResult<u32> { Ok(Some(n * 2)) };

        let mut envelope = JobEnvelope::new(21);
        match execute::<u32, u32>(&mut envelope, &double) {
            Some(Ok(Ok(Some(42)))) => {}
            other => panic!("unexpected: {:?}", other.map(|r| r.is_ok())),
        }
        assert_eq!(envelope.status(), JobStatus::Finished);
        assert_eq!(envelope.payload(), None);

        // already consumed: nothing to run
        assert!(execute::<u32, u32>(&mut envelope, &double).is_none());
        assert_eq!(envelope.status(), JobStatus::Started);
    }

    #[test]
    fn test_execute_finishes_panicking_job() {
        let explode = |_: u32| -> ProcessResult<u32> { panic!("boom") };
        let mut envelope = JobEnvelope::new(1);
        assert!(matches!(execute::<u32, u32>(&mut envelope, &explode), Some(Err(_))));
        assert_eq!(envelope.status(), JobStatus::Finished);
    }
}
