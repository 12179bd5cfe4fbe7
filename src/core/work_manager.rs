//! Bounded worker pool that executes [`Job`]s on dedicated OS threads.
//!
//! Each worker thread owns a single-threaded tokio runtime, so job payloads can
//! be async without sharing the caller's runtime. Submission is admission
//! controlled: a job either gets a queue slot or is rejected with
//! [`WorkError::QueueFull`]. Nothing is dropped silently.
//!
//! # Design Principles
//!
//! - **No polling**: workers block in `select!` on the job queue and their
//!   retire signal; submitters await a per-job oneshot
//! - **Lock-free admission**: queue slots are reserved with a CAS loop on an
//!   atomic counter, against a capacity that can change at runtime
//! - **Clean shutdown**: dropping the sender lets workers drain the queue and exit

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::WorkManagerConfig;

use super::error::{JobError, WorkError};
use super::job::{Job, JobOutcome};

const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Snapshot of pool utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkStats {
    /// Live worker threads.
    pub worker_count: usize,
    /// Current queue capacity.
    pub queue_capacity: usize,
    /// Jobs waiting for a worker.
    pub queued_jobs: usize,
    /// Jobs currently executing.
    pub active_jobs: u64,
    /// Jobs accepted into the queue.
    pub submitted_jobs: u64,
    /// Jobs that ran without errors.
    pub completed_jobs: u64,
    /// Jobs that ran and reported errors.
    pub failed_jobs: u64,
    /// Jobs refused because the queue was full.
    pub rejected_jobs: u64,
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicUsize,
    active: AtomicU64,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

/// A job and the channel its submitter waits on.
struct Envelope {
    job: Job,
    reply: oneshot::Sender<Job>,
}

struct WorkerHandle {
    id: usize,
    /// Dropping this retires the worker once it is idle.
    retire_tx: Sender<()>,
    join: JoinHandle<()>,
}

/// Worker pool shared by every task.
///
/// Pool size bounds parallelism; queue capacity bounds how many jobs may wait
/// for a worker. Both can be changed while running.
pub struct WorkManager {
    queue_capacity: AtomicUsize,
    stack_size: usize,
    target_workers: AtomicUsize,
    job_tx: Mutex<Option<Sender<Envelope>>>,
    job_rx: Receiver<Envelope>,
    counters: Arc<Counters>,
    workers: Mutex<Vec<WorkerHandle>>,
    next_worker_id: AtomicUsize,
    started: AtomicBool,
    shutdown: AtomicBool,
}

impl WorkManager {
    /// Create a work manager. No worker runs until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// `WorkError::InvalidConfig` if the configuration is invalid.
    pub fn new(config: &WorkManagerConfig) -> Result<Self, WorkError> {
        config.validate().map_err(WorkError::InvalidConfig)?;
        let (job_tx, job_rx) = unbounded();
        Ok(Self {
            queue_capacity: AtomicUsize::new(config.max_queue_depth),
            stack_size: config.thread_stack_size,
            target_workers: AtomicUsize::new(config.worker_count),
            job_tx: Mutex::new(Some(job_tx)),
            job_rx,
            counters: Arc::new(Counters::default()),
            workers: Mutex::new(Vec::with_capacity(config.worker_count)),
            next_worker_id: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Spawn the configured number of workers. Calling it again does nothing.
    pub fn start(&self) {
        if self.shutdown.load(Ordering::Acquire) || self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let target = self.target_workers.load(Ordering::Acquire);
        let mut workers = self.workers.lock();
        self.spawn_workers(&mut workers, target);
        info!(
            worker_count = workers.len(),
            queue_capacity = self.queue_capacity.load(Ordering::Relaxed),
            "work manager started"
        );
    }

    /// Submit `job` and wait for a worker to run it.
    ///
    /// The returned job carries its [`JobOutcome`]. Failures inside the job
    /// are part of the outcome, not an `Err`.
    ///
    /// # Errors
    ///
    /// - `WorkError::QueueFull` if no queue slot is free
    /// - `WorkError::Stopped` if the manager has been stopped
    /// - `WorkError::Dropped` if the job was discarded during shutdown
    pub async fn work(&self, job: Job) -> Result<Job, WorkError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(WorkError::Stopped);
        }
        if let Err(capacity) = self.try_reserve_slot() {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(task_id = job.task_id(), job_id = %job.id(), capacity, "work queue is full");
            return Err(WorkError::QueueFull { capacity });
        }

        let job_id = job.id();
        let task_id = job.task_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = {
            let job_tx = self.job_tx.lock();
            job_tx.as_ref().is_some_and(|tx| {
                tx.send(Envelope {
                    job,
                    reply: reply_tx,
                })
                .is_ok()
            })
        };
        if !sent {
            self.counters.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(WorkError::Stopped);
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(task_id, job_id = %job_id, "job queued");

        reply_rx.await.map_err(|_| WorkError::Dropped)
    }

    /// Reserve a queue slot, returning the capacity on failure.
    fn try_reserve_slot(&self) -> Result<(), usize> {
        let capacity = self.queue_capacity.load(Ordering::Acquire);
        let mut current = self.counters.queued.load(Ordering::Acquire);
        loop {
            if current >= capacity {
                return Err(capacity);
            }
            match self.counters.queued.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Grow or shrink the pool.
    ///
    /// Shrinking retires workers; a worker that is running a job finishes it
    /// and then exits without taking another. Queued jobs stay queued for the
    /// remaining workers, so concurrency drops to `size` once in-flight jobs
    /// complete.
    ///
    /// # Errors
    ///
    /// `WorkError::InvalidConfig` for a zero size, `WorkError::Stopped` after stop.
    pub fn set_pool_size(&self, size: usize) -> Result<(), WorkError> {
        if size == 0 {
            return Err(WorkError::InvalidConfig("pool size must be greater than 0".into()));
        }
        if self.shutdown.load(Ordering::Acquire) {
            return Err(WorkError::Stopped);
        }
        self.target_workers.store(size, Ordering::Release);
        if !self.started.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut workers = self.workers.lock();
        let current = workers.len();
        if size > current {
            self.spawn_workers(&mut workers, size - current);
        } else {
            for handle in workers.drain(size..) {
                debug!(worker_id = handle.id, "retiring worker");
                drop(handle.retire_tx);
                drop(handle.join);
            }
        }
        info!(from = current, to = workers.len(), "work manager resized");
        Ok(())
    }

    /// Change how many jobs may wait for a worker.
    ///
    /// Jobs already queued are kept even when the new capacity is smaller.
    ///
    /// # Errors
    ///
    /// `WorkError::InvalidConfig` for a zero size.
    pub fn set_queue_size(&self, size: usize) -> Result<(), WorkError> {
        if size == 0 {
            return Err(WorkError::InvalidConfig("queue size must be greater than 0".into()));
        }
        let previous = self.queue_capacity.swap(size, Ordering::AcqRel);
        info!(from = previous, to = size, "work queue resized");
        Ok(())
    }

    /// Get current pool statistics.
    #[must_use]
    pub fn stats(&self) -> WorkStats {
        WorkStats {
            worker_count: self.workers.lock().len(),
            queue_capacity: self.queue_capacity.load(Ordering::Relaxed),
            queued_jobs: self.counters.queued.load(Ordering::Relaxed),
            active_jobs: self.counters.active.load(Ordering::Relaxed),
            submitted_jobs: self.counters.submitted.load(Ordering::Relaxed),
            completed_jobs: self.counters.completed.load(Ordering::Relaxed),
            failed_jobs: self.counters.failed.load(Ordering::Relaxed),
            rejected_jobs: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// True once [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting jobs, let workers drain the queue, and join them.
    ///
    /// Each worker gets a bounded wait; one that is still busy afterwards is
    /// detached and exits after its current job.
    pub fn stop(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("stopping work manager");

        // Workers see the queue disconnect only after it is empty.
        *self.job_tx.lock() = None;

        let workers: Vec<WorkerHandle> = self.workers.lock().drain(..).collect();
        let worker_count = workers.len();
        for WorkerHandle { id, retire_tx, join } in workers {
            let (tx, rx) = std::sync::mpsc::channel();
            let joiner = thread::spawn(move || {
                let _ = tx.send(join.join().is_ok());
            });
            match rx.recv_timeout(JOIN_TIMEOUT) {
                Ok(true) => debug!(worker_id = id, "worker joined"),
                Ok(false) => warn!(worker_id = id, "worker panicked"),
                Err(_) => warn!(worker_id = id, "worker still busy after stop, detaching"),
            }
            drop(retire_tx);
            drop(joiner);
        }

        // Anything left had no worker to run it; its submitter sees `Dropped`.
        let mut orphaned = 0usize;
        while let Ok(envelope) = self.job_rx.try_recv() {
            self.counters.queued.fetch_sub(1, Ordering::AcqRel);
            drop(envelope);
            orphaned += 1;
        }
        if orphaned > 0 {
            warn!(orphaned, "discarded queued jobs with no worker to run them");
        }
        info!(worker_count, "work manager stopped");
    }

    fn spawn_workers(&self, workers: &mut Vec<WorkerHandle>, count: usize) {
        for _ in 0..count {
            let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
            let (retire_tx, retire_rx) = crossbeam_channel::bounded::<()>(0);
            match spawn_worker(
                id,
                self.job_rx.clone(),
                retire_rx,
                Arc::clone(&self.counters),
                self.stack_size,
            ) {
                Ok(join) => workers.push(WorkerHandle { id, retire_tx, join }),
                Err(e) => error!(worker_id = id, error = %e, "failed to spawn worker thread"),
            }
        }
    }
}

impl Drop for WorkManager {
    fn drop(&mut self) {
        // Signal only; joining here could hang on a stuck job.
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            *self.job_tx.lock() = None;
            debug!("work manager dropped without stop, workers detached");
        }
    }
}

fn spawn_worker(
    worker_id: usize,
    job_rx: Receiver<Envelope>,
    retire_rx: Receiver<()>,
    counters: Arc<Counters>,
    stack_size: usize,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("ms-worker-{worker_id}"))
        .stack_size(stack_size)
        .spawn(move || {
            let Some(mut rt) = worker_runtime(worker_id) else {
                return;
            };
            debug!(worker_id, "worker started");

            loop {
                // Retirement wins over a ready job so a shrink takes effect
                // as soon as in-flight jobs finish.
                let envelope = crossbeam_channel::select_biased! {
                    recv(retire_rx) -> _ => break,
                    recv(job_rx) -> msg => match msg {
                        Ok(envelope) => envelope,
                        Err(_) => break,
                    },
                };
                counters.queued.fetch_sub(1, Ordering::AcqRel);
                counters.active.fetch_add(1, Ordering::Relaxed);

                let Envelope { mut job, reply } = envelope;
                debug!(worker_id, task_id = job.task_id(), job_id = %job.id(), "executing job");
                let outcome = execute(&rt, &mut job);
                let panicked = outcome
                    .errors
                    .iter()
                    .any(|e| matches!(e, JobError::Panicked(_)));
                if outcome.succeeded() {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                } else {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                }
                job.set_outcome(outcome);
                counters.active.fetch_sub(1, Ordering::Relaxed);

                if reply.send(job).is_err() {
                    debug!(worker_id, "submitter went away before the job finished");
                }

                // Tasks the payload spawned may be left behind by a panic.
                if panicked {
                    match worker_runtime(worker_id) {
                        Some(fresh) => rt = fresh,
                        None => break,
                    }
                }
            }

            debug!(worker_id, "worker exiting");
        })
}

fn worker_runtime(worker_id: usize) -> Option<tokio::runtime::Runtime> {
    match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => Some(rt),
        Err(e) => {
            error!(worker_id, error = %e, "failed to create worker runtime");
            None
        }
    }
}

/// Run one job under its timeout, turning a panic into a recorded error.
fn execute(rt: &tokio::runtime::Runtime, job: &mut Job) -> JobOutcome {
    let started_at = Utc::now();
    let timeout = job.timeout();
    let run = panic::catch_unwind(AssertUnwindSafe(|| {
        // The timer must be created inside the runtime, not before block_on.
        rt.block_on(async { tokio::time::timeout(timeout, job.payload_mut().run()).await })
    }));
    let errors = match run {
        Ok(Ok(Ok(()))) => Vec::new(),
        Ok(Ok(Err(errors))) => errors,
        Ok(Err(_elapsed)) => vec![JobError::Timeout(timeout)],
        Err(payload) => vec![JobError::Panicked(panic_message(payload.as_ref()))],
    };
    JobOutcome {
        started_at,
        finished_at: Utc::now(),
        errors,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::MetricError;
    use crate::core::job::JobPayload;
    use async_trait::async_trait;

    struct Sleep(Duration);

    #[async_trait]
    impl JobPayload for Sleep {
        async fn run(&mut self) -> Result<(), Vec<JobError>> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    struct Fail;

    #[async_trait]
    impl JobPayload for Fail {
        async fn run(&mut self) -> Result<(), Vec<JobError>> {
            Err(vec![JobError::Collection(MetricError::Collection("offline".into()))])
        }
    }

    struct Panic;

    #[async_trait]
    impl JobPayload for Panic {
        async fn run(&mut self) -> Result<(), Vec<JobError>> {
            panic!("payload exploded");
        }
    }

    fn manager(workers: usize, queue: usize) -> WorkManager {
        let wm = WorkManager::new(
            &WorkManagerConfig::new()
                .with_worker_count(workers)
                .with_max_queue_depth(queue),
        )
        .unwrap();
        wm.start();
        wm
    }

    fn job(payload: impl JobPayload) -> Job {
        Job::new(1, Duration::from_secs(5), Box::new(payload))
    }

    #[test]
    fn test_rejects_invalid_config() {
        let err = WorkManager::new(&WorkManagerConfig::new().with_worker_count(0)).err().unwrap();
        assert!(matches!(err, WorkError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_work_returns_job_with_outcome() {
        let wm = manager(2, 10);
        let done = wm.work(job(Sleep(Duration::from_millis(5)))).await.unwrap();
        let outcome = done.outcome().unwrap();
        assert!(outcome.succeeded());
        assert!(outcome.finished_at >= outcome.started_at);

        let stats = wm.stats();
        assert_eq!(stats.submitted_jobs, 1);
        assert_eq!(stats.completed_jobs, 1);
        assert_eq!(stats.queued_jobs, 0);
        assert_eq!(stats.active_jobs, 0);
        wm.stop();
    }

    #[tokio::test]
    async fn test_job_errors_are_recorded_not_returned() {
        let wm = manager(1, 10);
        let done = wm.work(job(Fail)).await.unwrap();
        assert_eq!(done.outcome().unwrap().errors.len(), 1);
        assert_eq!(wm.stats().failed_jobs, 1);
        wm.stop();
    }

    #[tokio::test]
    async fn test_job_timeout_is_enforced() {
        let wm = manager(1, 10);
        let slow = Job::new(1, Duration::from_millis(20), Box::new(Sleep(Duration::from_secs(5))));
        let done = wm.work(slow).await.unwrap();
        assert_eq!(
            done.outcome().unwrap().errors,
            vec![JobError::Timeout(Duration::from_millis(20))]
        );
        wm.stop();
    }

    #[test]
    fn test_execute_outside_any_ambient_runtime() {
        let rt = worker_runtime(0).unwrap();
        let mut quick = job(Sleep(Duration::from_millis(1)));
        assert!(execute(&rt, &mut quick).succeeded());

        let mut slow = Job::new(1, Duration::from_millis(10), Box::new(Sleep(Duration::from_secs(5))));
        assert_eq!(
            execute(&rt, &mut slow).errors,
            vec![JobError::Timeout(Duration::from_millis(10))]
        );
    }

    #[tokio::test]
    async fn test_worker_survives_panicking_job() {
        let wm = manager(1, 10);
        let done = wm.work(job(Panic)).await.unwrap();
        assert!(matches!(
            done.outcome().unwrap().errors.as_slice(),
            [JobError::Panicked(msg)] if msg.contains("payload exploded")
        ));
        let next = wm.work(job(Sleep(Duration::from_millis(1)))).await.unwrap();
        assert!(next.outcome().unwrap().succeeded());
        wm.stop();
    }

    #[tokio::test]
    async fn test_work_after_stop_is_rejected() {
        let wm = manager(1, 10);
        wm.stop();
        assert!(wm.is_stopped());
        assert_eq!(wm.work(job(Fail)).await.unwrap_err(), WorkError::Stopped);
    }

    #[test]
    fn test_resize_validation() {
        let wm = manager(2, 4);
        assert!(matches!(wm.set_pool_size(0), Err(WorkError::InvalidConfig(_))));
        assert!(matches!(wm.set_queue_size(0), Err(WorkError::InvalidConfig(_))));
        wm.set_pool_size(4).unwrap();
        assert_eq!(wm.stats().worker_count, 4);
        wm.set_pool_size(1).unwrap();
        assert_eq!(wm.stats().worker_count, 1);
        wm.set_queue_size(8).unwrap();
        assert_eq!(wm.stats().queue_capacity, 8);
        wm.stop();
        assert_eq!(wm.set_pool_size(2), Err(WorkError::Stopped));
    }

    #[test]
    fn test_start_is_idempotent() {
        let wm = manager(3, 4);
        wm.start();
        assert_eq!(wm.stats().worker_count, 3);
        wm.stop();
    }
}
