//! Integration tests for the WorkManager
//!
//! These tests validate:
//! - Backpressure: bounded queue and explicit `QueueFull`
//! - Concurrency never exceeds the pool size
//! - Each job returns to its own submitter
//! - Runtime resizing without losing queued jobs
//! - Shrinking the pool bounds concurrency once in-flight jobs finish
//! - Graceful stop drains queued jobs

use async_trait::async_trait;
use crossbeam_channel::{bounded, Receiver, Sender};
use metric_scheduler::config::WorkManagerConfig;
use metric_scheduler::core::{Job, JobError, JobPayload, WorkError, WorkManager};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// TEST PAYLOADS
// ============================================================================

/// Blocks its worker until the gate sender is dropped.
struct Gated(Receiver<()>);

#[async_trait]
impl JobPayload for Gated {
    async fn run(&mut self) -> Result<(), Vec<JobError>> {
        let _ = self.0.recv();
        Ok(())
    }
}

/// Tracks how many jobs run at once.
struct Gauge {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl JobPayload for Gauge {
    async fn run(&mut self) -> Result<(), Vec<JobError>> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Nap(u64);

#[async_trait]
impl JobPayload for Nap {
    async fn run(&mut self) -> Result<(), Vec<JobError>> {
        tokio::time::sleep(Duration::from_millis(self.0)).await;
        Ok(())
    }
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn manager(workers: usize, queue: usize) -> Arc<WorkManager> {
    let wm = WorkManager::new(
        &WorkManagerConfig::new()
            .with_worker_count(workers)
            .with_max_queue_depth(queue),
    )
    .unwrap();
    wm.start();
    Arc::new(wm)
}

fn job(task_id: u64, payload: impl JobPayload) -> Job {
    Job::new(task_id, Duration::from_secs(10), Box::new(payload))
}

fn gate() -> (Sender<()>, Receiver<()>) {
    bounded(0)
}

async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// ============================================================================
// BACKPRESSURE
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_queue_rejects_explicitly() {
    let wm = manager(1, 2);
    let (release, held) = gate();

    let mut pending = Vec::new();
    for id in 1..=3 {
        let wm = Arc::clone(&wm);
        let worker = Arc::clone(&wm);
        let held = held.clone();
        pending.push(tokio::spawn(async move { worker.work(job(id, Gated(held))).await }));
        if id == 1 {
            let watch = Arc::clone(&wm);
            wait_until(|| watch.stats().active_jobs == 1).await;
        }
    }
    let watch = Arc::clone(&wm);
    wait_until(|| watch.stats().queued_jobs == 2).await;

    let rejected = wm.work(job(4, Nap(0))).await.unwrap_err();
    assert_eq!(rejected, WorkError::QueueFull { capacity: 2 });
    assert_eq!(wm.stats().rejected_jobs, 1);

    drop(release);
    for handle in pending {
        let done = handle.await.unwrap().unwrap();
        assert!(done.outcome().unwrap().succeeded());
    }
    let stats = wm.stats();
    assert_eq!(stats.submitted_jobs, 3);
    assert_eq!(stats.completed_jobs, 3);
    wm.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrency_never_exceeds_pool_size() {
    let wm = manager(3, 50);
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..20)
        .map(|id| {
            let wm = Arc::clone(&wm);
            let payload = Gauge {
                current: Arc::clone(&current),
                peak: Arc::clone(&peak),
            };
            tokio::spawn(async move { wm.work(job(id, payload)).await })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    let peak = peak.load(Ordering::SeqCst);
    assert!((1..=3).contains(&peak), "peak concurrency {peak}");
    assert_eq!(wm.stats().completed_jobs, 20);
    wm.stop();
}

// ============================================================================
// ROUTING
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_jobs_return_to_their_submitter() {
    let wm = manager(4, 64);

    let handles: Vec<_> = (1..=40)
        .map(|id| {
            let wm = Arc::clone(&wm);
            tokio::spawn(async move {
                let sent = job(id, Nap(id % 5));
                let job_id = sent.id();
                let back = wm.work(sent).await.unwrap();
                (id, job_id, back)
            })
        })
        .collect();

    for handle in handles {
        let (id, job_id, back) = handle.await.unwrap();
        assert_eq!(back.task_id(), id);
        assert_eq!(back.id(), job_id);
    }
    wm.stop();
}

// ============================================================================
// RESIZING
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resize_keeps_queued_jobs() {
    let wm = manager(1, 10);
    let (release, held) = gate();

    let first = {
        let wm = Arc::clone(&wm);
        tokio::spawn(async move { wm.work(job(1, Gated(held))).await })
    };
    let watch = Arc::clone(&wm);
    wait_until(|| watch.stats().active_jobs == 1).await;

    let queued: Vec<_> = (2..=6)
        .map(|id| {
            let wm = Arc::clone(&wm);
            tokio::spawn(async move { wm.work(job(id, Nap(5))).await })
        })
        .collect();
    let watch = Arc::clone(&wm);
    wait_until(|| watch.stats().queued_jobs == 5).await;

    // Shrinking capacity below the backlog keeps what is already queued.
    wm.set_queue_size(2).unwrap();
    assert!(matches!(
        wm.work(job(7, Nap(0))).await,
        Err(WorkError::QueueFull { capacity: 2 })
    ));

    // A new worker picks up the backlog while the first is still held.
    wm.set_pool_size(2).unwrap();
    for handle in queued {
        assert!(handle.await.unwrap().is_ok());
    }

    wm.set_pool_size(1).unwrap();
    drop(release);
    assert!(first.await.unwrap().is_ok());
    assert_eq!(wm.stats().completed_jobs, 6);
    wm.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shrink_bounds_concurrency_after_in_flight_jobs() {
    let wm = manager(3, 50);
    let (release, held) = gate();

    let busy: Vec<_> = (1..=3)
        .map(|id| {
            let wm = Arc::clone(&wm);
            let held = held.clone();
            tokio::spawn(async move { wm.work(job(id, Gated(held))).await })
        })
        .collect();
    let watch = Arc::clone(&wm);
    wait_until(|| watch.stats().active_jobs == 3).await;

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let queued: Vec<_> = (10..30)
        .map(|id| {
            let wm = Arc::clone(&wm);
            let payload = Gauge {
                current: Arc::clone(&current),
                peak: Arc::clone(&peak),
            };
            tokio::spawn(async move { wm.work(job(id, payload)).await })
        })
        .collect();
    let watch = Arc::clone(&wm);
    wait_until(|| watch.stats().queued_jobs == 20).await;

    // All three workers are busy; two of them must exit instead of taking
    // queued jobs once released.
    wm.set_pool_size(1).unwrap();
    assert_eq!(wm.stats().worker_count, 1);
    drop(release);

    for handle in busy.into_iter().chain(queued) {
        assert!(handle.await.unwrap().is_ok());
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(wm.stats().completed_jobs, 23);
    wm.stop();
}

// ============================================================================
// SHUTDOWN
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_drains_queued_jobs() {
    let wm = manager(1, 10);

    let handles: Vec<_> = (1..=5)
        .map(|id| {
            let wm = Arc::clone(&wm);
            tokio::spawn(async move { wm.work(job(id, Nap(20))).await })
        })
        .collect();
    let watch = Arc::clone(&wm);
    wait_until(|| watch.stats().submitted_jobs == 5).await;

    let stopper = Arc::clone(&wm);
    tokio::task::spawn_blocking(move || stopper.stop())
        .await
        .unwrap();

    for handle in handles {
        assert!(handle.await.unwrap().unwrap().outcome().unwrap().succeeded());
    }
    assert_eq!(
        wm.work(job(9, Nap(0))).await.unwrap_err(),
        WorkError::Stopped
    );
}
