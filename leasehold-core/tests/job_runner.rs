mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use common::{name, steal, tokio_manager};
use leasehold_core::{
    ClusterJob, ExclusiveJobRunner, JobContext, JobMode, JobOutcome, LockConfig, LockManager,
    LockName, MemoryLockStore, RenewalScheduler, ShutdownSignal,
};
use tokio::time::sleep;

const TTL: Duration = Duration::from_millis(300);

#[derive(Clone, Copy)]
enum Behavior {
    Finish,
    Fail,
    Panic,
    /// Work in small batches, checking the lease between them.
    Batches(usize),
}

struct TestJob {
    lock: LockName,
    behavior: Behavior,
    runs: AtomicUsize,
    batches: AtomicUsize,
}

impl TestJob {
    fn new(local_name: &str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            lock: name(local_name),
            behavior,
            runs: AtomicUsize::new(0),
            batches: AtomicUsize::new(0),
        })
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterJob for TestJob {
    fn lock_name(&self) -> &LockName {
        &self.lock
    }

    async fn run(&self, ctx: &JobContext) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Finish => Ok(()),
            Behavior::Fail => bail!("batch insert failed"),
            Behavior::Panic => panic!("job blew up"),
            Behavior::Batches(count) => {
                for _ in 0..count {
                    ctx.ensure_active()?;
                    sleep(Duration::from_millis(50)).await;
                    self.batches.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }
        }
    }
}

fn runner(manager: Arc<LockManager>, shutdown: ShutdownSignal) -> ExclusiveJobRunner {
    let scheduler = RenewalScheduler::new(manager, shutdown, &LockConfig::default());
    ExclusiveJobRunner::new(Arc::new(scheduler), TTL)
}

#[tokio::test(start_paused = true)]
async fn singleton_job_completes_and_releases() -> Result<()> {
    let (_store, manager) = tokio_manager();
    let runner = runner(manager.clone(), ShutdownSignal::new());
    let job = TestJob::new("nightly", Behavior::Batches(20));

    let outcome = runner.run(job.as_ref(), JobMode::ClusterSingleton).await?;
    assert_eq!(outcome, JobOutcome::Completed);
    // 20 batches of 50ms outlive several leases.
    assert_eq!(job.batches.load(Ordering::SeqCst), 20);
    assert!(!manager.is_held(job.lock_name()).await?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn lease_too_short_to_renew_never_runs_the_job() -> Result<()> {
    let (_store, manager) = tokio_manager();
    let scheduler = RenewalScheduler::new(manager.clone(), ShutdownSignal::new(), &LockConfig::default());
    let runner = ExclusiveJobRunner::new(Arc::new(scheduler), Duration::from_millis(5));
    let job = TestJob::new("nightly", Behavior::Finish);

    let err = runner.run_once(job.as_ref()).await.unwrap_err();
    assert!(format!("{err:#}").contains("too short to renew"));
    assert_eq!(job.runs(), 0);
    assert!(!manager.is_held(job.lock_name()).await?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn held_lock_skips_the_round() -> Result<()> {
    let (_store, manager) = tokio_manager();
    let runner = runner(manager.clone(), ShutdownSignal::new());
    let job = TestJob::new("nightly", Behavior::Finish);
    let other = manager.acquire(job.lock_name(), Duration::from_secs(60)).await?;

    let outcome = runner.run_once(job.as_ref()).await?;
    assert_eq!(outcome, JobOutcome::Skipped);
    assert_eq!(job.runs(), 0);

    // The other node's lock is untouched.
    manager.refresh(&other, job.lock_name(), TTL).await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn lost_lock_aborts_the_job() -> Result<()> {
    let (store, manager) = tokio_manager();
    let runner = runner(manager.clone(), ShutdownSignal::new());
    let job = TestJob::new("rebuild", Behavior::Batches(100));

    let thief = {
        let manager = manager.clone();
        let lock = job.lock_name().clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(220)).await;
            steal(store.as_ref(), &manager, &lock, Duration::from_secs(60)).await
        })
    };

    let outcome = runner.run_once(job.as_ref()).await?;
    assert_eq!(outcome, JobOutcome::Aborted);
    assert!(job.batches.load(Ordering::SeqCst) < 100);

    // The new owner still holds it after the aborted job released.
    thief.await??;
    assert!(manager.is_held(job.lock_name()).await?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failing_job_still_releases() -> Result<()> {
    let (_store, manager) = tokio_manager();
    let runner = runner(manager.clone(), ShutdownSignal::new());

    let failing = TestJob::new("fails", Behavior::Fail);
    let err = runner.run_once(failing.as_ref()).await.unwrap_err();
    assert!(format!("{err:#}").contains("batch insert failed"));
    assert!(!manager.is_held(failing.lock_name()).await?);

    let panicking = TestJob::new("panics", Behavior::Panic);
    assert!(runner.run_once(panicking.as_ref()).await.is_err());
    assert!(!manager.is_held(panicking.lock_name()).await?);

    // Both locks are free for the next round.
    manager.acquire(failing.lock_name(), TTL).await?;
    manager.acquire(panicking.lock_name(), TTL).await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn every_node_jobs_ignore_the_lock() -> Result<()> {
    let (_store, manager) = tokio_manager();
    let runner = runner(manager.clone(), ShutdownSignal::new());
    let job = TestJob::new("local-cache-sweep", Behavior::Finish);
    manager.acquire(job.lock_name(), Duration::from_secs(60)).await?;

    let outcome = runner.run(job.as_ref(), JobMode::EveryNode).await?;
    assert_eq!(outcome, JobOutcome::Completed);
    assert_eq!(job.runs(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_running_job() -> Result<()> {
    let (_store, manager) = tokio_manager();
    let shutdown = ShutdownSignal::new();
    let runner = runner(manager.clone(), shutdown.clone());
    let job = TestJob::new("draining", Behavior::Batches(100));

    let trigger = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(175)).await;
            shutdown.trigger();
        })
    };
    let outcome = runner.run_once(job.as_ref()).await?;
    trigger.await?;
    assert_eq!(outcome, JobOutcome::Aborted);
    assert!(!manager.is_held(job.lock_name()).await?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn scheduled_job_runs_until_shutdown() -> Result<()> {
    let manager = Arc::new(LockManager::new(Arc::new(MemoryLockStore::new())));
    let shutdown = ShutdownSignal::new();
    let runner = Arc::new(runner(manager, shutdown.clone()));
    let job = TestJob::new("hourly", Behavior::Finish);

    let task = runner.spawn_scheduled(
        job.clone(),
        JobMode::ClusterSingleton,
        Duration::from_millis(100),
    );
    sleep(Duration::from_millis(350)).await;
    shutdown.trigger();
    task.await?;

    let runs = job.runs();
    assert!(runs >= 3, "expected at least 3 runs, got {runs}");
    sleep(Duration::from_millis(500)).await;
    assert_eq!(job.runs(), runs);
    Ok(())
}
