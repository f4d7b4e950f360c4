//! Scheduled jobs on top of the lock manager.
//!
//! A cluster-singleton job runs as: acquire → start renewal → run → stop renewal
//! → release, with the release happening whatever the job did (including
//! panicking). Jobs that must run on every node skip the lock entirely.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::name::LockName;
use crate::renewal::{FnCallback, LeaseStatus, RenewalScheduler, ShutdownSignal};

/// How a job is scheduled across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    /// At most one node runs the job at a time.
    ClusterSingleton,
    /// Every node runs the job; the lock subsystem is not involved.
    EveryNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Another node holds the lock this round.
    Skipped,
    /// The lock was lost or the process is shutting down.
    Aborted,
}

/// Returned by [`JobContext::ensure_active`] when the job must stop.
#[derive(Debug, Error)]
#[error("job interrupted: {0}")]
pub struct JobInterrupted(&'static str);

#[async_trait]
pub trait ClusterJob: Send + Sync {
    fn lock_name(&self) -> &LockName;

    /// Do the work. Long jobs should check `ctx` between batches.
    async fn run(&self, ctx: &JobContext) -> Result<()>;
}

/// What a running job sees of its lease and of process shutdown.
#[derive(Clone)]
pub struct JobContext {
    lease: Option<LeaseStatus>,
    shutdown: ShutdownSignal,
}

impl JobContext {
    pub fn exclusive(lease: LeaseStatus, shutdown: ShutdownSignal) -> Self {
        Self {
            lease: Some(lease),
            shutdown,
        }
    }

    pub fn local(shutdown: ShutdownSignal) -> Self {
        Self {
            lease: None,
            shutdown,
        }
    }

    pub fn should_continue(&self) -> bool {
        if self.shutdown.is_triggered() {
            return false;
        }
        self.lease.as_ref().map_or(true, LeaseStatus::is_active)
    }

    /// `Err(JobInterrupted)` once the job should stop; meant for `?` between batches.
    pub fn ensure_active(&self) -> Result<(), JobInterrupted> {
        if self.shutdown.is_triggered() {
            return Err(JobInterrupted("process is shutting down"));
        }
        match &self.lease {
            Some(lease) if lease.is_lost() => Err(JobInterrupted("lock lost")),
            Some(lease) if !lease.is_active() => Err(JobInterrupted("lease no longer renewed")),
            _ => Ok(()),
        }
    }

    /// Resolves when the lock is lost; pending forever for unlocked jobs.
    pub async fn lost(&self) {
        match &self.lease {
            Some(lease) => lease.lost().await,
            None => std::future::pending().await,
        }
    }

    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }
}

pub struct ExclusiveJobRunner {
    scheduler: Arc<RenewalScheduler>,
    ttl: Duration,
}

impl ExclusiveJobRunner {
    pub fn new(scheduler: Arc<RenewalScheduler>, ttl: Duration) -> Self {
        Self { scheduler, ttl }
    }

    pub async fn run(&self, job: &dyn ClusterJob, mode: JobMode) -> Result<JobOutcome> {
        match mode {
            JobMode::ClusterSingleton => self.run_once(job).await,
            JobMode::EveryNode => self.run_local(job).await,
        }
    }

    /// One cluster-singleton execution of `job`.
    pub async fn run_once(&self, job: &dyn ClusterJob) -> Result<JobOutcome> {
        let name = job.lock_name().clone();
        self.scheduler
            .check_ttl(self.ttl)
            .with_context(|| format!("job {name} cannot hold its lock"))?;
        let manager = self.scheduler.manager();
        let token = match manager.acquire(&name, self.ttl).await {
            Ok(token) => token,
            Err(err) if err.is_contention() => {
                info!(job = %name, "job skipped this round: lock held by another instance");
                return Ok(JobOutcome::Skipped);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("acquiring lock for job {name}"));
            }
        };

        let lost_name = name.clone();
        let callback = Arc::new(FnCallback::new(
            || true,
            move || info!(job = %lost_name, "job lock lost; the job should stop"),
        ));
        let handle = match self
            .scheduler
            .start_renewal(token.clone(), name.clone(), self.ttl, callback)
        {
            Ok(handle) => handle,
            Err(err) => {
                if let Err(release_err) = manager.release(&token, &name).await {
                    warn!(job = %name, error = %release_err, "failed to release job lock");
                }
                return Err(err).with_context(|| format!("starting lease renewal for job {name}"));
            }
        };
        let ctx = JobContext::exclusive(handle.status(), self.scheduler.shutdown().clone());

        let result = AssertUnwindSafe(job.run(&ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow!("job {name} panicked")));
        let lost = handle.is_lost();

        match handle.release().await {
            Ok(true) => debug!(job = %name, "job lock released"),
            Ok(false) => debug!(job = %name, "job lock was already gone at release"),
            Err(err) => warn!(job = %name, error = %err, "failed to release job lock"),
        }

        if lost {
            info!(job = %name, "job aborted: lock lost while running");
            return Ok(JobOutcome::Aborted);
        }
        interpret(&name, result)
    }

    /// Run on this node without any locking.
    pub async fn run_local(&self, job: &dyn ClusterJob) -> Result<JobOutcome> {
        let name = job.lock_name().clone();
        let ctx = JobContext::local(self.scheduler.shutdown().clone());
        let result = AssertUnwindSafe(job.run(&ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow!("job {name} panicked")));
        interpret(&name, result)
    }

    /// Run `job` every `tick` until shutdown. Failures are logged and retried on
    /// the next tick.
    pub fn spawn_scheduled(
        self: Arc<Self>,
        job: Arc<dyn ClusterJob>,
        mode: JobMode,
        tick: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let shutdown = self.scheduler.shutdown().clone();
            let mut ticker = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.wait() => {
                        debug!(job = %job.lock_name(), "scheduled job loop stopped for shutdown");
                        return;
                    }
                }
                match self.run(job.as_ref(), mode).await {
                    Ok(outcome) => debug!(job = %job.lock_name(), ?outcome, "scheduled job round finished"),
                    Err(err) => error!(job = %job.lock_name(), error = %format!("{err:#}"), "scheduled job failed"),
                }
            }
        })
    }
}

fn interpret(name: &LockName, result: Result<()>) -> Result<JobOutcome> {
    match result {
        Ok(()) => Ok(JobOutcome::Completed),
        Err(err) if err.downcast_ref::<JobInterrupted>().is_some() => {
            info!(job = %name, reason = %err, "job stopped early");
            Ok(JobOutcome::Aborted)
        }
        Err(err) => Err(err),
    }
}
