//! Background lease renewal.
//!
//! Each held lock gets its own tokio task that refreshes the lease every
//! `ttl / divisor`. Refreshes are awaited inline, so at most one is in flight
//! per lock. The owner hears about loss through [`LockCallback::lock_lost`] and
//! through the shared state on [`RenewalHandle`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::LockConfig;
use crate::error::LockError;
use crate::manager::LockManager;
use crate::name::LockName;
use crate::token::LockToken;

const MIN_RENEWAL_INTERVAL: Duration = Duration::from_millis(10);

/// Shortest lease that still leaves room for one missed renewal at the
/// minimum interval.
pub const MIN_RENEWABLE_TTL: Duration = Duration::from_millis(20);

/// Owner-side hooks polled and fired by the renewal task.
pub trait LockCallback: Send + Sync {
    /// Keep renewing while this returns true.
    fn is_active(&self) -> bool;

    /// Called once, from the renewal task, when the lock is lost.
    fn lock_lost(&self);
}

/// [`LockCallback`] built from two closures.
pub struct FnCallback<A, L> {
    is_active: A,
    on_lost: L,
}

impl<A, L> FnCallback<A, L>
where
    A: Fn() -> bool + Send + Sync,
    L: Fn() + Send + Sync,
{
    pub fn new(is_active: A, on_lost: L) -> Self {
        Self { is_active, on_lost }
    }
}

impl<A, L> LockCallback for FnCallback<A, L>
where
    A: Fn() -> bool + Send + Sync,
    L: Fn() + Send + Sync,
{
    fn is_active(&self) -> bool {
        (self.is_active)()
    }

    fn lock_lost(&self) {
        (self.on_lost)()
    }
}

/// Process-wide shutdown flag. Renewal loops stop quietly when it fires.
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

struct LeaseState {
    active: AtomicBool,
    lost: AtomicBool,
    stop: Notify,
    lost_notify: Notify,
}

impl LeaseState {
    /// Flip to lost. Returns false if it already was.
    fn mark_lost(&self) -> bool {
        self.active.store(false, Ordering::SeqCst);
        let first = !self.lost.swap(true, Ordering::SeqCst);
        if first {
            self.lost_notify.notify_waiters();
        }
        first
    }
}

/// Read-only view of a lease, cheap to clone into the protected work.
#[derive(Clone)]
pub struct LeaseStatus {
    state: Arc<LeaseState>,
}

impl LeaseStatus {
    /// True until the owner stops the renewal or the lock is lost.
    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::SeqCst)
    }

    pub fn is_lost(&self) -> bool {
        self.state.lost.load(Ordering::SeqCst)
    }

    /// Resolves when the lock is lost. Never resolves for a lock that is kept.
    pub async fn lost(&self) {
        loop {
            let notified = self.state.lost_notify.notified();
            if self.is_lost() {
                return;
            }
            notified.await;
        }
    }
}

/// Owner's handle on a running renewal.
///
/// Dropping the handle does not stop the task; the callback's `is_active` or an
/// explicit [`stop`](Self::stop) / [`release`](Self::release) does.
pub struct RenewalHandle {
    name: LockName,
    token: LockToken,
    status: LeaseStatus,
    manager: Arc<LockManager>,
    task: JoinHandle<()>,
}

impl RenewalHandle {
    pub fn name(&self) -> &LockName {
        &self.name
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    pub fn status(&self) -> LeaseStatus {
        self.status.clone()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_lost(&self) -> bool {
        self.status.is_lost()
    }

    pub async fn lost(&self) {
        self.status.lost().await
    }

    /// Stop renewing without releasing; the lease lapses at its expiry.
    pub fn stop(&self) {
        self.status.state.active.store(false, Ordering::SeqCst);
        self.status.state.stop.notify_one();
    }

    /// Stop renewing, wait for the task to finish, then release the lock.
    /// Returns whether the lock was still held at release time.
    pub async fn release(self) -> Result<bool, LockError> {
        self.stop();
        if let Err(err) = self.task.await {
            warn!(lock = %self.name, error = %err, "renewal task ended abnormally");
        }
        self.manager.release(&self.token, &self.name).await
    }
}

pub struct RenewalScheduler {
    manager: Arc<LockManager>,
    shutdown: ShutdownSignal,
    divisor: u32,
}

impl RenewalScheduler {
    pub fn new(manager: Arc<LockManager>, shutdown: ShutdownSignal, config: &LockConfig) -> Self {
        Self {
            manager,
            shutdown,
            divisor: config.renewal_divisor.max(2),
        }
    }

    pub fn manager(&self) -> &Arc<LockManager> {
        &self.manager
    }

    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub fn renewal_interval(&self, ttl: Duration) -> Duration {
        (ttl / self.divisor).max(MIN_RENEWAL_INTERVAL)
    }

    /// `InvalidTtl` for leases shorter than [`MIN_RENEWABLE_TTL`].
    pub fn check_ttl(&self, ttl: Duration) -> Result<(), LockError> {
        if ttl < MIN_RENEWABLE_TTL {
            return Err(LockError::InvalidTtl {
                ttl_ms: ttl.as_millis() as u64,
                min_ms: MIN_RENEWABLE_TTL.as_millis() as u64,
            });
        }
        Ok(())
    }

    /// Acquire `name` and immediately start renewing it.
    pub async fn acquire_with_renewal(
        &self,
        name: &LockName,
        ttl: Duration,
        callback: Arc<dyn LockCallback>,
    ) -> Result<RenewalHandle, LockError> {
        self.check_ttl(ttl)?;
        let token = self.manager.acquire(name, ttl).await?;
        self.start_renewal(token, name.clone(), ttl, callback)
    }

    /// Keep an already acquired lock alive until the callback goes inactive, the
    /// handle is stopped, the lock is lost, or the process shuts down.
    ///
    /// Fails with `InvalidTtl` without touching the lock when `ttl` is too short.
    pub fn start_renewal(
        &self,
        token: LockToken,
        name: LockName,
        ttl: Duration,
        callback: Arc<dyn LockCallback>,
    ) -> Result<RenewalHandle, LockError> {
        self.check_ttl(ttl)?;
        let state = Arc::new(LeaseState {
            active: AtomicBool::new(true),
            lost: AtomicBool::new(false),
            stop: Notify::new(),
            lost_notify: Notify::new(),
        });
        let interval = self.renewal_interval(ttl);
        let task = tokio::spawn(run_renewal(
            self.manager.clone(),
            self.shutdown.clone(),
            state.clone(),
            callback,
            token.clone(),
            name.clone(),
            ttl,
            interval,
        ));
        debug!(
            lock = %name,
            interval_ms = interval.as_millis() as u64,
            "lease renewal started"
        );
        Ok(RenewalHandle {
            name,
            token,
            status: LeaseStatus { state },
            manager: self.manager.clone(),
            task,
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_renewal(
    manager: Arc<LockManager>,
    shutdown: ShutdownSignal,
    state: Arc<LeaseState>,
    callback: Arc<dyn LockCallback>,
    token: LockToken,
    name: LockName,
    ttl: Duration,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = state.stop.notified() => {
                debug!(lock = %name, "lease renewal stopped by owner");
                return;
            }
            _ = shutdown.wait() => {
                info!(lock = %name, "lease renewal stopped for shutdown");
                state.active.store(false, Ordering::SeqCst);
                return;
            }
        }

        if !state.active.load(Ordering::SeqCst) || !callback.is_active() {
            debug!(lock = %name, "owner no longer active, ending lease renewal");
            state.active.store(false, Ordering::SeqCst);
            return;
        }

        match manager.refresh(&token, &name, ttl).await {
            Ok(()) => {}
            Err(err) if err.is_lock_lost() => {
                info!(lock = %name, "lock lost, notifying owner");
                if state.mark_lost() {
                    callback.lock_lost();
                }
                return;
            }
            Err(err) => {
                if shutdown.is_triggered() {
                    info!(lock = %name, error = %err, "lease renewal interrupted by shutdown");
                    state.active.store(false, Ordering::SeqCst);
                } else {
                    error!(lock = %name, error = %err, "lease renewal failed");
                    if state.mark_lost() {
                        callback.lock_lost();
                    }
                }
                return;
            }
        }
    }
}
