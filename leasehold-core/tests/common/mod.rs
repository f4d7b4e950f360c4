#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Barrier;
use leasehold_core::store::{LockId, LockResource, LockRow, ResourceId};
use leasehold_core::{
    Clock, LockManager, LockName, LockStore, LockToken, ManualClock, MemoryLockStore, StoreError,
};

pub const NAMESPACE: &str = "jobs";

pub fn name(local_name: &str) -> LockName {
    LockName::new(NAMESPACE, local_name).expect("valid lock name")
}

/// Manager over a fresh in-memory store driven by a manual clock.
pub fn manual_manager(start_ms: i64) -> (ManualClock, Arc<MemoryLockStore>, Arc<LockManager>) {
    let clock = ManualClock::new(start_ms);
    let store = Arc::new(MemoryLockStore::with_clock(Arc::new(clock.clone())));
    let manager = Arc::new(LockManager::new(store.clone()));
    (clock, store, manager)
}

/// Clock that follows tokio's (possibly paused) timer, so lease expiry and
/// renewal ticks advance together under `start_paused`.
pub struct TokioClock {
    origin: tokio::time::Instant,
    base_ms: i64,
}

impl TokioClock {
    pub fn new(base_ms: i64) -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            base_ms,
        }
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        self.base_ms + self.origin.elapsed().as_millis() as i64
    }
}

pub fn tokio_manager() -> (Arc<MemoryLockStore>, Arc<LockManager>) {
    let store = Arc::new(MemoryLockStore::with_clock(Arc::new(TokioClock::new(
        1_700_000_000_000,
    ))));
    let manager = Arc::new(LockManager::new(store.clone()));
    (store, manager)
}

/// Take over every row of a held lock with another token, the way a node that
/// wrongly believed the lease expired would.
pub async fn steal(
    store: &dyn LockStore,
    manager: &LockManager,
    name: &LockName,
    ttl: Duration,
) -> anyhow::Result<LockToken> {
    let thief = LockToken::new();
    let ids = manager.directory().resolve_hierarchy(name).await?;
    let exclusive = *ids.last().expect("non-empty hierarchy");
    for shared in ids {
        let row = store
            .get_lock_by_key(shared, exclusive)
            .await?
            .expect("lock row exists");
        store.update_lock(&row, &thief, ttl).await?;
    }
    Ok(thief)
}

/// Memory store with switchable faults.
pub struct FlakyStore {
    inner: MemoryLockStore,
    /// Lock creations allowed before the next one fails as if a peer won the race.
    creates_before_conflict: AtomicUsize,
    /// When set, every lock update fails with an internal error.
    fail_updates: AtomicBool,
    /// Holds the next batch reads at a barrier after they have read, so
    /// concurrent acquisitions all decide on the same snapshot.
    read_gate: Mutex<Option<(Arc<Barrier>, usize)>>,
}

impl FlakyStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: MemoryLockStore::with_clock(clock),
            creates_before_conflict: AtomicUsize::new(usize::MAX),
            fail_updates: AtomicBool::new(false),
            read_gate: Mutex::new(None),
        }
    }

    /// Make the next `readers` batch reads wait for each other.
    pub fn gate_reads(&self, readers: usize) {
        let barrier = Arc::new(Barrier::new(readers));
        *self.read_gate.lock().expect("read gate") = Some((barrier, readers));
    }

    fn take_gate(&self) -> Option<Arc<Barrier>> {
        let mut gate = self.read_gate.lock().expect("read gate");
        let (barrier, left) = gate.as_mut()?;
        let barrier = barrier.clone();
        *left -= 1;
        if *left == 0 {
            *gate = None;
        }
        Some(barrier)
    }

    pub fn conflict_after_creates(&self, creates: usize) {
        self.creates_before_conflict.store(creates, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    fn check_updates(&self) -> Result<(), StoreError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Internal("injected update failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LockStore for FlakyStore {
    fn now_ms(&self) -> i64 {
        self.inner.now_ms()
    }

    async fn get_resource(
        &self,
        namespace: &str,
        local_name: &str,
    ) -> Result<Option<LockResource>, StoreError> {
        self.inner.get_resource(namespace, local_name).await
    }

    async fn create_resource(
        &self,
        namespace: &str,
        local_name: &str,
    ) -> Result<LockResource, StoreError> {
        self.inner.create_resource(namespace, local_name).await
    }

    async fn list_resources(&self, namespace: &str) -> Result<Vec<LockResource>, StoreError> {
        self.inner.list_resources(namespace).await
    }

    async fn get_lock(&self, id: LockId) -> Result<Option<LockRow>, StoreError> {
        self.inner.get_lock(id).await
    }

    async fn get_lock_by_key(
        &self,
        shared_resource_id: ResourceId,
        exclusive_resource_id: ResourceId,
    ) -> Result<Option<LockRow>, StoreError> {
        self.inner
            .get_lock_by_key(shared_resource_id, exclusive_resource_id)
            .await
    }

    async fn get_locks_by_shared_resource_ids(
        &self,
        shared_resource_ids: &[ResourceId],
    ) -> Result<Vec<LockRow>, StoreError> {
        let rows = self
            .inner
            .get_locks_by_shared_resource_ids(shared_resource_ids)
            .await?;
        if let Some(barrier) = self.take_gate() {
            barrier.wait().await;
        }
        Ok(rows)
    }

    async fn create_lock(
        &self,
        shared_resource_id: ResourceId,
        exclusive_resource_id: ResourceId,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<LockRow, StoreError> {
        let allowed = self
            .creates_before_conflict
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                if left == usize::MAX {
                    Some(left)
                } else {
                    left.checked_sub(1)
                }
            });
        if allowed.is_err() {
            return Err(StoreError::UniqueViolation(
                "injected creation conflict".to_string(),
            ));
        }
        self.inner
            .create_lock(shared_resource_id, exclusive_resource_id, token, ttl)
            .await
    }

    async fn update_lock(
        &self,
        current: &LockRow,
        new_token: &LockToken,
        ttl: Duration,
    ) -> Result<LockRow, StoreError> {
        self.check_updates()?;
        self.inner.update_lock(current, new_token, ttl).await
    }

    async fn update_locks(
        &self,
        exclusive_resource_id: ResourceId,
        old_token: &LockToken,
        new_token: &LockToken,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        self.check_updates()?;
        self.inner
            .update_locks(exclusive_resource_id, old_token, new_token, ttl)
            .await
    }
}
