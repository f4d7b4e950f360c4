use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    initial_expiry, next_expiry, ttl_ms, LockId, LockResource, LockRow, LockStore, ResourceId,
};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::token::LockToken;

/// Lock store held in process memory.
///
/// Gives the same CAS guarantees as the PostgreSQL store, but only to callers
/// sharing this instance. Useful for tests and single-process deployments.
pub struct MemoryLockStore {
    clock: Arc<dyn Clock>,
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    next_resource_id: i64,
    next_lock_id: i64,
    resources: HashMap<(String, String), LockResource>,
    locks: HashMap<LockId, LockRow>,
    lock_keys: HashMap<(ResourceId, ResourceId), LockId>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    async fn get_resource(
        &self,
        namespace: &str,
        local_name: &str,
    ) -> Result<Option<LockResource>, StoreError> {
        let key = (namespace.to_string(), local_name.to_lowercase());
        Ok(self.inner().resources.get(&key).cloned())
    }

    async fn create_resource(
        &self,
        namespace: &str,
        local_name: &str,
    ) -> Result<LockResource, StoreError> {
        let mut inner = self.inner();
        let key = (namespace.to_string(), local_name.to_lowercase());
        if inner.resources.contains_key(&key) {
            return Err(StoreError::UniqueViolation(format!(
                "lock resource {namespace}:{local_name} already exists"
            )));
        }
        inner.next_resource_id += 1;
        let resource = LockResource {
            id: ResourceId::new(inner.next_resource_id),
            version: 0,
            namespace: key.0.clone(),
            local_name: key.1.clone(),
        };
        inner.resources.insert(key, resource.clone());
        Ok(resource)
    }

    async fn list_resources(&self, namespace: &str) -> Result<Vec<LockResource>, StoreError> {
        let mut resources: Vec<LockResource> = self
            .inner()
            .resources
            .values()
            .filter(|resource| resource.namespace == namespace)
            .cloned()
            .collect();
        resources.sort_by_key(|resource| resource.id);
        Ok(resources)
    }

    async fn get_lock(&self, id: LockId) -> Result<Option<LockRow>, StoreError> {
        Ok(self.inner().locks.get(&id).cloned())
    }

    async fn get_lock_by_key(
        &self,
        shared_resource_id: ResourceId,
        exclusive_resource_id: ResourceId,
    ) -> Result<Option<LockRow>, StoreError> {
        let inner = self.inner();
        Ok(inner
            .lock_keys
            .get(&(shared_resource_id, exclusive_resource_id))
            .and_then(|id| inner.locks.get(id))
            .cloned())
    }

    async fn get_locks_by_shared_resource_ids(
        &self,
        shared_resource_ids: &[ResourceId],
    ) -> Result<Vec<LockRow>, StoreError> {
        let inner = self.inner();
        let mut rows: Vec<LockRow> = inner
            .locks
            .values()
            .filter(|row| shared_resource_ids.contains(&row.shared_resource_id))
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.id);
        Ok(rows)
    }

    async fn create_lock(
        &self,
        shared_resource_id: ResourceId,
        exclusive_resource_id: ResourceId,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<LockRow, StoreError> {
        let now = self.now_ms();
        let mut inner = self.inner();
        let key = (shared_resource_id, exclusive_resource_id);
        if inner.lock_keys.contains_key(&key) {
            return Err(StoreError::UniqueViolation(format!(
                "lock ({shared_resource_id}, {exclusive_resource_id}) already exists"
            )));
        }
        inner.next_lock_id += 1;
        let row = LockRow {
            id: LockId::new(inner.next_lock_id),
            version: 0,
            shared_resource_id,
            exclusive_resource_id,
            lock_token: token.as_str().to_string(),
            start_time: now,
            expiry_time: initial_expiry(now, ttl_ms(ttl)),
        };
        inner.lock_keys.insert(key, row.id);
        inner.locks.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_lock(
        &self,
        current: &LockRow,
        new_token: &LockToken,
        ttl: Duration,
    ) -> Result<LockRow, StoreError> {
        let now = self.now_ms();
        let mut inner = self.inner();
        let stored = match inner.locks.get_mut(&current.id) {
            Some(stored) if stored.version == current.version => stored,
            _ => {
                return Err(StoreError::ConcurrencyFailure {
                    lock_id: current.id,
                    expected_version: current.version,
                })
            }
        };
        stored.version += 1;
        stored.lock_token = new_token.as_str().to_string();
        stored.expiry_time = next_expiry(now, ttl_ms(ttl), stored.expiry_time);
        stored.start_time = now;
        Ok(stored.clone())
    }

    async fn update_locks(
        &self,
        exclusive_resource_id: ResourceId,
        old_token: &LockToken,
        new_token: &LockToken,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        let now = self.now_ms();
        let ttl = ttl_ms(ttl);
        let mut inner = self.inner();
        let mut updated = 0;
        for row in inner.locks.values_mut().filter(|row| {
            row.exclusive_resource_id == exclusive_resource_id && old_token.matches(&row.lock_token)
        }) {
            row.version += 1;
            row.lock_token = new_token.as_str().to_string();
            row.expiry_time = next_expiry(now, ttl, row.expiry_time);
            row.start_time = now;
            updated += 1;
        }
        Ok(updated)
    }
}
