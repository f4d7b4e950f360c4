//! Lock manager: acquire, refresh and release leases by name.
//!
//! A name `a.b` is written as one row per element of its hierarchy
//! (`(a, a.b)` and `(a.b, a.b)`), all carrying the same token. A live lock on a
//! name blocks its ancestors, itself and its descendants, but not its siblings.
//! The store is re-read on every call; nothing about ownership is cached.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::directory::ResourceDirectory;
use crate::error::{LockError, StoreError};
use crate::name::LockName;
use crate::store::{LockRow, LockStore, ResourceId};
use crate::token::LockToken;

/// A live lock as reported by [`LockManager::list_held`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    pub local_name: String,
    pub start_time: i64,
    pub expiry_time: i64,
}

pub struct LockManager {
    store: Arc<dyn LockStore>,
    directory: ResourceDirectory,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            directory: ResourceDirectory::new(store.clone()),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    pub fn directory(&self) -> &ResourceDirectory {
        &self.directory
    }

    /// Take the lock for `ttl`, or fail with `Contention` if someone else holds it.
    pub async fn acquire(&self, name: &LockName, ttl: Duration) -> Result<LockToken, LockError> {
        let token = LockToken::new();
        self.acquire_with_token(name, &token, ttl).await?;
        Ok(token)
    }

    /// `acquire`, retried on contention up to `retry_count` more times.
    pub async fn acquire_with_retry(
        &self,
        name: &LockName,
        ttl: Duration,
        retry_wait: Duration,
        retry_count: u32,
    ) -> Result<LockToken, LockError> {
        let mut attempt = 0;
        loop {
            match self.acquire(name, ttl).await {
                Err(err) if err.is_contention() && attempt < retry_count => {
                    attempt += 1;
                    debug!(
                        lock = %name,
                        attempt,
                        retry_count,
                        "lock busy, retrying acquisition"
                    );
                    tokio::time::sleep(retry_wait).await;
                }
                other => return other,
            }
        }
    }

    /// Extend a held lease. Any sign that the token no longer owns every row of
    /// the lock is reported as `LockLost`.
    pub async fn refresh(
        &self,
        token: &LockToken,
        name: &LockName,
        ttl: Duration,
    ) -> Result<(), LockError> {
        let Some(ids) = self.directory.find_hierarchy(name).await? else {
            return Err(lost(name));
        };
        let exclusive = exclusive_id(&ids)?;
        for shared in &ids {
            let row = match self.store.get_lock_by_key(*shared, exclusive).await? {
                Some(row) if token.matches(&row.lock_token) && !row.is_released() => row,
                _ => return Err(lost(name)),
            };
            match self.store.update_lock(&row, token, ttl).await {
                Ok(updated) => debug!(
                    lock = %name,
                    lock_id = %updated.id,
                    version = updated.version,
                    expiry_time = updated.expiry_time,
                    "lock refreshed"
                ),
                Err(StoreError::ConcurrencyFailure { .. }) => return Err(lost(name)),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Release the lock if `token` still holds it. Returns whether anything was
    /// released; releasing a lock that is already gone is not an error.
    ///
    /// Released rows are retokened to a fresh token nobody holds, so repeating
    /// the release writes nothing.
    pub async fn release(&self, token: &LockToken, name: &LockName) -> Result<bool, LockError> {
        let Some(exclusive) = self.exclusive_resource(name).await? else {
            debug!(lock = %name, "release of a lock that was never taken");
            return Ok(false);
        };
        let released = self
            .store
            .update_locks(exclusive, token, &LockToken::new(), Duration::ZERO)
            .await?;
        if released == 0 {
            debug!(lock = %name, "release found nothing held by this token");
        } else {
            debug!(lock = %name, rows = released, "lock released");
        }
        Ok(released > 0)
    }

    /// Like [`release`](Self::release) but fails with `NotHeld` when the token
    /// held nothing.
    pub async fn release_verified(
        &self,
        token: &LockToken,
        name: &LockName,
    ) -> Result<(), LockError> {
        if self.release(token, name).await? {
            Ok(())
        } else {
            Err(LockError::NotHeld {
                name: name.to_string(),
            })
        }
    }

    /// Whether a live lock exists on exactly this name.
    pub async fn is_held(&self, name: &LockName) -> Result<bool, LockError> {
        let Some(exclusive) = self.exclusive_resource(name).await? else {
            return Ok(false);
        };
        let now = self.store.now_ms();
        Ok(self
            .store
            .get_lock_by_key(exclusive, exclusive)
            .await?
            .is_some_and(|row| row.is_live(now)))
    }

    /// Live locks under a namespace, by exclusive name, sorted.
    pub async fn list_held(&self, namespace: &str) -> Result<Vec<HeldLock>, LockError> {
        // Every lock owns a row whose shared and exclusive ids are equal, so the
        // namespace's resources as shared ids cover all of its locks.
        let resources = self.namespace_resources(namespace).await?;
        if resources.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<ResourceId> = resources.iter().map(|(id, _)| *id).collect();
        let now = self.store.now_ms();
        let mut held: Vec<HeldLock> = self
            .store
            .get_locks_by_shared_resource_ids(&ids)
            .await?
            .into_iter()
            .filter(|row| row.shared_resource_id == row.exclusive_resource_id && row.is_live(now))
            .filter_map(|row| {
                resources
                    .iter()
                    .find(|(id, _)| *id == row.exclusive_resource_id)
                    .map(|(_, local_name)| HeldLock {
                        local_name: local_name.clone(),
                        start_time: row.start_time,
                        expiry_time: row.expiry_time,
                    })
            })
            .collect();
        held.sort_by(|a, b| a.local_name.cmp(&b.local_name));
        Ok(held)
    }

    pub(crate) async fn acquire_with_token(
        &self,
        name: &LockName,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<(), LockError> {
        let ids = self.directory.resolve_hierarchy(name).await?;
        let exclusive = exclusive_id(&ids)?;
        let now = self.store.now_ms();

        let existing = self.store.get_locks_by_shared_resource_ids(&ids).await?;
        if let Some(conflict) = existing
            .iter()
            .find(|row| conflicts(row, &ids, exclusive, token, now))
        {
            debug!(
                lock = %name,
                lock_id = %conflict.id,
                expiry_time = conflict.expiry_time,
                "lock held by another owner"
            );
            return Err(contention(name));
        }

        let mut written = false;
        for shared in &ids {
            let result = self.write_row(name, *shared, exclusive, token, ttl, now).await;
            match result {
                Ok(row) => {
                    written = true;
                    debug!(
                        lock = %name,
                        lock_id = %row.id,
                        version = row.version,
                        expiry_time = row.expiry_time,
                        "lock row written"
                    );
                }
                Err(err) => {
                    if written {
                        self.undo_partial_acquire(name, exclusive, token).await;
                    }
                    return Err(err);
                }
            }
        }

        // Rows of an ancestor and a descendant have different keys, so two
        // overlapping acquisitions can both pass the check above. Whoever writes
        // last sees the other here and backs off.
        let current = self.store.get_locks_by_shared_resource_ids(&ids).await?;
        if let Some(conflict) = current
            .iter()
            .find(|row| conflicts(row, &ids, exclusive, token, now))
        {
            debug!(
                lock = %name,
                lock_id = %conflict.id,
                "overlapping lock taken concurrently, backing off"
            );
            self.undo_partial_acquire(name, exclusive, token).await;
            return Err(contention(name));
        }

        info!(lock = %name, ttl_ms = ttl.as_millis() as u64, "lock acquired");
        Ok(())
    }

    /// Create or supersede the row for one element of the hierarchy.
    async fn write_row(
        &self,
        name: &LockName,
        shared: ResourceId,
        exclusive: ResourceId,
        token: &LockToken,
        ttl: Duration,
        now: i64,
    ) -> Result<LockRow, LockError> {
        let written = match self.store.get_lock_by_key(shared, exclusive).await? {
            None => self.store.create_lock(shared, exclusive, token, ttl).await,
            Some(row) if row.is_live(now) && !token.matches(&row.lock_token) => {
                return Err(contention(name))
            }
            Some(row) => self.store.update_lock(&row, token, ttl).await,
        };
        match written {
            Ok(row) => Ok(row),
            // Another node got there between our read and our write.
            Err(StoreError::UniqueViolation(_)) | Err(StoreError::ConcurrencyFailure { .. }) => {
                Err(contention(name))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn undo_partial_acquire(&self, name: &LockName, exclusive: ResourceId, token: &LockToken) {
        match self
            .store
            .update_locks(exclusive, token, &LockToken::new(), Duration::ZERO)
            .await
        {
            Ok(rows) => debug!(lock = %name, rows, "rolled back partial acquisition"),
            Err(err) => warn!(
                lock = %name,
                error = %err,
                "failed to roll back partial acquisition; rows will expire with their TTL"
            ),
        }
    }

    async fn exclusive_resource(&self, name: &LockName) -> Result<Option<ResourceId>, StoreError> {
        self.directory
            .find(name.namespace(), name.local_name())
            .await
    }

    async fn namespace_resources(
        &self,
        namespace: &str,
    ) -> Result<Vec<(ResourceId, String)>, LockError> {
        self.store
            .list_resources(namespace)
            .await
            .map(|resources| {
                resources
                    .into_iter()
                    .map(|resource| (resource.id, resource.local_name))
                    .collect()
            })
            .map_err(LockError::from)
    }
}

fn exclusive_id(ids: &[ResourceId]) -> Result<ResourceId, LockError> {
    ids.last()
        .copied()
        .ok_or_else(|| LockError::InvalidName("lock name resolved to no resources".to_string()))
}

/// Whether an existing row blocks acquiring the lock whose hierarchy is `ids`.
fn conflicts(
    row: &LockRow,
    ids: &[ResourceId],
    exclusive: ResourceId,
    token: &LockToken,
    now: i64,
) -> bool {
    if !row.is_live(now) || token.matches(&row.lock_token) {
        return false;
    }
    // An ancestor (or this name) is held, or a descendant (or this name) is held.
    ids.contains(&row.exclusive_resource_id) || row.shared_resource_id == exclusive
}

fn contention(name: &LockName) -> LockError {
    LockError::Contention {
        name: name.to_string(),
    }
}

fn lost(name: &LockName) -> LockError {
    LockError::LockLost {
        name: name.to_string(),
    }
}
