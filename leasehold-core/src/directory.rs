//! Resource directory: name → id, get-or-create, cached for the process lifetime.
//!
//! Resource rows are never deleted or renamed, so a cached id stays valid forever
//! and the cache can be shared freely between tasks.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::{LockError, StoreError};
use crate::name::LockName;
use crate::store::{LockStore, ResourceId};

pub struct ResourceDirectory {
    store: Arc<dyn LockStore>,
    cache: RwLock<HashMap<(String, String), ResourceId>>,
}

impl ResourceDirectory {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a resource id, creating the row on first use.
    pub async fn resolve(&self, namespace: &str, local_name: &str) -> Result<ResourceId, StoreError> {
        let key = (namespace.to_string(), local_name.to_lowercase());
        if let Some(id) = self.cached(&key) {
            return Ok(id);
        }

        let id = match self.store.get_resource(&key.0, &key.1).await? {
            Some(resource) => resource.id,
            None => match self.store.create_resource(&key.0, &key.1).await {
                Ok(resource) => {
                    debug!(
                        namespace = %key.0,
                        local_name = %key.1,
                        resource_id = %resource.id,
                        "created lock resource"
                    );
                    resource.id
                }
                // Lost a first-use race: the winner's row is the answer.
                Err(StoreError::UniqueViolation(_)) => self
                    .store
                    .get_resource(&key.0, &key.1)
                    .await?
                    .map(|resource| resource.id)
                    .ok_or_else(|| {
                        StoreError::Internal(format!(
                            "lock resource {}:{} vanished after a unique violation",
                            key.0, key.1
                        ))
                    })?,
                Err(err) => return Err(err),
            },
        };

        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, id);
        Ok(id)
    }

    /// Resolve every element of the name's hierarchy, root first.
    pub async fn resolve_hierarchy(&self, name: &LockName) -> Result<Vec<ResourceId>, LockError> {
        let mut ids = Vec::new();
        for local_name in name.hierarchy() {
            ids.push(self.resolve(name.namespace(), &local_name).await?);
        }
        Ok(ids)
    }

    /// Look a resource up without creating it.
    pub async fn find(&self, namespace: &str, local_name: &str) -> Result<Option<ResourceId>, StoreError> {
        let key = (namespace.to_string(), local_name.to_lowercase());
        if let Some(id) = self.cached(&key) {
            return Ok(Some(id));
        }
        let Some(resource) = self.store.get_resource(&key.0, &key.1).await? else {
            return Ok(None);
        };
        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, resource.id);
        Ok(Some(resource.id))
    }

    /// Like [`resolve_hierarchy`](Self::resolve_hierarchy), but `None` if any
    /// element has never been used.
    pub async fn find_hierarchy(&self, name: &LockName) -> Result<Option<Vec<ResourceId>>, StoreError> {
        let mut ids = Vec::new();
        for local_name in name.hierarchy() {
            match self.find(name.namespace(), &local_name).await? {
                Some(id) => ids.push(id),
                None => return Ok(None),
            }
        }
        Ok(Some(ids))
    }

    fn cached(&self, key: &(String, String)) -> Option<ResourceId> {
        self.cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLockStore;

    #[tokio::test]
    async fn resolve_is_idempotent_and_case_insensitive() {
        let store = Arc::new(MemoryLockStore::new());
        let directory = ResourceDirectory::new(store.clone());

        let first = directory.resolve("jobs", "PostCleanup").await.unwrap();
        let second = directory.resolve("jobs", "postcleanup").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            directory.cached(&("jobs".to_string(), "postcleanup".to_string())),
            Some(first)
        );

        let other = directory.resolve("reports", "postcleanup").await.unwrap();
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn separate_directories_agree_on_ids() {
        let store = Arc::new(MemoryLockStore::new());
        let a = ResourceDirectory::new(store.clone());
        let b = ResourceDirectory::new(store.clone());
        assert_eq!(
            a.resolve("jobs", "x").await.unwrap(),
            b.resolve("jobs", "X").await.unwrap()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_use_yields_one_id() {
        let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let directory = ResourceDirectory::new(store.clone());
            tasks.push(tokio::spawn(async move {
                directory.resolve("jobs", "contended").await.unwrap()
            }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn find_never_creates() {
        let store = Arc::new(MemoryLockStore::new());
        let directory = ResourceDirectory::new(store.clone());
        assert_eq!(directory.find("jobs", "ghost").await.unwrap(), None);
        assert_eq!(store.get_resource("jobs", "ghost").await.unwrap(), None);

        let name = LockName::new("jobs", "a.b").unwrap();
        directory.resolve("jobs", "a").await.unwrap();
        assert_eq!(directory.find_hierarchy(&name).await.unwrap(), None);

        let id = directory.resolve("jobs", "A.B").await.unwrap();
        let found = directory.find_hierarchy(&name).await.unwrap().unwrap();
        assert_eq!(found.last(), Some(&id));
    }

    #[tokio::test]
    async fn resolve_hierarchy_returns_root_first() {
        let store = Arc::new(MemoryLockStore::new());
        let directory = ResourceDirectory::new(store);
        let name = LockName::new("jobs", "a.b").unwrap();
        let ids = directory.resolve_hierarchy(&name).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], directory.resolve("jobs", "a").await.unwrap());
        assert_eq!(ids[1], directory.resolve("jobs", "a.b").await.unwrap());
    }
}
