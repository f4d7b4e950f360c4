//! Lock table persistence.
//!
//! Every mutation of a lock row is a compare-and-swap: either keyed on the row
//! version (`update_lock`) or on the current token (`update_locks`). There is no
//! read-decide-blind-write path.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::token::LockToken;

mod memory;
pub mod postgres;

pub use memory::MemoryLockStore;
pub use postgres::PostgresLockStore;

macro_rules! define_id_type {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(i64);

        impl $name {
            pub fn new(id: i64) -> Self {
                Self(id)
            }

            pub fn id(&self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id_type!(ResourceId, "Surrogate id of a lock resource row");
define_id_type!(LockId, "Surrogate id of a lock row");

/// A named resource that locks refer to. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockResource {
    pub id: ResourceId,
    pub version: i64,
    pub namespace: String,
    /// Always lowercase.
    pub local_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRow {
    pub id: LockId,
    pub version: i64,
    pub shared_resource_id: ResourceId,
    pub exclusive_resource_id: ResourceId,
    pub lock_token: String,
    pub start_time: i64,
    /// Epoch millis; `0` marks a released row.
    pub expiry_time: i64,
}

impl LockRow {
    pub fn is_live(&self, now_ms: i64) -> bool {
        self.expiry_time != 0 && now_ms < self.expiry_time
    }

    pub fn is_released(&self) -> bool {
        self.expiry_time == 0
    }
}

pub(crate) fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// Expiry for a freshly created row.
pub(crate) fn initial_expiry(now_ms: i64, ttl_ms: i64) -> i64 {
    if ttl_ms <= 0 {
        0
    } else {
        now_ms.saturating_add(ttl_ms)
    }
}

/// Expiry written by an update. A positive TTL always moves the expiry forward,
/// even when `now + ttl` would land at or before the stored one.
pub(crate) fn next_expiry(now_ms: i64, ttl_ms: i64, current_expiry: i64) -> i64 {
    if ttl_ms <= 0 {
        0
    } else {
        now_ms
            .saturating_add(ttl_ms)
            .max(current_expiry.saturating_add(1))
    }
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Current time as the store records it.
    fn now_ms(&self) -> i64;

    async fn get_resource(
        &self,
        namespace: &str,
        local_name: &str,
    ) -> Result<Option<LockResource>, StoreError>;

    /// Insert a resource row. Fails with `UniqueViolation` if the name exists.
    async fn create_resource(
        &self,
        namespace: &str,
        local_name: &str,
    ) -> Result<LockResource, StoreError>;

    /// All resources of a namespace, in id order.
    async fn list_resources(&self, namespace: &str) -> Result<Vec<LockResource>, StoreError>;

    async fn get_lock(&self, id: LockId) -> Result<Option<LockRow>, StoreError>;

    async fn get_lock_by_key(
        &self,
        shared_resource_id: ResourceId,
        exclusive_resource_id: ResourceId,
    ) -> Result<Option<LockRow>, StoreError>;

    async fn get_locks_by_shared_resource_ids(
        &self,
        shared_resource_ids: &[ResourceId],
    ) -> Result<Vec<LockRow>, StoreError>;

    /// Insert a lock row at version 0. Fails with `UniqueViolation` if any row
    /// exists for the key.
    async fn create_lock(
        &self,
        shared_resource_id: ResourceId,
        exclusive_resource_id: ResourceId,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<LockRow, StoreError>;

    /// CAS on `current.version`. Exactly one row must change, otherwise
    /// `ConcurrencyFailure`.
    async fn update_lock(
        &self,
        current: &LockRow,
        new_token: &LockToken,
        ttl: Duration,
    ) -> Result<LockRow, StoreError>;

    /// Retoken/renew every row under `exclusive_resource_id` whose token matches
    /// `old_token`. Returns how many rows changed; zero is not an error.
    async fn update_locks(
        &self,
        exclusive_resource_id: ResourceId,
        old_token: &LockToken,
        new_token: &LockToken,
        ttl: Duration,
    ) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_boundaries() {
        let row = LockRow {
            id: LockId::new(1),
            version: 0,
            shared_resource_id: ResourceId::new(1),
            exclusive_resource_id: ResourceId::new(1),
            lock_token: "t".to_string(),
            start_time: 0,
            expiry_time: 1_000,
        };
        assert!(row.is_live(999));
        assert!(!row.is_live(1_000));
        assert!(!row.is_live(1_001));

        let released = LockRow {
            expiry_time: 0,
            ..row
        };
        assert!(!released.is_live(0));
        assert!(released.is_released());
    }

    #[test]
    fn expiry_arithmetic() {
        assert_eq!(initial_expiry(100, 50), 150);
        assert_eq!(initial_expiry(100, 0), 0);
        assert_eq!(next_expiry(100, 50, 120), 150);
        // never shrinks
        assert_eq!(next_expiry(100, 10, 500), 501);
        assert_eq!(next_expiry(100, 0, 500), 0);
        assert_eq!(ttl_ms(Duration::from_secs(2)), 2_000);
    }
}
