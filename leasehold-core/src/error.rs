use thiserror::Error;

use crate::store::LockId;

/// Failures raised by a [`crate::store::LockStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// An insert collided with an existing row for the same key.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    /// A CAS update matched no row: the version moved on or the row is gone.
    #[error("lock {lock_id} was modified concurrently (expected version {expected_version})")]
    ConcurrencyFailure { lock_id: LockId, expected_version: i64 },
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("lock store connection failed: {0:#}")]
    Connection(anyhow::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Caller-visible lock errors.
///
/// `Contention` and `LockLost` are expected outcomes of running in a cluster and
/// are not failures of the system; `Store` is.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("invalid lock name: {0}")]
    InvalidName(String),
    /// The lease is too short to renew with room for a missed renewal.
    #[error("lease of {ttl_ms}ms is too short to renew, need at least {min_ms}ms")]
    InvalidTtl { ttl_ms: u64, min_ms: u64 },
    /// Someone else holds a live lock covering this name right now.
    #[error("lock '{name}' is held by another owner")]
    Contention { name: String },
    /// The presented token no longer owns the lock.
    #[error("lock '{name}' is no longer held by this token")]
    LockLost { name: String },
    #[error("lock '{name}' was not held by this token")]
    NotHeld { name: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LockError {
    pub fn is_contention(&self) -> bool {
        matches!(self, LockError::Contention { .. })
    }

    pub fn is_lock_lost(&self) -> bool {
        matches!(self, LockError::LockLost { .. })
    }
}
