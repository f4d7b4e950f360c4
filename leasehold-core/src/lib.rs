//! Cluster-wide lease locks.
//!
//! Mutual exclusion is derived entirely from compare-and-swap updates against a
//! shared lock table: no quorum, no leader. A holder keeps its lease alive with a
//! background renewal task and is told when ownership is lost.

pub mod clock;
pub mod config;
pub mod directory;
pub mod error;
pub mod job;
pub mod manager;
pub mod name;
pub mod renewal;
pub mod store;
pub mod token;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::LockConfig;
pub use error::{LockError, StoreError};
pub use job::{ClusterJob, ExclusiveJobRunner, JobContext, JobInterrupted, JobMode, JobOutcome};
pub use manager::{HeldLock, LockManager};
pub use name::LockName;
pub use renewal::{
    FnCallback, LeaseStatus, LockCallback, RenewalHandle, RenewalScheduler, ShutdownSignal,
    MIN_RENEWABLE_TTL,
};
pub use store::{LockStore, MemoryLockStore, PostgresLockStore};
pub use token::LockToken;
