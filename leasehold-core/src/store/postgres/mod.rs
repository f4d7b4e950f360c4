//! PostgreSQL-backed lock store.
//!
//! Two tables: `leasehold_lock_resource` (name directory) and `leasehold_lock`
//! (one row per shared/exclusive resource pair). Every lock write is a single
//! conditional `UPDATE`, so the database does the compare-and-swap.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Row};
use tracing::debug;

use super::{
    initial_expiry, next_expiry, ttl_ms, LockId, LockResource, LockRow, LockStore, ResourceId,
};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::token::LockToken;

mod connection;

use connection::{connect_client, PgConfig};

const SCHEMA_SQL: &str = "\
CREATE TABLE IF NOT EXISTS leasehold_lock_resource (\
    id BIGSERIAL PRIMARY KEY,\
    version BIGINT NOT NULL DEFAULT 0,\
    namespace TEXT NOT NULL,\
    local_name TEXT NOT NULL,\
    CONSTRAINT leasehold_lock_resource_name_key UNIQUE (namespace, local_name)\
);\
CREATE TABLE IF NOT EXISTS leasehold_lock (\
    id BIGSERIAL PRIMARY KEY,\
    version BIGINT NOT NULL,\
    shared_resource_id BIGINT NOT NULL REFERENCES leasehold_lock_resource (id),\
    excl_resource_id BIGINT NOT NULL REFERENCES leasehold_lock_resource (id),\
    lock_token TEXT NOT NULL,\
    start_time BIGINT NOT NULL,\
    expiry_time BIGINT NOT NULL,\
    CONSTRAINT leasehold_lock_key UNIQUE (shared_resource_id, excl_resource_id)\
);\
CREATE INDEX IF NOT EXISTS leasehold_lock_excl_idx ON leasehold_lock (excl_resource_id);";

const LOCK_COLUMNS: &str =
    "id, version, shared_resource_id, excl_resource_id, lock_token, start_time, expiry_time";

pub struct PostgresLockStore {
    client: Client,
    clock: Arc<dyn Clock>,
}

impl PostgresLockStore {
    /// Connect using `LEASEHOLD_POSTGRES_CONNECTION` or the `PG*` variables.
    pub async fn connect() -> Result<Self, StoreError> {
        let config = PgConfig::from_env().map_err(StoreError::Connection)?;
        let client = connect_client(&config)
            .await
            .map_err(StoreError::Connection)?;
        Ok(Self::from_client(client, Arc::new(SystemClock::new())))
    }

    pub fn from_client(client: Client, clock: Arc<dyn Clock>) -> Self {
        Self { client, clock }
    }

    /// Create the lock tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.client.batch_execute(SCHEMA_SQL).await?;
        debug!("lock store schema ensured");
        Ok(())
    }
}

fn resource_from_row(row: &Row) -> Result<LockResource, StoreError> {
    Ok(LockResource {
        id: ResourceId::new(row.try_get("id")?),
        version: row.try_get("version")?,
        namespace: row.try_get("namespace")?,
        local_name: row.try_get("local_name")?,
    })
}

fn lock_from_row(row: &Row) -> Result<LockRow, StoreError> {
    Ok(LockRow {
        id: LockId::new(row.try_get("id")?),
        version: row.try_get("version")?,
        shared_resource_id: ResourceId::new(row.try_get("shared_resource_id")?),
        exclusive_resource_id: ResourceId::new(row.try_get("excl_resource_id")?),
        lock_token: row.try_get("lock_token")?,
        start_time: row.try_get("start_time")?,
        expiry_time: row.try_get("expiry_time")?,
    })
}

fn map_insert_error(err: tokio_postgres::Error, what: String) -> StoreError {
    if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        StoreError::UniqueViolation(what)
    } else {
        StoreError::Postgres(err)
    }
}

#[async_trait]
impl LockStore for PostgresLockStore {
    fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    async fn get_resource(
        &self,
        namespace: &str,
        local_name: &str,
    ) -> Result<Option<LockResource>, StoreError> {
        let local_name = local_name.to_lowercase();
        let row = self
            .client
            .query_opt(
                "SELECT id, version, namespace, local_name FROM leasehold_lock_resource \
                 WHERE namespace = $1 AND local_name = $2",
                &[&namespace, &local_name],
            )
            .await?;
        row.as_ref().map(resource_from_row).transpose()
    }

    async fn create_resource(
        &self,
        namespace: &str,
        local_name: &str,
    ) -> Result<LockResource, StoreError> {
        let local_name = local_name.to_lowercase();
        let row = self
            .client
            .query_one(
                "INSERT INTO leasehold_lock_resource (version, namespace, local_name) \
                 VALUES (0, $1, $2) \
                 RETURNING id, version, namespace, local_name",
                &[&namespace, &local_name],
            )
            .await
            .map_err(|err| {
                map_insert_error(
                    err,
                    format!("lock resource {namespace}:{local_name} already exists"),
                )
            })?;
        resource_from_row(&row)
    }

    async fn list_resources(&self, namespace: &str) -> Result<Vec<LockResource>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT id, version, namespace, local_name FROM leasehold_lock_resource \
                 WHERE namespace = $1 ORDER BY id",
                &[&namespace],
            )
            .await?;
        rows.iter().map(resource_from_row).collect()
    }

    async fn get_lock(&self, id: LockId) -> Result<Option<LockRow>, StoreError> {
        let sql = format!("SELECT {LOCK_COLUMNS} FROM leasehold_lock WHERE id = $1");
        let row = self.client.query_opt(sql.as_str(), &[&id.id()]).await?;
        row.as_ref().map(lock_from_row).transpose()
    }

    async fn get_lock_by_key(
        &self,
        shared_resource_id: ResourceId,
        exclusive_resource_id: ResourceId,
    ) -> Result<Option<LockRow>, StoreError> {
        let sql = format!(
            "SELECT {LOCK_COLUMNS} FROM leasehold_lock \
             WHERE shared_resource_id = $1 AND excl_resource_id = $2"
        );
        let row = self
            .client
            .query_opt(
                sql.as_str(),
                &[&shared_resource_id.id(), &exclusive_resource_id.id()],
            )
            .await?;
        row.as_ref().map(lock_from_row).transpose()
    }

    async fn get_locks_by_shared_resource_ids(
        &self,
        shared_resource_ids: &[ResourceId],
    ) -> Result<Vec<LockRow>, StoreError> {
        if shared_resource_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = shared_resource_ids.iter().map(ResourceId::id).collect();
        let sql = format!(
            "SELECT {LOCK_COLUMNS} FROM leasehold_lock \
             WHERE shared_resource_id = ANY($1) ORDER BY id"
        );
        let rows = self.client.query(sql.as_str(), &[&ids]).await?;
        rows.iter().map(lock_from_row).collect()
    }

    async fn create_lock(
        &self,
        shared_resource_id: ResourceId,
        exclusive_resource_id: ResourceId,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<LockRow, StoreError> {
        let now = self.now_ms();
        let expiry = initial_expiry(now, ttl_ms(ttl));
        let sql = format!(
            "INSERT INTO leasehold_lock \
             (version, shared_resource_id, excl_resource_id, lock_token, start_time, expiry_time) \
             VALUES (0, $1, $2, $3, $4, $5) RETURNING {LOCK_COLUMNS}"
        );
        let row = self
            .client
            .query_one(
                sql.as_str(),
                &[
                    &shared_resource_id.id(),
                    &exclusive_resource_id.id(),
                    &token.as_str(),
                    &now,
                    &expiry,
                ],
            )
            .await
            .map_err(|err| {
                map_insert_error(
                    err,
                    format!("lock ({shared_resource_id}, {exclusive_resource_id}) already exists"),
                )
            })?;
        lock_from_row(&row)
    }

    async fn update_lock(
        &self,
        current: &LockRow,
        new_token: &LockToken,
        ttl: Duration,
    ) -> Result<LockRow, StoreError> {
        let now = self.now_ms();
        let expiry = next_expiry(now, ttl_ms(ttl), current.expiry_time);
        let sql = format!(
            "UPDATE leasehold_lock \
             SET version = version + 1, lock_token = $1, start_time = $2, expiry_time = $3 \
             WHERE id = $4 AND version = $5 RETURNING {LOCK_COLUMNS}"
        );
        let row = self
            .client
            .query_opt(
                sql.as_str(),
                &[
                    &new_token.as_str(),
                    &now,
                    &expiry,
                    &current.id.id(),
                    &current.version,
                ],
            )
            .await?;
        match row {
            Some(row) => lock_from_row(&row),
            None => Err(StoreError::ConcurrencyFailure {
                lock_id: current.id,
                expected_version: current.version,
            }),
        }
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
        let updated = self
            .client
            .execute(
                "UPDATE leasehold_lock \
                 SET version = version + 1, lock_token = $1, start_time = $2, \
                     expiry_time = CASE WHEN $3::BIGINT <= 0 THEN 0 \
                                        ELSE GREATEST($2 + $3, expiry_time + 1) END \
                 WHERE excl_resource_id = $4 AND LOWER(lock_token) = LOWER($5)",
                &[
                    &new_token.as_str(),
                    &now,
                    &ttl,
                    &exclusive_resource_id.id(),
                    &old_token.as_str(),
                ],
            )
            .await?;
        Ok(updated)
    }
}
