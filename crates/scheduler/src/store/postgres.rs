//! Postgres-backed task store.
//!
//! ## Claiming
//!
//! `claim_due` is a single statement:
//!
//! ```sql
//! UPDATE queued_task_instances SET state = 'claimed', ...
//! WHERE id IN (SELECT id ... FOR UPDATE SKIP LOCKED)
//! RETURNING ...
//! ```
//!
//! Rows locked by a concurrent claimer are skipped rather than waited on, so
//! any number of scheduler processes can poll the same table and no row is
//! ever returned to two of them.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database (unique violation `23505`) | `AlreadyExists` |
//! | Database (other) | `Unavailable` |
//! | PoolClosed / PoolTimedOut / Io / Tls | `Unavailable` |
//! | ColumnDecode / Decode / invalid values | `Corrupt` |
//!
//! ## Runtime
//!
//! The [`TaskStore`] trait is synchronous and is called from plain worker
//! threads. The store keeps the tokio runtime handle it was created on and
//! drives each query with `Handle::block_on`. That runtime must be a
//! multi-thread runtime, and the trait methods must not be called from inside
//! one of its async tasks.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use tasque_core::{InstanceId, OwnerId};

use super::r#trait::{InstanceState, QueuedTaskInstance, StoreError, StoreStats, TaskStore};
use crate::payload::Payload;
use crate::policy::Attempts;

const INSTANCE_COLUMNS: &str = "id, task_name, payload, due_at, state, failure_count, \
                                repeat_count, claim_owner, claimed_at";

/// Postgres-backed task store.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresTaskStore {
    /// Create a store on the current tokio runtime.
    pub fn new(pool: PgPool) -> Result<Self, StoreError> {
        let runtime = Handle::try_current().map_err(|_| {
            StoreError::Unavailable(
                "PostgresTaskStore must be created inside a tokio runtime".to_string(),
            )
        })?;
        Ok(Self::with_runtime(pool, runtime))
    }

    /// Create a store that drives its queries on `runtime`.
    pub fn with_runtime(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    /// Create the table and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queued_task_instances (
                id            UUID PRIMARY KEY,
                task_name     TEXT NOT NULL,
                payload       BYTEA NOT NULL,
                due_at        TIMESTAMPTZ NOT NULL,
                state         TEXT NOT NULL CHECK (state IN ('pending', 'claimed')),
                failure_count INTEGER NOT NULL DEFAULT 0 CHECK (failure_count >= 0),
                repeat_count  INTEGER NOT NULL DEFAULT 0 CHECK (repeat_count >= 0),
                claim_owner   UUID NULL,
                claimed_at    TIMESTAMPTZ NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS queued_task_instances_due_idx
                ON queued_task_instances (due_at)
                WHERE state = 'pending'
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS queued_task_instances_claimed_idx
                ON queued_task_instances (claimed_at)
                WHERE state = 'claimed'
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        Ok(())
    }

    #[instrument(skip(self, instance), fields(instance_id = %instance.id, task = %instance.task_name), err)]
    pub async fn insert(&self, instance: QueuedTaskInstance) -> Result<InstanceId, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO queued_task_instances
                (id, task_name, payload, due_at, state, failure_count, repeat_count, claim_owner, claimed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(instance.id.as_uuid())
        .bind(&instance.task_name)
        .bind(instance.payload.as_bytes())
        .bind(instance.due_at)
        .bind(instance.state.as_str())
        .bind(to_db_count(instance.failure_count))
        .bind(to_db_count(instance.repeat_count))
        .bind(instance.claim_owner.map(|o| *o.as_uuid()))
        .bind(instance.claimed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match map_sqlx_error("insert", e) {
            StoreError::AlreadyExists(_) => StoreError::AlreadyExists(instance.id),
            other => other,
        })?;

        Ok(instance.id)
    }

    #[instrument(skip(self), fields(instance_id = %id), err)]
    pub async fn get(&self, id: InstanceId) -> Result<Option<QueuedTaskInstance>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM queued_task_instances WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_instance(&r)).transpose()
    }

    #[instrument(skip(self), fields(owner = %owner), err)]
    pub async fn claim_due(
        &self,
        owner: OwnerId,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueuedTaskInstance>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE queued_task_instances
            SET state = 'claimed', claim_owner = $1, claimed_at = $2
            WHERE id IN (
                SELECT id FROM queued_task_instances
                WHERE state = 'pending' AND due_at <= $2
                ORDER BY due_at ASC
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(owner.as_uuid())
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_due", e))?;

        let mut claimed = rows
            .iter()
            .map(decode_instance)
            .collect::<Result<Vec<_>, _>>()?;

        // RETURNING does not preserve the sub-select's order
        claimed.sort_by_key(|i| (i.due_at, i.id));
        Ok(claimed)
    }

    #[instrument(skip(self), fields(instance_id = %id, owner = %owner), err)]
    pub async fn reschedule(
        &self,
        id: InstanceId,
        owner: OwnerId,
        attempts: Attempts,
        due_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queued_task_instances
            SET state = 'pending', claim_owner = NULL, claimed_at = NULL,
                failure_count = $3, repeat_count = $4, due_at = $5
            WHERE id = $1 AND state = 'claimed' AND claim_owner = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(owner.as_uuid())
        .bind(to_db_count(attempts.failure_count))
        .bind(to_db_count(attempts.repeat_count))
        .bind(due_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("reschedule", e))?;

        self.check_claimed_mutation(id, result.rows_affected()).await
    }

    #[instrument(skip(self), fields(instance_id = %id, owner = %owner), err)]
    pub async fn delete(&self, id: InstanceId, owner: OwnerId) -> Result<(), StoreError> {
        let result = sqlx::query(
            "DELETE FROM queued_task_instances WHERE id = $1 AND state = 'claimed' AND claim_owner = $2",
        )
        .bind(id.as_uuid())
        .bind(owner.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete", e))?;

        self.check_claimed_mutation(id, result.rows_affected()).await
    }

    #[instrument(skip(self), fields(instance_id = %id, owner = %owner), err)]
    pub async fn release(&self, id: InstanceId, owner: OwnerId) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queued_task_instances
            SET state = 'pending', claim_owner = NULL, claimed_at = NULL
            WHERE id = $1 AND state = 'claimed' AND claim_owner = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(owner.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;

        self.check_claimed_mutation(id, result.rows_affected()).await
    }

    #[instrument(skip(self), err)]
    pub async fn release_expired_claims(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<InstanceId>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE queued_task_instances
            SET state = 'pending', claim_owner = NULL, claimed_at = NULL
            WHERE state = 'claimed' AND (claimed_at IS NULL OR claimed_at < $1)
            RETURNING id
            "#,
        )
        .bind(claimed_before)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_expired_claims", e))?;

        let mut released = rows
            .iter()
            .map(|r| {
                r.try_get::<uuid::Uuid, _>("id")
                    .map(InstanceId::from_uuid)
                    .map_err(|e| map_sqlx_error("release_expired_claims", e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        released.sort();
        Ok(released)
    }

    #[instrument(skip(self), err)]
    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS total FROM queued_task_instances GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = StoreStats::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("stats", e))?;
            let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("stats", e))?;
            let total = usize::try_from(total).unwrap_or(0);
            match InstanceState::parse(&state) {
                Some(InstanceState::Pending) => stats.pending = total,
                Some(InstanceState::Claimed) => stats.claimed = total,
                None => return Err(StoreError::Corrupt(format!("unknown state '{state}'"))),
            }
        }
        Ok(stats)
    }

    /// Turn a zero-row conditional mutation into `NotFound` or `ClaimLost`.
    async fn check_claimed_mutation(&self, id: InstanceId, affected: u64) -> Result<(), StoreError> {
        if affected > 0 {
            return Ok(());
        }
        let exists = sqlx::query("SELECT 1 FROM queued_task_instances WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("check_claim", e))?
            .is_some();

        if exists {
            Err(StoreError::ClaimLost(id))
        } else {
            Err(StoreError::NotFound(id))
        }
    }
}

impl TaskStore for PostgresTaskStore {
    fn insert(&self, instance: QueuedTaskInstance) -> Result<InstanceId, StoreError> {
        self.runtime.block_on(self.insert(instance))
    }

    fn get(&self, id: InstanceId) -> Result<Option<QueuedTaskInstance>, StoreError> {
        self.runtime.block_on(self.get(id))
    }

    fn claim_due(
        &self,
        owner: OwnerId,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueuedTaskInstance>, StoreError> {
        self.runtime.block_on(self.claim_due(owner, now))
    }

    fn reschedule(
        &self,
        id: InstanceId,
        owner: OwnerId,
        attempts: Attempts,
        due_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.runtime
            .block_on(self.reschedule(id, owner, attempts, due_at))
    }

    fn delete(&self, id: InstanceId, owner: OwnerId) -> Result<(), StoreError> {
        self.runtime.block_on(self.delete(id, owner))
    }

    fn release(&self, id: InstanceId, owner: OwnerId) -> Result<(), StoreError> {
        self.runtime.block_on(self.release(id, owner))
    }

    fn release_expired_claims(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<InstanceId>, StoreError> {
        self.runtime
            .block_on(self.release_expired_claims(claimed_before))
    }

    fn stats(&self) -> Result<StoreStats, StoreError> {
        self.runtime.block_on(self.stats())
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique violation; the caller fills in the id
                Some("23505") => StoreError::AlreadyExists(InstanceId::from_uuid(uuid::Uuid::nil())),
                // Check constraint
                Some("23514") => StoreError::Corrupt(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Corrupt(format!("failed to decode row in {}: {}", operation, err))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn to_db_count(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn from_db_count(column: &str, n: i32) -> Result<u32, StoreError> {
    u32::try_from(n).map_err(|_| StoreError::Corrupt(format!("negative {column}: {n}")))
}

fn decode_instance(row: &PgRow) -> Result<QueuedTaskInstance, StoreError> {
    let row = InstanceRow::from_row(row).map_err(|e| map_sqlx_error("decode_instance", e))?;
    row.try_into()
}

// SQLx row types

#[derive(Debug)]
struct InstanceRow {
    id: uuid::Uuid,
    task_name: String,
    payload: Vec<u8>,
    due_at: DateTime<Utc>,
    state: String,
    failure_count: i32,
    repeat_count: i32,
    claim_owner: Option<uuid::Uuid>,
    claimed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for InstanceRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(InstanceRow {
            id: row.try_get("id")?,
            task_name: row.try_get("task_name")?,
            payload: row.try_get("payload")?,
            due_at: row.try_get("due_at")?,
            state: row.try_get("state")?,
            failure_count: row.try_get("failure_count")?,
            repeat_count: row.try_get("repeat_count")?,
            claim_owner: row.try_get("claim_owner")?,
            claimed_at: row.try_get("claimed_at")?,
        })
    }
}

impl TryFrom<InstanceRow> for QueuedTaskInstance {
    type Error = StoreError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        let state = InstanceState::parse(&row.state)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown state '{}'", row.state)))?;

        Ok(QueuedTaskInstance {
            id: InstanceId::from_uuid(row.id),
            task_name: row.task_name,
            payload: Payload::from_bytes(row.payload),
            due_at: row.due_at,
            state,
            failure_count: from_db_count("failure_count", row.failure_count)?,
            repeat_count: from_db_count("repeat_count", row.repeat_count)?,
            claim_owner: row.claim_owner.map(OwnerId::from_uuid),
            claimed_at: row.claimed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use tokio::runtime::Runtime;

    fn connect() -> (Runtime, PostgresTaskStore) {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        let pool = runtime
            .block_on(PgPoolOptions::new().max_connections(4).connect(&url))
            .unwrap();
        let store = PostgresTaskStore::with_runtime(pool, runtime.handle().clone());
        runtime.block_on(store.ensure_schema()).unwrap();
        (runtime, store)
    }

    #[test]
    fn counts_survive_the_column_form() {
        assert_eq!(to_db_count(7), 7);
        assert_eq!(to_db_count(u32::MAX), i32::MAX);
        assert_eq!(from_db_count("failure_count", 3).unwrap(), 3);
        assert!(matches!(
            from_db_count("failure_count", -1),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn row_with_unknown_state_is_corrupt() {
        let row = InstanceRow {
            id: uuid::Uuid::now_v7(),
            task_name: "t".to_string(),
            payload: b"\"one\"".to_vec(),
            due_at: Utc::now(),
            state: "running".to_string(),
            failure_count: 0,
            repeat_count: 0,
            claim_owner: None,
            claimed_at: None,
        };
        assert!(matches!(
            QueuedTaskInstance::try_from(row),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    #[ignore = "requires DATABASE_URL pointing at a disposable Postgres database"]
    fn claim_protocol_against_postgres() {
        let (_runtime, store) = connect();
        let owner = OwnerId::new();
        let stranger = OwnerId::new();
        let now = Utc::now();

        let instance = QueuedTaskInstance::new(
            "pg-claim-test",
            Payload::encode("one").unwrap(),
            now - chrono::Duration::seconds(1),
        );
        let id = TaskStore::insert(&store, instance).unwrap();

        let claimed = TaskStore::claim_due(&store, owner, Utc::now()).unwrap();
        let mine = claimed.iter().find(|i| i.id == id).unwrap();
        assert_eq!(mine.claim_owner, Some(owner));
        assert_eq!(mine.payload.decode::<String>().unwrap(), "one");

        // Nobody else gets it
        let again = TaskStore::claim_due(&store, stranger, Utc::now()).unwrap();
        assert!(again.iter().all(|i| i.id != id));
        assert!(matches!(
            TaskStore::delete(&store, id, stranger),
            Err(StoreError::ClaimLost(_))
        ));

        let due_at = Utc::now() + chrono::Duration::hours(1);
        TaskStore::reschedule(&store, id, owner, Attempts::new(1, 1), due_at).unwrap();
        let stored = TaskStore::get(&store, id).unwrap().unwrap();
        assert_eq!(stored.state, InstanceState::Pending);
        assert_eq!(stored.attempts(), Attempts::new(1, 1));

        // Not due: claim skips it, so the owner cannot delete it either
        assert!(matches!(
            TaskStore::delete(&store, id, owner),
            Err(StoreError::ClaimLost(_))
        ));

        // Pull it forward and finish it
        TaskStore::claim_due(&store, owner, due_at + chrono::Duration::seconds(1)).unwrap();
        TaskStore::delete(&store, id, owner).unwrap();
        assert!(TaskStore::get(&store, id).unwrap().is_none());
        assert!(matches!(
            TaskStore::delete(&store, id, owner),
            Err(StoreError::NotFound(_))
        ));
    }
}
