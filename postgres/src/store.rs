//! Revision-checked document store over `PostgreSQL`.

use crate::feed;
use ride_dispatch_core::account::Account;
use ride_dispatch_core::ledger::{TransactionKind, WalletTransaction};
use ride_dispatch_core::ride::RideRequest;
use ride_dispatch_core::store::{
    ChangeStream, CommitReceipt, DocumentKey, Revision, RideQuery, RideStore, StoreError,
    StoreFuture, Versioned, WriteBatch, WriteOp,
};
use ride_dispatch_core::types::{AccountId, RideId, TransactionId};
use sqlx::PgConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::collections::HashSet;
use std::time::Instant;
use uuid::Uuid;

/// `PostgreSQL`-backed [`RideStore`].
///
/// Every put in a [`WriteBatch`] runs as
/// `UPDATE .. WHERE id = $1 AND revision = $2` (or an
/// `INSERT .. ON CONFLICT DO NOTHING` for new documents) inside one
/// transaction. A put that touches no row rolls the whole batch back and
/// reports a [`StoreError::ConcurrencyConflict`] with the revision actually
/// stored.
///
/// # Schema
///
/// See `migrations/0001_ride_dispatch.sql`; apply it with
/// [`PostgresRideStore::migrate`].
#[derive(Clone, Debug)]
pub struct PostgresRideStore {
    pool: PgPool,
}

impl PostgresRideStore {
    /// Connect a pool of at most `max_connections`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if the database cannot be reached.
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to connect: {e}")))?;
        Ok(Self::from_pool(pool))
    }

    /// Use an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables and indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))
    }

    #[tracing::instrument(skip_all, fields(ops = batch.len()))]
    async fn apply(&self, batch: WriteBatch) -> Result<CommitReceipt, StoreError> {
        ensure_single_writes(&batch)?;

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut receipt = CommitReceipt::default();

        for op in batch.into_ops() {
            match op {
                WriteOp::PutRide { ride, expected } => {
                    let revision = put_ride(&mut tx, &ride, expected).await?;
                    let payload = feed::encode(&ride, revision)?;
                    sqlx::query("SELECT pg_notify($1, $2)")
                        .bind(feed::CHANGE_CHANNEL)
                        .bind(payload)
                        .execute(&mut *tx)
                        .await
                        .map_err(map_sqlx_error)?;
                    receipt.rides.push((ride.id, revision));
                },
                WriteOp::PutAccount { account, expected } => {
                    let revision = put_account(&mut tx, &account, expected).await?;
                    receipt.accounts.push((account.id, revision));
                },
                WriteOp::AppendLedger(entry) => append_ledger(&mut tx, &entry).await?,
            }
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(receipt)
    }
}

impl RideStore for PostgresRideStore {
    fn load_ride(&self, id: RideId) -> StoreFuture<'_, Option<Versioned<RideRequest>>> {
        Box::pin(async move {
            let row: Option<(i64, Json<RideRequest>)> =
                sqlx::query_as("SELECT revision, doc FROM ride_requests WHERE id = $1")
                    .bind(*id.as_uuid())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(map_sqlx_error)?;

            row.map(|(revision, Json(ride))| Ok(Versioned::new(from_db(revision)?, ride)))
                .transpose()
        })
    }

    fn load_account(&self, id: AccountId) -> StoreFuture<'_, Option<Versioned<Account>>> {
        Box::pin(async move {
            let row: Option<(i64, Json<Account>)> =
                sqlx::query_as("SELECT revision, doc FROM accounts WHERE id = $1")
                    .bind(*id.as_uuid())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(map_sqlx_error)?;

            row.map(|(revision, Json(account))| Ok(Versioned::new(from_db(revision)?, account)))
                .transpose()
        })
    }

    fn query_rides(&self, query: RideQuery) -> StoreFuture<'_, Vec<Versioned<RideRequest>>> {
        Box::pin(async move {
            let statuses: Vec<String> = query.statuses.iter().map(|s| s.as_str().to_string()).collect();
            let rows: Vec<(i64, Json<RideRequest>)> = sqlx::query_as(
                r"
                SELECT revision, doc FROM ride_requests
                WHERE (cardinality($1::text[]) = 0 OR status = ANY($1))
                  AND ($2::text IS NULL OR category = $2)
                  AND ($3::uuid IS NULL OR rider_id = $3 OR driver_id = $3)
                ORDER BY created_at, id
                ",
            )
            .bind(statuses)
            .bind(query.category.map(|c| c.as_str()))
            .bind(query.participant.map(|id| *id.as_uuid()))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            rows.into_iter()
                .map(|(revision, Json(ride))| Ok(Versioned::new(from_db(revision)?, ride)))
                .collect()
        })
    }

    fn commit(&self, batch: WriteBatch) -> StoreFuture<'_, CommitReceipt> {
        Box::pin(async move {
            let start = Instant::now();
            let result = self.apply(batch).await;

            let outcome = match &result {
                Ok(_) => "committed",
                Err(error) if error.is_conflict() => "conflict",
                Err(StoreError::DuplicateLedgerEntry { .. }) => "duplicate_ledger",
                Err(_) => "error",
            };
            metrics::counter!("ride_store.commits", "outcome" => outcome).increment(1);
            metrics::histogram!("ride_store.commit.duration_seconds").record(start.elapsed().as_secs_f64());
            if let Err(error) = &result {
                tracing::debug!(%error, outcome, "Commit rolled back");
            }
            result
        })
    }

    fn ledger(&self, account: AccountId) -> StoreFuture<'_, Vec<WalletTransaction>> {
        Box::pin(async move {
            let rows: Vec<LedgerRow> = sqlx::query_as(
                r"
                SELECT id, account_id, ride_id, amount, kind, description, created_at
                FROM wallet_transactions
                WHERE account_id = $1
                ORDER BY seq
                ",
            )
            .bind(*account.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            rows.into_iter().map(ledger_entry).collect()
        })
    }

    fn subscribe(&self) -> StoreFuture<'_, ChangeStream> {
        Box::pin(feed::listen(&self.pool))
    }
}

type LedgerRow = (Uuid, Uuid, Uuid, i64, String, String, chrono::DateTime<chrono::Utc>);

fn ledger_entry(row: LedgerRow) -> Result<WalletTransaction, StoreError> {
    let (id, account_id, ride_id, amount, kind, description, timestamp) = row;
    let kind = match kind.as_str() {
        "TRIP_EARNING" => TransactionKind::TripEarning,
        other => {
            return Err(StoreError::Serialization(format!(
                "unknown transaction kind {other}"
            )));
        },
    };
    Ok(WalletTransaction {
        id: TransactionId::from_uuid(id),
        account_id: AccountId::from_uuid(account_id),
        ride_id: RideId::from_uuid(ride_id),
        amount,
        kind,
        description,
        timestamp,
    })
}

/// A batch may write each document once.
fn ensure_single_writes(batch: &WriteBatch) -> Result<(), StoreError> {
    let mut touched = HashSet::new();
    for op in batch.ops() {
        let key = match op {
            WriteOp::PutRide { ride, .. } => DocumentKey::Ride(ride.id),
            WriteOp::PutAccount { account, .. } => DocumentKey::Account(account.id),
            WriteOp::AppendLedger(_) => continue,
        };
        if !touched.insert(key) {
            return Err(StoreError::Database(format!("batch writes {key} twice")));
        }
    }
    Ok(())
}

async fn put_ride(
    conn: &mut PgConnection,
    ride: &RideRequest,
    expected: Option<Revision>,
) -> Result<Revision, StoreError> {
    let id = *ride.id.as_uuid();
    let driver_id = ride.driver_id().map(|driver| *driver.as_uuid());

    let written: Option<(i64,)> = match expected {
        Some(expected) => sqlx::query_as(
            r"
            UPDATE ride_requests
            SET revision = revision + 1, status = $3, driver_id = $4, doc = $5, updated_at = now()
            WHERE id = $1 AND revision = $2
            RETURNING revision
            ",
        )
        .bind(id)
        .bind(to_db(expected)?)
        .bind(ride.status().as_str())
        .bind(driver_id)
        .bind(Json(ride))
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx_error)?,
        None => sqlx::query_as(
            r"
            INSERT INTO ride_requests (id, revision, status, category, rider_id, driver_id, created_at, doc)
            VALUES ($1, 1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            RETURNING revision
            ",
        )
        .bind(id)
        .bind(ride.status().as_str())
        .bind(ride.category.as_str())
        .bind(*ride.rider_id.as_uuid())
        .bind(driver_id)
        .bind(ride.created_at)
        .bind(Json(ride))
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx_error)?,
    };

    match written {
        Some((revision,)) => from_db(revision),
        None => {
            let actual: Option<(i64,)> = sqlx::query_as("SELECT revision FROM ride_requests WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(map_sqlx_error)?;
            Err(conflict(DocumentKey::Ride(ride.id), expected, actual)?)
        },
    }
}

async fn put_account(
    conn: &mut PgConnection,
    account: &Account,
    expected: Option<Revision>,
) -> Result<Revision, StoreError> {
    let id = *account.id.as_uuid();

    let written: Option<(i64,)> = match expected {
        Some(expected) => sqlx::query_as(
            r"
            UPDATE accounts
            SET revision = revision + 1, doc = $3, updated_at = now()
            WHERE id = $1 AND revision = $2
            RETURNING revision
            ",
        )
        .bind(id)
        .bind(to_db(expected)?)
        .bind(Json(account))
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx_error)?,
        None => sqlx::query_as(
            r"
            INSERT INTO accounts (id, revision, doc)
            VALUES ($1, 1, $2)
            ON CONFLICT (id) DO NOTHING
            RETURNING revision
            ",
        )
        .bind(id)
        .bind(Json(account))
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx_error)?,
    };

    match written {
        Some((revision,)) => from_db(revision),
        None => {
            let actual: Option<(i64,)> = sqlx::query_as("SELECT revision FROM accounts WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(map_sqlx_error)?;
            Err(conflict(DocumentKey::Account(account.id), expected, actual)?)
        },
    }
}

async fn append_ledger(conn: &mut PgConnection, entry: &WalletTransaction) -> Result<(), StoreError> {
    let inserted: Option<(i64,)> = sqlx::query_as(
        r"
        INSERT INTO wallet_transactions (id, account_id, ride_id, amount, kind, description, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (ride_id, kind) DO NOTHING
        RETURNING seq
        ",
    )
    .bind(*entry.id.as_uuid())
    .bind(*entry.account_id.as_uuid())
    .bind(*entry.ride_id.as_uuid())
    .bind(entry.amount)
    .bind(entry.kind.as_str())
    .bind(&entry.description)
    .bind(entry.timestamp)
    .fetch_optional(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;

    if inserted.is_none() {
        return Err(StoreError::DuplicateLedgerEntry {
            ride_id: entry.ride_id,
        });
    }
    Ok(())
}

fn conflict(
    document: DocumentKey,
    expected: Option<Revision>,
    actual: Option<(i64,)>,
) -> Result<StoreError, StoreError> {
    Ok(StoreError::ConcurrencyConflict {
        document,
        expected,
        actual: actual.map(|(revision,)| from_db(revision)).transpose()?,
    })
}

fn to_db(revision: Revision) -> Result<i64, StoreError> {
    i64::try_from(revision.value())
        .map_err(|_| StoreError::Database(format!("revision {revision} exceeds BIGINT")))
}

fn from_db(revision: i64) -> Result<Revision, StoreError> {
    u64::try_from(revision)
        .map(Revision::new)
        .map_err(|_| StoreError::Serialization(format!("negative revision {revision}")))
}

/// Connection-level failures are `Unavailable` (nothing was written, retry
/// later); everything else is a `Database` error.
pub(crate) fn map_sqlx_error(error: sqlx::Error) -> StoreError {
    match &error {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(error.to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(error.to_string())
        },
        _ => StoreError::Database(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_failures_are_transient() {
        assert!(map_sqlx_error(sqlx::Error::PoolTimedOut).is_transient());
        assert!(map_sqlx_error(sqlx::Error::PoolClosed).is_transient());
        assert!(!map_sqlx_error(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn revisions_outside_bigint_are_rejected() {
        assert!(to_db(Revision::new(u64::MAX)).is_err());
        assert_eq!(to_db(Revision::FIRST), Ok(1));
        assert!(from_db(-1).is_err());
    }
}
