//! `LISTEN/NOTIFY` change feed.

use crate::store::map_sqlx_error;
use async_stream::stream;
use ride_dispatch_core::ride::RideRequest;
use ride_dispatch_core::store::{ChangeStream, Revision, RideChange, StoreError};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgListener;

/// Channel every ride commit is announced on.
pub const CHANGE_CHANNEL: &str = "ride_changes";

#[derive(Serialize)]
struct OutgoingChange<'a> {
    revision: u64,
    ride: &'a RideRequest,
}

#[derive(Deserialize)]
struct IncomingChange {
    revision: u64,
    ride: RideRequest,
}

/// Notification payload for a ride written at `revision`.
///
/// Payloads must stay under the server's 8000 byte limit. Addresses and
/// cancellation reasons are length-capped before they reach the store, which
/// keeps even a fully escaped ride document well below it.
pub(crate) fn encode(ride: &RideRequest, revision: Revision) -> Result<String, StoreError> {
    serde_json::to_string(&OutgoingChange {
        revision: revision.value(),
        ride,
    })
    .map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn decode(payload: &str) -> Result<RideChange, StoreError> {
    let change: IncomingChange =
        serde_json::from_str(payload).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(RideChange {
        ride: change.ride,
        revision: Revision::new(change.revision),
    })
}

/// Open a dedicated listener connection.
///
/// The stream ends after its first error. A lost connection is reported as
/// `Unavailable` rather than silently reconnected, since notifications sent
/// while it was down are gone and the consumer has to re-query.
pub(crate) async fn listen(pool: &PgPool) -> Result<ChangeStream, StoreError> {
    let mut listener = PgListener::connect_with(pool).await.map_err(map_sqlx_error)?;
    listener.listen(CHANGE_CHANNEL).await.map_err(map_sqlx_error)?;
    tracing::debug!(channel = CHANGE_CHANNEL, "Change feed listening");

    Ok(Box::pin(stream! {
        loop {
            match listener.try_recv().await {
                Ok(Some(notification)) => match decode(notification.payload()) {
                    Ok(change) => yield Ok(change),
                    Err(error) => {
                        tracing::warn!(%error, "Undecodable ride change");
                        yield Err(error);
                        break;
                    },
                },
                Ok(None) => {
                    yield Err(StoreError::Unavailable("change feed connection lost".to_string()));
                    break;
                },
                Err(error) => {
                    yield Err(map_sqlx_error(error));
                    break;
                },
            }
        }
    }))
}
