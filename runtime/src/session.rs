//! A connected client's live subscriptions.
//!
//! A [`Session`] belongs to one account. Every feed it hands out watches the
//! session's shutdown channel, so closing or dropping the session ends them
//! all.

use crate::broadcaster::{DispatchBroadcaster, LiveFeed, PendingFilter, PendingSnapshot};
use crate::commit::load_account;
use ride_dispatch_core::DispatchError;
use ride_dispatch_core::ride::RideRequest;
use ride_dispatch_core::store::RideStore;
use ride_dispatch_core::types::{AccountId, Actor};
use std::sync::Arc;
use tokio::sync::watch;

/// Live views for one account.
pub struct Session {
    actor: Actor,
    account_id: AccountId,
    store: Arc<dyn RideStore>,
    broadcaster: DispatchBroadcaster,
    radius_km: Option<f64>,
    shutdown: watch::Sender<bool>,
}

impl Session {
    /// Open a session for `actor`.
    ///
    /// # Errors
    ///
    /// Permission errors for the system actor, a deactivated account or one
    /// lacking the claimed role; [`DispatchError::AccountNotFound`];
    /// [`DispatchError::Unavailable`] when the store cannot be reached.
    pub(crate) async fn open(
        store: Arc<dyn RideStore>,
        broadcaster: DispatchBroadcaster,
        radius_km: Option<f64>,
        actor: Actor,
    ) -> Result<Self, DispatchError> {
        let (account_id, role) = match (actor.account_id(), actor.role()) {
            (Some(id), Some(role)) => (id, role),
            _ => return Err(DispatchError::permission("sessions belong to an account")),
        };

        let account = load_account(store.as_ref(), account_id).await?.value;
        if !account.active {
            return Err(DispatchError::permission(format!("account {account_id} is deactivated")));
        }
        account.ensure_role(role)?;

        let (shutdown, _) = watch::channel(false);
        tracing::debug!(%account_id, %actor, "Session opened");

        Ok(Self {
            actor,
            account_id,
            store,
            broadcaster,
            radius_km,
            shutdown,
        })
    }

    /// Account this session belongs to.
    #[must_use]
    pub const fn account_id(&self) -> AccountId {
        self.account_id
    }

    /// Acting party behind this session.
    #[must_use]
    pub const fn actor(&self) -> Actor {
        self.actor
    }

    /// Requests this driver can accept, refreshed as they change.
    ///
    /// The filter is built from the account as stored now; a driver who
    /// changes category or moves far should open a new feed.
    ///
    /// # Errors
    ///
    /// Permission errors unless the session belongs to an approved,
    /// KYC-verified driver acting as one; [`DispatchError::Unavailable`]
    /// when the store cannot be reached.
    #[tracing::instrument(skip_all, fields(account_id = %self.account_id))]
    pub async fn pending_requests(&self) -> Result<LiveFeed<PendingSnapshot>, DispatchError> {
        if !matches!(self.actor, Actor::Driver(_)) {
            return Err(DispatchError::permission("only drivers see pending requests"));
        }

        let driver = load_account(self.store.as_ref(), self.account_id).await?.value;
        let filter = PendingFilter::for_driver(&driver)?.within_km(self.radius_km);
        Ok(self.broadcaster.watch_pending(filter, self.shutdown.subscribe()))
    }

    /// This account's current trip, as rider or driver; `None` between trips.
    #[must_use]
    pub fn active_trip(&self) -> LiveFeed<Option<RideRequest>> {
        self.broadcaster
            .watch_active(self.account_id, self.shutdown.subscribe())
    }

    /// End every feed this session handed out.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        tracing::debug!(account_id = %self.account_id, "Session closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("actor", &self.actor)
            .field("radius_km", &self.radius_km)
            .finish_non_exhaustive()
    }
}
