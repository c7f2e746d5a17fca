//! Account directory: signup, availability, location and administration.
//!
//! Wallet, rating and trip counters are not writable here; they change only
//! through the settlement engine.

use crate::commit::{AttemptError, load_account, retry_on_conflict};
use crate::environment::DispatchEnvironment;
use crate::retry::RetryPolicy;
use ride_dispatch_core::DispatchError;
use ride_dispatch_core::account::Account;
use ride_dispatch_core::environment::Clock;
use ride_dispatch_core::ledger::WalletTransaction;
use ride_dispatch_core::store::{RideQuery, RideStore, Versioned, WriteBatch};
use ride_dispatch_core::types::{AccountId, Actor, Gender, GeoPoint, Role, VehicleCategory};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Signup data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    /// Display name
    pub name: String,
    /// Roles to hold
    pub roles: BTreeSet<Role>,
    /// Vehicle tier; required with the driver role
    #[serde(default)]
    pub vehicle_category: Option<VehicleCategory>,
    /// Gender; required for gender-restricted tiers
    #[serde(default)]
    pub gender: Option<Gender>,
}

impl Registration {
    /// A rider-only signup.
    #[must_use]
    pub fn rider(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roles: BTreeSet::from([Role::Rider]),
            vehicle_category: None,
            gender: None,
        }
    }

    /// A driver signup for `category`.
    #[must_use]
    pub fn driver(name: impl Into<String>, category: VehicleCategory, gender: Gender) -> Self {
        Self {
            name: name.into(),
            roles: BTreeSet::from([Role::Driver]),
            vehicle_category: Some(category),
            gender: Some(gender),
        }
    }

    /// An administrator signup.
    #[must_use]
    pub fn admin(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roles: BTreeSet::from([Role::Admin]),
            vehicle_category: None,
            gender: None,
        }
    }

    /// Also hold `role`.
    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.insert(role);
        self
    }

    fn validate(&self) -> Result<(), DispatchError> {
        if self.name.trim().is_empty() {
            return Err(DispatchError::validation("name must not be empty"));
        }
        if self.roles.is_empty() {
            return Err(DispatchError::validation("at least one role is required"));
        }
        if self.roles.contains(&Role::Driver) {
            let category = self
                .vehicle_category
                .ok_or_else(|| DispatchError::validation("drivers must register a vehicle category"))?;
            if let Some(required) = category.required_driver_gender() {
                if self.gender != Some(required) {
                    return Err(DispatchError::validation(format!(
                        "{category} vehicles require a {required:?} driver"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Fails unless the actor's stored account is active and holds the role the
/// actor claims. The system actor passes unchecked.
pub(crate) async fn verify_actor(store: &dyn RideStore, actor: &Actor) -> Result<(), AttemptError> {
    if let (Some(id), Some(role)) = (actor.account_id(), actor.role()) {
        load_account(store, id).await?.value.ensure_role(role)?;
    }
    Ok(())
}

/// Account reads and non-financial account writes.
#[derive(Clone, Debug)]
pub struct AccountDirectory {
    env: DispatchEnvironment,
    retry: RetryPolicy,
}

impl AccountDirectory {
    /// Create a directory over `env.store`.
    #[must_use]
    pub const fn new(env: DispatchEnvironment, retry: RetryPolicy) -> Self {
        Self { env, retry }
    }

    /// Create an active, unapproved account.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Validation`] for an empty name, no roles, a driver
    /// without a vehicle category, or a gender-restricted category the
    /// driver's gender does not fit; [`DispatchError::Unavailable`] when the
    /// store cannot be reached.
    #[tracing::instrument(skip_all, fields(name = %registration.name))]
    pub async fn register(&self, registration: Registration) -> Result<Account, DispatchError> {
        registration.validate()?;

        let mut account = Account::new(
            AccountId::new(),
            registration.name.trim(),
            registration.roles,
            self.env.clock.now(),
        );
        account.vehicle_category = registration.vehicle_category;
        account.gender = registration.gender;

        self.env
            .store
            .commit(WriteBatch::new().insert_account(account.clone()))
            .await?;
        tracing::info!(account_id = %account.id, "Account registered");
        Ok(account)
    }

    /// Load an account.
    ///
    /// # Errors
    ///
    /// [`DispatchError::AccountNotFound`] or [`DispatchError::Unavailable`].
    pub async fn get(&self, id: AccountId) -> Result<Account, DispatchError> {
        Ok(load_account(self.env.store.as_ref(), id).await?.value)
    }

    /// Driver goes online or offline. Going online requires an approved,
    /// KYC-verified driver.
    ///
    /// # Errors
    ///
    /// Permission errors when `actor` is not that driver or may not drive.
    #[tracing::instrument(skip_all, fields(actor = %actor, online))]
    pub async fn set_availability(&self, actor: &Actor, online: bool) -> Result<Account, DispatchError> {
        let Actor::Driver(id) = *actor else {
            return Err(DispatchError::permission("only drivers change availability"));
        };

        self.update(id, |account| {
            if online {
                account.ensure_can_drive()?;
            } else {
                account.ensure_role(Role::Driver)?;
            }
            Ok(Account {
                online,
                ..account.clone()
            })
        })
        .await
    }

    /// Record the account's current position.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Validation`] for coordinates out of range; permission
    /// errors when `actor` has no account.
    pub async fn update_location(&self, actor: &Actor, point: GeoPoint) -> Result<Account, DispatchError> {
        if !point.is_valid() {
            return Err(DispatchError::validation(format!("invalid coordinates {point}")));
        }
        let id = actor
            .account_id()
            .ok_or_else(|| DispatchError::permission("system actor has no location"))?;

        self.update(id, |account| {
            if !account.active {
                return Err(DispatchError::permission(format!("account {id} is deactivated")));
            }
            Ok(Account {
                last_location: Some(point),
                ..account.clone()
            })
        })
        .await
    }

    /// Set a driver's approval and KYC flags. Administrators only.
    ///
    /// Revoking approval also takes the driver offline.
    ///
    /// # Errors
    ///
    /// Permission errors unless `admin` is an active administrator;
    /// [`DispatchError::RoleRequired`] when the target is not a driver.
    #[tracing::instrument(skip_all, fields(admin = %admin, driver_id = %driver_id, approved, kyc_verified))]
    pub async fn set_approval(
        &self,
        admin: &Actor,
        driver_id: AccountId,
        approved: bool,
        kyc_verified: bool,
    ) -> Result<Account, DispatchError> {
        self.ensure_admin(admin).await?;

        let account = self
            .update(driver_id, |account| {
                account.ensure_role(Role::Driver)?;
                let online = account.online && approved && kyc_verified;
                Ok(Account {
                    approved,
                    kyc_verified,
                    online,
                    ..account.clone()
                })
            })
            .await?;
        tracing::info!("Driver approval updated");
        Ok(account)
    }

    /// Deactivate an account. Allowed for the account itself or an
    /// administrator, and only while it has no unfinished ride.
    ///
    /// # Errors
    ///
    /// Permission errors for other actors; [`DispatchError::Conflict`] while
    /// the account has a ride in progress.
    #[tracing::instrument(skip_all, fields(actor = %actor, account_id = %id))]
    pub async fn deactivate(&self, actor: &Actor, id: AccountId) -> Result<Account, DispatchError> {
        if actor.account_id() != Some(id) {
            self.ensure_admin(actor).await?;
        }

        // Bids and accepts rewrite the account they act for, so a ride that
        // appears after the check below makes this commit conflict and re-run.
        let store = self.env.store.as_ref();
        let account = retry_on_conflict(&self.retry, || async move {
            let Versioned { revision, value } = load_account(store, id).await?;
            let open = store.query_rides(RideQuery::open_for(id)).await?;
            if let Some(ride) = open.first() {
                return Err(DispatchError::conflict(format!(
                    "account {id} still has ride {} in progress",
                    ride.value.id
                ))
                .into());
            }
            let updated = Account {
                active: false,
                online: false,
                ..value
            };
            store
                .commit(WriteBatch::new().put_account(updated.clone(), revision))
                .await?;
            Ok::<_, AttemptError>(updated)
        })
        .await?;
        tracing::info!("Account deactivated");
        Ok(account)
    }

    /// Wallet ledger of an account, oldest first. The account itself or an
    /// administrator may read it.
    ///
    /// # Errors
    ///
    /// Permission errors for other actors.
    pub async fn ledger(&self, actor: &Actor, id: AccountId) -> Result<Vec<WalletTransaction>, DispatchError> {
        if actor.account_id() != Some(id) {
            self.ensure_admin(actor).await?;
        }
        Ok(self.env.store.ledger(id).await?)
    }

    async fn ensure_admin(&self, actor: &Actor) -> Result<(), DispatchError> {
        match actor {
            Actor::Admin(_) => Ok(verify_actor(self.env.store.as_ref(), actor).await?),
            _ => Err(DispatchError::permission(format!(
                "{actor} is not an administrator"
            ))),
        }
    }

    async fn update<F>(&self, id: AccountId, change: F) -> Result<Account, DispatchError>
    where
        F: Fn(&Account) -> Result<Account, DispatchError>,
    {
        let store = self.env.store.as_ref();
        let change = &change;
        retry_on_conflict(&self.retry, || async move {
            let Versioned { revision, value } = load_account(store, id).await?;
            let updated = change(&value)?;
            store
                .commit(WriteBatch::new().put_account(updated.clone(), revision))
                .await?;
            Ok::<_, AttemptError>(updated)
        })
        .await
    }
}
