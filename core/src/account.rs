//! Accounts: riders, drivers and administrators.

use crate::error::DispatchError;
use crate::types::{AccountId, Gender, GeoPoint, Role, VehicleCategory};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A user account. Serialized as the camelCase account record.
///
/// Wallet balance, rating and trip counters change only through settlement.
/// Approval and KYC flags change only through an administrator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Account id
    pub id: AccountId,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Roles held; rider and driver may be held together
    pub roles: BTreeSet<Role>,
    /// Approved to drive by an administrator
    #[serde(default)]
    pub approved: bool,
    /// KYC documents verified
    #[serde(default)]
    pub kyc_verified: bool,
    /// False once deactivated; accounts are never deleted
    #[serde(default = "default_active")]
    pub active: bool,
    /// Driver is accepting requests
    #[serde(default)]
    pub online: bool,
    /// Last reported position
    #[serde(default)]
    pub last_location: Option<GeoPoint>,
    /// Wallet balance in whole currency units
    #[serde(default)]
    pub wallet_balance: i64,
    /// Rolling average rating
    #[serde(default)]
    pub rating: f64,
    /// Ratings folded into `rating`
    #[serde(default)]
    pub rating_count: u32,
    /// Completed trips as a driver
    #[serde(default)]
    pub total_trips: u32,
    /// Vehicle tier for drivers
    #[serde(default)]
    pub vehicle_category: Option<VehicleCategory>,
    /// Gender, for gender-restricted categories
    #[serde(default)]
    pub gender: Option<Gender>,
    /// Signup time
    pub created_at: DateTime<Utc>,
}

const fn default_active() -> bool {
    true
}

impl Account {
    /// A fresh, active, unapproved account.
    #[must_use]
    pub fn new(
        id: AccountId,
        name: impl Into<String>,
        roles: impl IntoIterator<Item = Role>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            roles: roles.into_iter().collect(),
            approved: false,
            kyc_verified: false,
            active: true,
            online: false,
            last_location: None,
            wallet_balance: 0,
            rating: 0.0,
            rating_count: 0,
            total_trips: 0,
            vehicle_category: None,
            gender: None,
            created_at,
        }
    }

    /// Whether the account holds `role`.
    #[must_use]
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Fails unless the account is active and holds `role`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Permission`] for a deactivated account,
    /// [`DispatchError::RoleRequired`] when the role is missing.
    pub fn ensure_role(&self, role: Role) -> Result<(), DispatchError> {
        if !self.active {
            return Err(DispatchError::permission(format!(
                "account {} is deactivated",
                self.id
            )));
        }
        if self.has_role(role) {
            Ok(())
        } else {
            Err(DispatchError::RoleRequired {
                account: self.id,
                role,
            })
        }
    }

    /// Fails unless the account may act as a driver at all.
    ///
    /// # Errors
    ///
    /// [`DispatchError::RoleRequired`] or [`DispatchError::Permission`] when
    /// the driver role, approval or KYC verification is missing.
    pub fn ensure_can_drive(&self) -> Result<(), DispatchError> {
        self.ensure_role(Role::Driver)?;
        if !self.approved {
            return Err(DispatchError::permission(format!(
                "driver {} is not approved",
                self.id
            )));
        }
        if !self.kyc_verified {
            return Err(DispatchError::permission(format!(
                "driver {} has not completed KYC",
                self.id
            )));
        }
        Ok(())
    }

    /// Whether the account's vehicle and gender fit `category`.
    #[must_use]
    pub fn can_serve(&self, category: VehicleCategory) -> bool {
        let vehicle_matches = self.vehicle_category == Some(category);
        let gender_matches = category
            .required_driver_gender()
            .is_none_or(|required| self.gender == Some(required));
        vehicle_matches && gender_matches
    }

    /// Fails unless the driver can serve `category`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Permission`] naming the mismatch.
    pub fn ensure_can_serve(&self, category: VehicleCategory) -> Result<(), DispatchError> {
        if self.can_serve(category) {
            Ok(())
        } else {
            Err(DispatchError::permission(format!(
                "driver {} cannot serve {category} requests",
                self.id
            )))
        }
    }
}
