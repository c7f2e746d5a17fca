//! The ride state machine.
//!
//! [`RideStateMachine::apply`] is a pure function from the current ride, the
//! acting party and a command to the next ride. It never performs I/O; the
//! runtime commits the returned [`Transition`] with the revision it read, so
//! a transition computed from a stale ride can never land.
//!
//! Legal edges:
//!
//! ```text
//! SEARCHING -> ACCEPTED -> ARRIVED -> STARTED -> COMPLETED
//!                                        \-> PAYMENT_PENDING -> COMPLETED
//! SEARCHING | ACCEPTED | ARRIVED -> CANCELLED
//! ```
//!
//! The status is checked before the caller, so a driver who lost a race sees
//! "already accepted" rather than a permission error.

use crate::error::DispatchError;
use crate::notify::Notice;
use crate::ride::{Assignment, Cancellation, CancelledBy, Rating, RidePhase, RideRequest};
use crate::types::Actor;
use chrono::{DateTime, Utc};
use smallvec::{SmallVec, smallvec};

/// Longest cancellation reason accepted, in characters.
pub const MAX_REASON_LEN: usize = 280;

/// A request to move a ride along.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RideCommand {
    /// Driver claims a `SEARCHING` request.
    Accept,
    /// Assigned driver reached the pickup.
    MarkArrived,
    /// Assigned driver starts the trip with the rider's code.
    StartTrip {
        /// Code the rider read out
        code: String,
    },
    /// Assigned driver ends the trip.
    EndTrip,
    /// Payment captured for a `PAYMENT_PENDING` ride.
    ConfirmPayment,
    /// Rider withdraws a request that is still `SEARCHING`.
    CancelSearch {
        /// Optional reason
        reason: Option<String>,
    },
    /// Rider or assigned driver cancels an accepted ride.
    CancelTrip {
        /// Why; required once a driver is assigned
        reason: String,
    },
}

impl RideCommand {
    /// Name used in errors and logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::MarkArrived => "mark arrived",
            Self::StartTrip { .. } => "start",
            Self::EndTrip => "end",
            Self::ConfirmPayment => "confirm payment for",
            Self::CancelSearch { .. } => "cancel search for",
            Self::CancelTrip { .. } => "cancel",
        }
    }
}

/// Result of a legal command.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    /// Ride after the command
    pub ride: RideRequest,
    /// Driver payout and trip count must be committed with this ride
    pub settlement_due: bool,
    /// Notices to send once the ride is committed
    pub notices: SmallVec<[Notice; 2]>,
}

impl Transition {
    fn quiet(ride: RideRequest) -> Self {
        Self {
            ride,
            settlement_due: false,
            notices: SmallVec::new(),
        }
    }

    fn with_notice(ride: RideRequest, notice: Notice) -> Self {
        Self {
            ride,
            settlement_due: false,
            notices: smallvec![notice],
        }
    }
}

/// Validates and applies ride transitions.
#[derive(Clone, Copy, Debug, Default)]
pub struct RideStateMachine;

impl RideStateMachine {
    /// Creates the state machine
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Apply `command` issued by `actor` to `ride` at `now`.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::InvalidTransition`] when the status does not allow
    ///   the command (including any command on a terminal ride)
    /// - [`DispatchError::NotAssignedDriver`], [`DispatchError::NotRider`] or
    ///   [`DispatchError::Permission`] when the actor may not issue it
    /// - [`DispatchError::TripCodeMismatch`] for a wrong start code
    /// - [`DispatchError::Validation`] for a missing cancellation reason
    pub fn apply(
        &self,
        ride: &RideRequest,
        actor: &Actor,
        command: RideCommand,
        now: DateTime<Utc>,
    ) -> Result<Transition, DispatchError> {
        let invalid = |command: &RideCommand| DispatchError::InvalidTransition {
            ride_id: ride.id,
            status: ride.status(),
            command: command.name(),
        };

        match (&ride.phase, &command) {
            (RidePhase::Searching, RideCommand::Accept) => accept(ride, actor, now),

            (RidePhase::Accepted { assignment }, RideCommand::MarkArrived) => {
                ensure_assigned_driver(ride, assignment, actor)?;
                let next = ride_with(
                    ride,
                    RidePhase::Arrived {
                        assignment: *assignment,
                        arrived_at: now,
                    },
                );
                Ok(Transition::with_notice(
                    next,
                    Notice::DriverArrived {
                        ride_id: ride.id,
                        rider_id: ride.rider_id,
                    },
                ))
            },

            (
                RidePhase::Arrived {
                    assignment,
                    arrived_at,
                },
                RideCommand::StartTrip { code },
            ) => {
                ensure_assigned_driver(ride, assignment, actor)?;
                if !ride.trip_code.matches(code) {
                    return Err(DispatchError::TripCodeMismatch(ride.id));
                }
                let next = ride_with(
                    ride,
                    RidePhase::Started {
                        assignment: *assignment,
                        arrived_at: *arrived_at,
                        started_at: now,
                    },
                );
                Ok(Transition::with_notice(
                    next,
                    Notice::TripStarted {
                        ride_id: ride.id,
                        rider_id: ride.rider_id,
                    },
                ))
            },

            (
                RidePhase::Started {
                    assignment,
                    arrived_at,
                    started_at,
                },
                RideCommand::EndTrip,
            ) => {
                ensure_assigned_driver(ride, assignment, actor)?;
                if ride.payment_method.requires_online_capture() {
                    let next = ride_with(
                        ride,
                        RidePhase::PaymentPending {
                            assignment: *assignment,
                            arrived_at: *arrived_at,
                            started_at: *started_at,
                            ended_at: now,
                        },
                    );
                    Ok(Transition::with_notice(
                        next,
                        Notice::PaymentRequested {
                            ride_id: ride.id,
                            rider_id: ride.rider_id,
                            amount: ride.fare,
                        },
                    ))
                } else {
                    Ok(complete(ride, *assignment, *arrived_at, *started_at, now, now))
                }
            },

            (
                RidePhase::PaymentPending {
                    assignment,
                    arrived_at,
                    started_at,
                    ended_at,
                },
                RideCommand::ConfirmPayment,
            ) => {
                if *actor != Actor::System {
                    ensure_assigned_driver(ride, assignment, actor)?;
                }
                Ok(complete(ride, *assignment, *arrived_at, *started_at, *ended_at, now))
            },

            (RidePhase::Searching, RideCommand::CancelSearch { reason }) => {
                cancel_search(ride, actor, reason.as_deref(), now)
            },
            (RidePhase::Searching, RideCommand::CancelTrip { reason }) => {
                cancel_search(ride, actor, Some(reason.as_str()), now)
            },

            (RidePhase::Accepted { assignment }, RideCommand::CancelTrip { reason }) => {
                cancel_assigned(ride, assignment, None, actor, reason, now)
            },
            (
                RidePhase::Arrived {
                    assignment,
                    arrived_at,
                },
                RideCommand::CancelTrip { reason },
            ) => cancel_assigned(ride, assignment, Some(*arrived_at), actor, reason, now),

            (_, command) => Err(invalid(command)),
        }
    }

    /// Attach the rider's rating to a completed ride.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::InvalidTransition`] unless the ride is `COMPLETED`
    /// - [`DispatchError::NotRider`] unless `actor` is the ride's rider
    /// - [`DispatchError::Conflict`] if the ride was already rated
    pub fn rate(
        &self,
        ride: &RideRequest,
        actor: &Actor,
        rating: Rating,
    ) -> Result<RideRequest, DispatchError> {
        let RidePhase::Completed {
            assignment,
            arrived_at,
            started_at,
            ended_at,
            completed_at,
            rating: existing,
        } = &ride.phase
        else {
            return Err(DispatchError::InvalidTransition {
                ride_id: ride.id,
                status: ride.status(),
                command: "rate",
            });
        };

        ensure_rider(ride, actor)?;
        if existing.is_some() {
            return Err(DispatchError::conflict(format!(
                "ride {} has already been rated",
                ride.id
            )));
        }

        Ok(ride_with(
            ride,
            RidePhase::Completed {
                assignment: *assignment,
                arrived_at: *arrived_at,
                started_at: *started_at,
                ended_at: *ended_at,
                completed_at: *completed_at,
                rating: Some(rating),
            },
        ))
    }
}

fn ride_with(ride: &RideRequest, phase: RidePhase) -> RideRequest {
    RideRequest {
        phase,
        ..ride.clone()
    }
}

fn accept(ride: &RideRequest, actor: &Actor, now: DateTime<Utc>) -> Result<Transition, DispatchError> {
    let Actor::Driver(driver_id) = *actor else {
        return Err(DispatchError::permission(format!(
            "{actor} cannot accept rides"
        )));
    };
    if !ride.is_open_to(driver_id) {
        return Err(DispatchError::permission(format!(
            "ride {} was offered to another driver",
            ride.id
        )));
    }
    if driver_id == ride.rider_id {
        return Err(DispatchError::permission(
            "drivers cannot accept their own requests",
        ));
    }

    let next = ride_with(
        ride,
        RidePhase::Accepted {
            assignment: Assignment {
                driver_id,
                accepted_at: now,
            },
        },
    );
    Ok(Transition::with_notice(
        next,
        Notice::RideAccepted {
            ride_id: ride.id,
            rider_id: ride.rider_id,
            driver_id,
        },
    ))
}

fn complete(
    ride: &RideRequest,
    assignment: Assignment,
    arrived_at: DateTime<Utc>,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Transition {
    let next = ride_with(
        ride,
        RidePhase::Completed {
            assignment,
            arrived_at,
            started_at,
            ended_at,
            completed_at: now,
            rating: None,
        },
    );
    Transition {
        ride: next,
        settlement_due: true,
        notices: smallvec![Notice::TripCompleted {
            ride_id: ride.id,
            rider_id: ride.rider_id,
            fare: ride.fare,
        }],
    }
}

fn cancel_search(
    ride: &RideRequest,
    actor: &Actor,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Transition, DispatchError> {
    let by = match actor {
        Actor::System => CancelledBy::System,
        _ => {
            ensure_rider(ride, actor)?;
            CancelledBy::Rider
        },
    };
    let reason = normalize_reason(reason)?;
    let next = ride_with(
        ride,
        RidePhase::Cancelled {
            assignment: None,
            arrived_at: None,
            cancellation: Cancellation {
                by,
                reason,
                at: now,
            },
        },
    );

    Ok(match ride.target_driver_id {
        Some(recipient) => Transition::with_notice(
            next,
            Notice::RideCancelled {
                ride_id: ride.id,
                recipient,
                by,
            },
        ),
        None => Transition::quiet(next),
    })
}

fn cancel_assigned(
    ride: &RideRequest,
    assignment: &Assignment,
    arrived_at: Option<DateTime<Utc>>,
    actor: &Actor,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Transition, DispatchError> {
    let (by, recipient) = match *actor {
        Actor::Rider(id) if id == ride.rider_id => (CancelledBy::Rider, assignment.driver_id),
        Actor::Driver(id) if id == assignment.driver_id => (CancelledBy::Driver, ride.rider_id),
        Actor::Rider(id) => return Err(DispatchError::NotRider { ride_id: ride.id, actor: id }),
        Actor::Driver(id) => {
            return Err(DispatchError::NotAssignedDriver {
                ride_id: ride.id,
                actor: id,
            });
        },
        Actor::Admin(_) | Actor::System => {
            return Err(DispatchError::permission(format!(
                "{actor} cannot cancel an accepted ride"
            )));
        },
    };
    let Some(reason) = normalize_reason(Some(reason))? else {
        return Err(DispatchError::validation(
            "a reason is required to cancel an accepted ride",
        ));
    };

    let next = ride_with(
        ride,
        RidePhase::Cancelled {
            assignment: Some(*assignment),
            arrived_at,
            cancellation: Cancellation {
                by,
                reason: Some(reason),
                at: now,
            },
        },
    );
    Ok(Transition::with_notice(
        next,
        Notice::RideCancelled {
            ride_id: ride.id,
            recipient,
            by,
        },
    ))
}

fn normalize_reason(reason: Option<&str>) -> Result<Option<String>, DispatchError> {
    let Some(reason) = reason.map(str::trim).filter(|reason| !reason.is_empty()) else {
        return Ok(None);
    };
    if reason.chars().count() > MAX_REASON_LEN {
        return Err(DispatchError::validation(format!(
            "cancellation reason is longer than {MAX_REASON_LEN} characters"
        )));
    }
    Ok(Some(reason.to_string()))
}

fn ensure_assigned_driver(
    ride: &RideRequest,
    assignment: &Assignment,
    actor: &Actor,
) -> Result<(), DispatchError> {
    match *actor {
        Actor::Driver(id) if id == assignment.driver_id => Ok(()),
        _ => Err(not_assigned(ride, actor)),
    }
}

fn not_assigned(ride: &RideRequest, actor: &Actor) -> DispatchError {
    match actor.account_id() {
        Some(actor) => DispatchError::NotAssignedDriver {
            ride_id: ride.id,
            actor,
        },
        None => DispatchError::permission(format!(
            "only the assigned driver may advance ride {}",
            ride.id
        )),
    }
}

fn ensure_rider(ride: &RideRequest, actor: &Actor) -> Result<(), DispatchError> {
    match *actor {
        Actor::Rider(id) if id == ride.rider_id => Ok(()),
        Actor::Rider(id) | Actor::Driver(id) | Actor::Admin(id) => Err(DispatchError::NotRider {
            ride_id: ride.id,
            actor: id,
        }),
        Actor::System => Err(DispatchError::permission(format!(
            "only the rider may act on ride {}",
            ride.id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ride::{RideDraft, RideStatus, TripCode};
    use crate::types::{AccountId, GeoPoint, Location, PaymentMethod, RidePreferences, VehicleCategory};
    use chrono::TimeZone;

    const CODE: &str = "482913";

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 18, minute, 0)
            .single()
            .unwrap_or_default()
    }

    #[allow(clippy::expect_used)] // Panics: Test will fail if the code is malformed
    fn searching(payment_method: PaymentMethod) -> RideRequest {
        RideRequest::searching(
            RideDraft {
                rider_id: AccountId::new(),
                pickup: Location::new(GeoPoint::new(27.49, 77.67), "Holi Gate"),
                drop: Location::new(GeoPoint::new(27.50, 77.68), "Krishna Nagar"),
                category: VehicleCategory::Auto,
                fare: 250,
                payment_method,
                preferences: RidePreferences::default(),
                target_driver_id: None,
            },
            CODE.parse::<TripCode>().expect("valid code"),
            at(0),
        )
    }

    fn step(ride: &RideRequest, actor: Actor, command: RideCommand, minute: u32) -> Result<RideRequest, DispatchError> {
        RideStateMachine::new()
            .apply(ride, &actor, command, at(minute))
            .map(|transition| transition.ride)
    }

    /// Drives a ride to ARRIVED with a fresh driver.
    fn arrived(payment_method: PaymentMethod) -> (RideRequest, AccountId) {
        let driver = AccountId::new();
        let ride = searching(payment_method);
        let ride = step(&ride, Actor::Driver(driver), RideCommand::Accept, 1)
            .and_then(|ride| step(&ride, Actor::Driver(driver), RideCommand::MarkArrived, 5))
            .unwrap_or(ride);
        (ride, driver)
    }

    #[test]
    fn accept_assigns_the_driver_and_notifies_the_rider() {
        let ride = searching(PaymentMethod::Cash);
        let driver = AccountId::new();

        let transition = RideStateMachine::new().apply(&ride, &Actor::Driver(driver), RideCommand::Accept, at(1));

        let Ok(transition) = transition else {
            unreachable!("accept should succeed: {transition:?}");
        };
        assert_eq!(transition.ride.status(), RideStatus::Accepted);
        assert_eq!(transition.ride.driver_id(), Some(driver));
        assert!(!transition.settlement_due);
        assert_eq!(transition.notices[0].recipient(), Some(ride.rider_id));
    }

    #[test]
    fn second_accept_is_an_invalid_transition() {
        let ride = searching(PaymentMethod::Cash);
        let accepted = step(&ride, Actor::Driver(AccountId::new()), RideCommand::Accept, 1);

        let result = accepted.and_then(|ride| step(&ride, Actor::Driver(AccountId::new()), RideCommand::Accept, 2));
        assert!(matches!(result, Err(DispatchError::InvalidTransition { status: RideStatus::Accepted, .. })));
    }

    #[test]
    fn wrong_code_leaves_the_ride_arrived() {
        let (ride, driver) = arrived(PaymentMethod::Cash);
        let result = step(
            &ride,
            Actor::Driver(driver),
            RideCommand::StartTrip {
                code: "000000".into(),
            },
            6,
        );

        assert_eq!(result, Err(DispatchError::TripCodeMismatch(ride.id)));
        assert_eq!(ride.status(), RideStatus::Arrived);
    }

    #[test]
    fn only_the_assigned_driver_can_start() {
        let (ride, _) = arrived(PaymentMethod::Cash);
        let intruder = AccountId::new();
        let result = step(&ride, Actor::Driver(intruder), RideCommand::StartTrip { code: CODE.into() }, 6);

        assert_eq!(
            result,
            Err(DispatchError::NotAssignedDriver {
                ride_id: ride.id,
                actor: intruder
            })
        );
    }

    #[test]
    fn cash_trip_completes_with_settlement() {
        let (ride, driver) = arrived(PaymentMethod::Cash);
        let started = step(&ride, Actor::Driver(driver), RideCommand::StartTrip { code: CODE.into() }, 6);
        let transition = started.and_then(|ride| {
            RideStateMachine::new().apply(&ride, &Actor::Driver(driver), RideCommand::EndTrip, at(30))
        });

        assert!(transition.is_ok_and(|t| t.settlement_due && t.ride.status() == RideStatus::Completed));
    }

    #[test]
    fn upi_trip_waits_for_payment_then_completes() {
        let (ride, driver) = arrived(PaymentMethod::Upi);
        let pending = step(&ride, Actor::Driver(driver), RideCommand::StartTrip { code: CODE.into() }, 6)
            .and_then(|ride| step(&ride, Actor::Driver(driver), RideCommand::EndTrip, 30));
        assert!(matches!(&pending, Ok(ride) if ride.status() == RideStatus::PaymentPending));

        let transition = pending.and_then(|ride| {
            RideStateMachine::new().apply(&ride, &Actor::System, RideCommand::ConfirmPayment, at(31))
        });
        assert!(transition.is_ok_and(|t| t.settlement_due && t.ride.status() == RideStatus::Completed));
    }

    #[test]
    fn rider_cancels_while_searching() {
        let ride = searching(PaymentMethod::Cash);
        let cancelled = step(&ride, Actor::Rider(ride.rider_id), RideCommand::CancelSearch { reason: None }, 2);

        let Ok(cancelled) = cancelled else {
            unreachable!("cancel should succeed");
        };
        assert!(matches!(
            cancelled.phase,
            RidePhase::Cancelled {
                assignment: None,
                cancellation: Cancellation {
                    by: CancelledBy::Rider,
                    ..
                },
                ..
            }
        ));
        let late_accept = step(&cancelled, Actor::Driver(AccountId::new()), RideCommand::Accept, 3);
        assert!(matches!(late_accept, Err(DispatchError::InvalidTransition { .. })));
    }

    #[test]
    fn search_cancel_after_accept_is_rejected() {
        let (ride, _) = arrived(PaymentMethod::Cash);
        let result = step(&ride, Actor::Rider(ride.rider_id), RideCommand::CancelSearch { reason: None }, 6);
        assert!(matches!(result, Err(DispatchError::InvalidTransition { .. })));
    }

    #[test]
    fn cancel_after_accept_needs_a_reason() {
        let (ride, driver) = arrived(PaymentMethod::Cash);
        let blank = step(&ride, Actor::Driver(driver), RideCommand::CancelTrip { reason: "  ".into() }, 6);
        assert!(matches!(blank, Err(DispatchError::Validation(_))));

        let cancelled = step(
            &ride,
            Actor::Driver(driver),
            RideCommand::CancelTrip {
                reason: "rider unreachable".into(),
            },
            6,
        );
        assert!(cancelled.is_ok_and(|ride| ride.status() == RideStatus::Cancelled));
    }

    #[test]
    fn overlong_cancel_reasons_are_refused() {
        let (ride, driver) = arrived(PaymentMethod::Cash);
        let essay = "x".repeat(MAX_REASON_LEN + 1);

        let result = step(&ride, Actor::Driver(driver), RideCommand::CancelTrip { reason: essay }, 6);
        assert!(matches!(result, Err(DispatchError::Validation(_))));

        let at_limit = "x".repeat(MAX_REASON_LEN);
        let result = step(&ride, Actor::Driver(driver), RideCommand::CancelTrip { reason: at_limit }, 6);
        assert!(result.is_ok());
    }

    #[test]
    fn started_trip_cannot_be_cancelled() {
        let (ride, driver) = arrived(PaymentMethod::Cash);
        let result = step(&ride, Actor::Driver(driver), RideCommand::StartTrip { code: CODE.into() }, 6).and_then(|ride| {
            step(
                &ride,
                Actor::Rider(ride.rider_id),
                RideCommand::CancelTrip {
                    reason: "changed my mind".into(),
                },
                7,
            )
        });
        assert!(matches!(result, Err(DispatchError::InvalidTransition { status: RideStatus::Started, .. })));
    }

    #[test]
    fn rating_is_rider_only_and_once() {
        let (ride, driver) = arrived(PaymentMethod::Cash);
        let completed = step(&ride, Actor::Driver(driver), RideCommand::StartTrip { code: CODE.into() }, 6)
            .and_then(|ride| step(&ride, Actor::Driver(driver), RideCommand::EndTrip, 30));
        let Ok(completed) = completed else {
            unreachable!("trip should complete");
        };
        let Ok(five) = Rating::new(5) else {
            unreachable!("5 is a valid rating");
        };
        let machine = RideStateMachine::new();

        assert!(matches!(
            machine.rate(&completed, &Actor::Rider(driver), five),
            Err(DispatchError::NotRider { .. })
        ));
        let rated = machine.rate(&completed, &Actor::Rider(completed.rider_id), five);
        assert!(matches!(&rated, Ok(ride) if ride.rating() == Some(five)));
        let again = rated.and_then(|ride| machine.rate(&ride, &Actor::Rider(ride.rider_id), five));
        assert!(matches!(again, Err(DispatchError::Conflict(_))));
    }

    #[test]
    fn terminal_rides_reject_every_command() {
        let ride = searching(PaymentMethod::Cash);
        let Ok(cancelled) = step(&ride, Actor::System, RideCommand::CancelSearch { reason: Some("expired".into()) }, 10) else {
            unreachable!("system may expire searching rides");
        };
        for command in [RideCommand::Accept, RideCommand::MarkArrived, RideCommand::EndTrip, RideCommand::ConfirmPayment] {
            assert!(step(&cancelled, Actor::System, command, 11).is_err());
        }
    }
}
