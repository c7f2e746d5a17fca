//! Given-When-Then harness for the ride state machine.

#![allow(clippy::module_name_repetitions)] // TransitionTest is the natural name

use chrono::{DateTime, Utc};
use ride_dispatch_core::DispatchError;
use ride_dispatch_core::environment::Clock;
use ride_dispatch_core::machine::{RideCommand, RideStateMachine, Transition};
use ride_dispatch_core::notify::Notice;
use ride_dispatch_core::ride::RideRequest;
use ride_dispatch_core::types::Actor;

use crate::mocks::test_clock;

/// Type alias for ride assertion functions
type RideAssertion = Box<dyn FnOnce(&RideRequest)>;

/// Type alias for notice assertion functions
type NoticeAssertion = Box<dyn FnOnce(&[Notice])>;

/// Type alias for error assertion functions
type ErrorAssertion = Box<dyn FnOnce(&DispatchError, &RideRequest)>;

/// Fluent API for testing ride transitions with Given-When-Then syntax
///
/// # Example
///
/// ```
/// use ride_dispatch_testing::TransitionTest;
/// use ride_dispatch_testing::fixtures::sample_ride;
/// use ride_dispatch_core::machine::RideCommand;
/// use ride_dispatch_core::ride::RideStatus;
/// use ride_dispatch_core::types::{AccountId, Actor, VehicleCategory};
///
/// let rider = AccountId::new();
/// let driver = AccountId::new();
///
/// TransitionTest::new()
///     .given_ride(sample_ride(rider, VehicleCategory::Mini, 250))
///     .when(Actor::Driver(driver), RideCommand::Accept)
///     .then_ride(move |ride| {
///         assert_eq!(ride.status(), RideStatus::Accepted);
///         assert_eq!(ride.driver_id(), Some(driver));
///     })
///     .run();
/// ```
pub struct TransitionTest {
    machine: RideStateMachine,
    ride: Option<RideRequest>,
    steps: Vec<(Actor, RideCommand)>,
    command: Option<(Actor, RideCommand)>,
    now: DateTime<Utc>,
    ride_assertions: Vec<RideAssertion>,
    notice_assertions: Vec<NoticeAssertion>,
    settlement_due: Option<bool>,
    error_assertion: Option<ErrorAssertion>,
}

impl TransitionTest {
    /// Create a new transition test at the test clock's time
    #[must_use]
    pub fn new() -> Self {
        Self {
            machine: RideStateMachine::new(),
            ride: None,
            steps: Vec::new(),
            command: None,
            now: test_clock().now(),
            ride_assertions: Vec::new(),
            notice_assertions: Vec::new(),
            settlement_due: None,
            error_assertion: None,
        }
    }

    /// Set the starting ride (Given)
    #[must_use]
    pub fn given_ride(mut self, ride: RideRequest) -> Self {
        self.ride = Some(ride);
        self
    }

    /// Apply a command to reach the starting state; it must succeed (Given)
    #[must_use]
    pub fn given_step(mut self, actor: Actor, command: RideCommand) -> Self {
        self.steps.push((actor, command));
        self
    }

    /// Set the command under test (When)
    #[must_use]
    pub fn when(mut self, actor: Actor, command: RideCommand) -> Self {
        self.command = Some((actor, command));
        self
    }

    /// Time at which the command is applied
    #[must_use]
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Assert on the resulting ride (Then)
    #[must_use]
    pub fn then_ride<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&RideRequest) + 'static,
    {
        self.ride_assertions.push(Box::new(assertion));
        self
    }

    /// Assert on the emitted notices (Then)
    #[must_use]
    pub fn then_notices<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&[Notice]) + 'static,
    {
        self.notice_assertions.push(Box::new(assertion));
        self
    }

    /// Assert whether the transition requires settlement (Then)
    #[must_use]
    pub fn then_settlement_due(mut self, due: bool) -> Self {
        self.settlement_due = Some(due);
        self
    }

    /// Expect the command to fail; the assertion also receives the
    /// unchanged ride (Then)
    #[must_use]
    pub fn then_error<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&DispatchError, &RideRequest) + 'static,
    {
        self.error_assertion = Some(Box::new(assertion));
        self
    }

    /// Run the test and execute all assertions
    ///
    /// # Panics
    ///
    /// Panics if the ride or command is not set, a given step fails, the
    /// outcome differs from the expectation, or any assertion fails.
    #[allow(clippy::panic)] // Test code can panic
    #[allow(clippy::expect_used)] // Test code can use expect
    pub fn run(self) {
        let mut ride = self.ride.expect("Ride must be set with given_ride()");
        let (actor, command) = self.command.expect("Command must be set with when()");

        for (step_actor, step_command) in self.steps {
            ride = self
                .machine
                .apply(&ride, &step_actor, step_command, self.now)
                .map(|transition| transition.ride)
                .unwrap_or_else(|error| panic!("given step failed: {error}"));
        }

        let outcome = self.machine.apply(&ride, &actor, command, self.now);

        match (outcome, self.error_assertion) {
            (Ok(transition), None) => check_transition(
                &transition,
                self.settlement_due,
                self.ride_assertions,
                self.notice_assertions,
            ),
            (Err(error), Some(assertion)) => assertion(&error, &ride),
            (Ok(transition), Some(_)) => {
                panic!("expected an error, got {:?}", transition.ride.status())
            },
            (Err(error), None) => panic!("expected success, got error: {error}"),
        }
    }
}

#[allow(clippy::panic)] // Test assertion
fn check_transition(
    transition: &Transition,
    settlement_due: Option<bool>,
    ride_assertions: Vec<RideAssertion>,
    notice_assertions: Vec<NoticeAssertion>,
) {
    if let Some(due) = settlement_due {
        assert_eq!(transition.settlement_due, due, "settlement_due mismatch");
    }
    for assertion in ride_assertions {
        assertion(&transition.ride);
    }
    for assertion in notice_assertions {
        assertion(&transition.notices);
    }
}

impl Default for TransitionTest {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{SAMPLE_CODE, sample_ride};
    use ride_dispatch_core::ride::RideStatus;
    use ride_dispatch_core::types::{AccountId, VehicleCategory};

    #[test]
    fn arrival_then_start_with_the_right_code() {
        let driver = AccountId::new();
        TransitionTest::new()
            .given_ride(sample_ride(AccountId::new(), VehicleCategory::Auto, 120))
            .given_step(Actor::Driver(driver), RideCommand::Accept)
            .given_step(Actor::Driver(driver), RideCommand::MarkArrived)
            .when(
                Actor::Driver(driver),
                RideCommand::StartTrip {
                    code: SAMPLE_CODE.to_string(),
                },
            )
            .then_ride(|ride| assert_eq!(ride.status(), RideStatus::Started))
            .then_notices(|notices| assert_eq!(notices.len(), 1))
            .then_settlement_due(false)
            .run();
    }

    #[test]
    fn wrong_code_keeps_the_ride_arrived() {
        let driver = AccountId::new();
        TransitionTest::new()
            .given_ride(sample_ride(AccountId::new(), VehicleCategory::Auto, 120))
            .given_step(Actor::Driver(driver), RideCommand::Accept)
            .given_step(Actor::Driver(driver), RideCommand::MarkArrived)
            .when(
                Actor::Driver(driver),
                RideCommand::StartTrip {
                    code: "111111".to_string(),
                },
            )
            .then_error(|error, ride| {
                assert!(matches!(error, DispatchError::TripCodeMismatch(_)));
                assert_eq!(ride.status(), RideStatus::Arrived);
            })
            .run();
    }

    #[test]
    fn cash_end_trip_requires_settlement() {
        let driver = AccountId::new();
        TransitionTest::new()
            .given_ride(sample_ride(AccountId::new(), VehicleCategory::Auto, 120))
            .given_step(Actor::Driver(driver), RideCommand::Accept)
            .given_step(Actor::Driver(driver), RideCommand::MarkArrived)
            .given_step(
                Actor::Driver(driver),
                RideCommand::StartTrip {
                    code: SAMPLE_CODE.to_string(),
                },
            )
            .when(Actor::Driver(driver), RideCommand::EndTrip)
            .then_settlement_due(true)
            .then_ride(|ride| assert_eq!(ride.status(), RideStatus::Completed))
            .run();
    }
}
