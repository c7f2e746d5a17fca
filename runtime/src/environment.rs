//! Collaborators the engine is wired with.

use ride_dispatch_core::environment::{Clock, CodeGenerator};
use ride_dispatch_core::fare::FareEstimator;
use ride_dispatch_core::notify::{Notice, Notifier};
use ride_dispatch_core::store::RideStore;
use std::sync::Arc;

/// Everything that touches the outside world, behind trait objects so tests
/// swap in the in-memory store, a fixed clock and recording notifier.
#[derive(Clone)]
pub struct DispatchEnvironment {
    /// Rides, accounts and ledger
    pub store: Arc<dyn RideStore>,
    /// Fare/route estimation service
    pub estimator: Arc<dyn FareEstimator>,
    /// Fire-and-forget notifications
    pub notifier: Arc<dyn Notifier>,
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// One-time trip codes
    pub codes: Arc<dyn CodeGenerator>,
}

impl DispatchEnvironment {
    /// Send `notices` from a spawned task; failures are logged, never
    /// returned.
    pub fn notify_all(&self, notices: impl IntoIterator<Item = Notice>) {
        let notices: Vec<Notice> = notices.into_iter().collect();
        if notices.is_empty() {
            return;
        }

        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            for notice in notices {
                let kind = notice.kind();
                let ride_id = notice.ride_id();
                if let Err(error) = notifier.notify(notice).await {
                    tracing::warn!(%ride_id, kind, error = %error.0, "Notification failed");
                }
            }
        });
    }
}

impl std::fmt::Debug for DispatchEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEnvironment").finish_non_exhaustive()
    }
}
