//! Notifier that writes notices to the log.
//!
//! Used when no delivery system is wired in, e.g. by the demo binary.

use ride_dispatch_core::notify::{Notice, Notifier, NotifyError};
use std::future::Future;
use std::pin::Pin;

/// Logs each notice at `info`; SOS notices at `warn`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl LogNotifier {
    /// Create a notifier
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + '_>> {
        Box::pin(async move {
            let payload = serde_json::to_string(&notice).map_err(|e| NotifyError(e.to_string()))?;
            let recipient = notice.recipient().map(|id| id.to_string());
            if matches!(notice, Notice::Sos { .. }) {
                tracing::warn!(
                    ride_id = %notice.ride_id(),
                    payload = %payload,
                    "SOS raised"
                );
            } else {
                tracing::info!(
                    ride_id = %notice.ride_id(),
                    kind = notice.kind(),
                    recipient = recipient.as_deref().unwrap_or("-"),
                    payload = %payload,
                    "Notice"
                );
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ride_dispatch_core::types::{AccountId, RideId};

    #[tokio::test]
    async fn logging_never_fails() {
        let notice = Notice::DriverArrived {
            ride_id: RideId::new(),
            rider_id: AccountId::new(),
        };
        assert!(LogNotifier::new().notify(notice).await.is_ok());
    }
}
