//! Remote estimator reached over HTTP.
//!
//! `POST {url}` with `{"pickup": {"lat", "lng"}, "drop": {...}}`; the
//! response body is the fare table, keyed by category:
//!
//! ```json
//! { "MINI": { "amount": 180, "etaMinutes": 6 }, "AUTO": { "amount": 140, "etaMinutes": 4 } }
//! ```

use reqwest::Client;
use ride_dispatch_core::fare::{EstimatorError, FareEstimator, FareTable};
use ride_dispatch_core::types::GeoPoint;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

#[derive(Serialize)]
struct EstimateRequest {
    pickup: GeoPoint,
    drop: GeoPoint,
}

/// JSON-over-HTTP fare estimator.
#[derive(Clone, Debug)]
pub struct HttpFareEstimator {
    client: Client,
    url: String,
}

impl HttpFareEstimator {
    /// Estimator posting to `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), url)
    }

    /// Estimator sharing an existing client.
    #[must_use]
    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// Endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch(&self, pickup: GeoPoint, drop: GeoPoint) -> Result<FareTable, EstimatorError> {
        let response = self
            .client
            .post(&self.url)
            .json(&EstimateRequest { pickup, drop })
            .send()
            .await
            .map_err(|e| EstimatorError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EstimatorError::Unavailable(format!(
                "estimator returned {}: {body}",
                status.as_u16()
            )));
        }

        response
            .json::<FareTable>()
            .await
            .map_err(|e| EstimatorError::InvalidResponse(e.to_string()))
    }
}

impl FareEstimator for HttpFareEstimator {
    fn estimate(
        &self,
        pickup: GeoPoint,
        drop: GeoPoint,
    ) -> Pin<Box<dyn Future<Output = Result<FareTable, EstimatorError>> + Send + '_>> {
        Box::pin(self.fetch(pickup, drop))
    }
}
