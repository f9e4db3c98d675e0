//! Address lookup against an external geocoding service.
//!
//! Lookups are issued strictly one at a time. A failed lookup only drops
//! its own record.

use crate::types::{IncidentRecord, ResolvedLocation};
use geo::Point;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum GeocodeError {
    /// The service answered with something other than `OK`.
    #[error("geocoder returned status {0}")]
    Status(String),

    #[error("geocoder returned no results")]
    NoResults,

    #[error("geocoder request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

pub trait Geocoder {
    /// Resolves a free-text address to its first candidate position.
    fn lookup(&self, address: &str) -> impl Future<Output = Result<Point<f64>, GeocodeError>> + Send;
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    geometry: GeocodeGeometry,
}

#[derive(Debug, Deserialize)]
struct GeocodeGeometry {
    location: GeocodeLatLng,
}

#[derive(Debug, Deserialize)]
struct GeocodeLatLng {
    lat: f64,
    lng: f64,
}

impl GeocodeResponse {
    fn first_position(self) -> Result<Point<f64>, GeocodeError> {
        if self.status != "OK" {
            return Err(GeocodeError::Status(self.status));
        }
        self.results
            .into_iter()
            .next()
            .map(|r| Point::new(r.geometry.location.lng, r.geometry.location.lat))
            .ok_or(GeocodeError::NoResults)
    }
}

/// Client for the Google Geocoding JSON API, or anything that speaks the
/// same response shape.
#[derive(Clone)]
pub struct GoogleGeocoder {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl GoogleGeocoder {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

impl Geocoder for GoogleGeocoder {
    async fn lookup(&self, address: &str) -> Result<Point<f64>, GeocodeError> {
        let mut request = self.client.get(&self.endpoint).query(&[("address", address)]);
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key.as_str())]);
        }

        let response: GeocodeResponse = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response.first_position()
    }
}

/// A record the geocoder could not place.
#[derive(Debug, Clone, Serialize)]
pub struct Unresolved {
    pub address: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct Resolution {
    /// Successful lookups, in input order.
    pub located: Vec<ResolvedLocation>,
    pub unresolved: Vec<Unresolved>,
}

/// Geocodes every record in order, awaiting each lookup before issuing the
/// next. `delay` is slept after every request, successful or not.
pub async fn resolve_all<G, I>(geocoder: &G, records: I, delay: Option<Duration>) -> Resolution
where
    G: Geocoder + Sync,
    I: IntoIterator<Item = IncidentRecord>,
{
    let mut resolution = Resolution::default();

    for record in records {
        match geocoder.lookup(&record.address).await {
            Ok(position) => resolution.located.push(ResolvedLocation { position, record }),
            Err(e) => {
                warn!(address = %record.address, error = %e, "Geocoding failed");
                resolution.unresolved.push(Unresolved {
                    address: record.address,
                    reason: e.to_string(),
                });
            }
        }

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    info!(
        located = resolution.located.len(),
        unresolved = resolution.unresolved.len(),
        "Geocoding finished"
    );
    resolution
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory geocoder. Unknown addresses fail with `ZERO_RESULTS`.
    /// Addresses in `delays` take that long to answer; `max_in_flight`
    /// records the most lookups ever running at once.
    #[derive(Default)]
    pub(crate) struct FakeGeocoder {
        pub places: HashMap<String, Point<f64>>,
        pub delays: HashMap<String, Duration>,
        pub calls: Mutex<Vec<String>>,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl FakeGeocoder {
        pub fn with(places: &[(&str, f64, f64)]) -> Self {
            Self {
                places: places
                    .iter()
                    .map(|(a, lat, lng)| (a.to_string(), Point::new(*lng, *lat)))
                    .collect(),
                ..Self::default()
            }
        }

        pub fn slow(mut self, address: &str, delay: Duration) -> Self {
            self.delays.insert(address.to_string(), delay);
            self
        }
    }

    impl Geocoder for FakeGeocoder {
        async fn lookup(&self, address: &str) -> Result<Point<f64>, GeocodeError> {
            self.calls.lock().unwrap().push(address.to_string());
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            if let Some(delay) = self.delays.get(address) {
                tokio::time::sleep(*delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            self.places
                .get(address)
                .copied()
                .ok_or_else(|| GeocodeError::Status("ZERO_RESULTS".to_string()))
        }
    }

    fn record(address: &str) -> IncidentRecord {
        IncidentRecord {
            year: 2021,
            age: Some(10),
            address: address.to_string(),
            category: "Assault".to_string(),
            count: None,
        }
    }

    #[tokio::test]
    async fn one_failure_keeps_the_rest_in_order() {
        let geocoder = FakeGeocoder::with(&[("A", 12.0, 77.0), ("C", 13.0, 78.0), ("D", 14.0, 79.0)]);
        let records = vec![record("A"), record("B"), record("C"), record("D")];

        let resolution = resolve_all(&geocoder, records, None).await;

        let addresses: Vec<_> = resolution
            .located
            .iter()
            .map(|l| l.record.address.as_str())
            .collect();
        assert_eq!(addresses, vec!["A", "C", "D"]);
        assert_eq!(resolution.located[0].position, Point::new(77.0, 12.0));
        assert_eq!(resolution.unresolved.len(), 1);
        assert_eq!(resolution.unresolved[0].address, "B");
        assert_eq!(*geocoder.calls.lock().unwrap(), vec!["A", "B", "C", "D"]);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_applies_after_every_request() {
        let geocoder = FakeGeocoder::with(&[("A", 1.0, 1.0)]);
        let started = tokio::time::Instant::now();

        let resolution = resolve_all(
            &geocoder,
            vec![record("A"), record("missing")],
            Some(Duration::from_millis(200)),
        )
        .await;

        assert_eq!(resolution.located.len(), 1);
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn response_status_and_results_are_checked() {
        let ok: GeocodeResponse = serde_json::from_str(
            r#"{"status":"OK","results":[
                {"geometry":{"location":{"lat":12.97,"lng":77.59}}},
                {"geometry":{"location":{"lat":0.0,"lng":0.0}}}]}"#,
        )
        .unwrap();
        assert_eq!(ok.first_position().unwrap(), Point::new(77.59, 12.97));

        let denied: GeocodeResponse =
            serde_json::from_str(r#"{"status":"REQUEST_DENIED","results":[]}"#).unwrap();
        assert!(matches!(denied.first_position(), Err(GeocodeError::Status(s)) if s == "REQUEST_DENIED"));

        let empty: GeocodeResponse = serde_json::from_str(r#"{"status":"OK"}"#).unwrap();
        assert!(matches!(empty.first_position(), Err(GeocodeError::NoResults)));
    }
}
