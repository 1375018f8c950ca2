use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{FlowError, Result};
use crate::fare::{FareBreakdown, static_rates};
use crate::trip::{TripParameters, VehicleType};

/// Per-vehicle fares for one trip, as resolved by the pricing service (or
/// the static estimate table when the service is unreachable).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FareSheet {
    pub prices: HashMap<VehicleType, FareBreakdown>,
    pub distance_miles: f64,
    pub estimated_minutes: f64,
    /// True when these are static estimates, not live prices. The UI labels
    /// them accordingly and must re-quote before charging.
    pub degraded: bool,
}

impl FareSheet {
    pub fn fare_for(&self, vehicle: VehicleType) -> Option<&FareBreakdown> {
        self.prices.get(&vehicle)
    }
}

/// External pricing service. Stateless; one request per quote.
#[async_trait]
pub trait PricingService: Send + Sync {
    async fn fetch_prices(
        &self,
        trip: &TripParameters,
        vehicles: &[VehicleType],
    ) -> Result<FareSheet>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WirePricingRequest<'a> {
    vehicle_types: &'a [VehicleType],
    pickup_coords: [f64; 2],
    dropoff_coords: [f64; 2],
    help_needed: bool,
    item_weight: crate::trip::WeightClass,
    time_of_day: u8,
    day_of_week: crate::trip::DayOfWeek,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFare {
    base_fare: f64,
    mileage_charge: f64,
    service_fee: f64,
    #[serde(default)]
    surge_multiplier: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePricingResponse {
    success: bool,
    #[serde(default)]
    prices: HashMap<VehicleType, WireFare>,
    #[serde(default)]
    distance: f64,
    #[serde(default)]
    estimated_time: f64,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for the pricing service.
pub struct HttpPricingService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPricingService {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PricingService for HttpPricingService {
    async fn fetch_prices(
        &self,
        trip: &TripParameters,
        vehicles: &[VehicleType],
    ) -> Result<FareSheet> {
        let request = WirePricingRequest {
            vehicle_types: vehicles,
            pickup_coords: [trip.pickup.lat, trip.pickup.lng],
            dropoff_coords: [trip.dropoff.lat, trip.dropoff.lng],
            help_needed: trip.help_needed,
            item_weight: trip.item_weight,
            time_of_day: trip.hour_of_day,
            day_of_week: trip.day_of_week,
        };

        let response = self
            .client
            .post(format!("{}/get-prices", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| FlowError::PricingUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FlowError::PricingUnavailable(format!(
                "pricing service returned {}",
                response.status()
            )));
        }

        let body: WirePricingResponse = response
            .json()
            .await
            .map_err(|e| FlowError::PricingUnavailable(e.to_string()))?;

        if !body.success {
            return Err(FlowError::PricingUnavailable(
                body.error.unwrap_or_else(|| "unknown pricing error".to_string()),
            ));
        }

        let prices = body
            .prices
            .into_iter()
            .map(|(vehicle, wire)| {
                let fare = FareBreakdown::compute(
                    wire.base_fare,
                    wire.mileage_charge,
                    wire.service_fee,
                    wire.surge_multiplier.unwrap_or(1.0),
                    // Coverage is priced separately by the insurance manager.
                    0.0,
                );
                (vehicle, fare)
            })
            .collect();

        Ok(FareSheet {
            prices,
            distance_miles: body.distance,
            estimated_minutes: body.estimated_time,
            degraded: false,
        })
    }
}

/// Caller-facing pricing entry point. Wraps a [`PricingService`] and owns
/// the degraded-mode fallback to the static estimate table. No automatic
/// retries: the caller re-invokes on user action.
pub struct PricingClient {
    service: Arc<dyn PricingService>,
}

impl PricingClient {
    pub fn new(service: Arc<dyn PricingService>) -> Self {
        Self { service }
    }

    /// Live prices, or a typed `PricingUnavailable` error.
    pub async fn quote(
        &self,
        trip: &TripParameters,
        vehicles: &[VehicleType],
    ) -> Result<FareSheet> {
        let sheet = self.service.fetch_prices(trip, vehicles).await?;
        info!(
            distance = sheet.distance_miles,
            vehicles = vehicles.len(),
            "fetched live prices"
        );
        Ok(sheet)
    }

    /// Live prices when available, otherwise the static estimate table.
    /// The returned sheet's `degraded` flag distinguishes the two; the
    /// fallback never blocks the user.
    pub async fn quote_or_fallback(
        &self,
        trip: &TripParameters,
        vehicles: &[VehicleType],
    ) -> FareSheet {
        match self.quote(trip, vehicles).await {
            Ok(sheet) => sheet,
            Err(e) => {
                warn!(error = %e, "pricing unavailable, falling back to static estimates");
                let prices = vehicles
                    .iter()
                    .map(|&v| (v, static_rates::estimate(v, trip.distance_miles)))
                    .collect();
                FareSheet {
                    prices,
                    distance_miles: trip.distance_miles,
                    estimated_minutes: trip.duration_minutes,
                    degraded: true,
                }
            }
        }
    }
}
