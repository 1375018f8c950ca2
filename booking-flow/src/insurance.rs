use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{FlowError, Result, ServiceErrorCode};
use crate::money::cents_eq;
use crate::trip::TripParameters;

/// A coverage premium bound to the item value and trip it was requested
/// for. The manager re-quotes whenever the bound item value changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsuranceQuote {
    pub offer_id: String,
    pub quote_id: String,
    pub premium: f64,
    pub currency: String,
    pub item_value: f64,
}

/// Whether coverage is applied to the fare, plus the last successfully
/// fetched quote. The quote survives toggle-off but is never applied to a
/// price while `included` is false.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageSelection {
    pub included: bool,
    pub quote: Option<InsuranceQuote>,
}

impl CoverageSelection {
    /// Premium to fold into the fare: 0 unless coverage is on and a quote
    /// exists.
    pub fn applied_premium(&self) -> f64 {
        if self.included {
            self.quote.as_ref().map(|q| q.premium).unwrap_or(0.0)
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct InsuranceQuoteRequest {
    pub trip: TripParameters,
    pub item_value: f64,
    pub user_email: String,
}

/// External insurance quoting service.
#[async_trait]
pub trait InsuranceService: Send + Sync {
    async fn fetch_quote(&self, request: &InsuranceQuoteRequest) -> Result<InsuranceQuote>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireInsuranceRequest<'a> {
    vehicle_type: crate::trip::VehicleType,
    distance: f64,
    item_value: f64,
    origin: [f64; 2],
    destination: [f64; 2],
    user_email: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInsuranceOffer {
    offer_id: String,
    quote_id: String,
    premium: f64,
    currency: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInsuranceResponse {
    success: bool,
    #[serde(default)]
    insurance: Option<WireInsuranceOffer>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for the insurance quoting service.
pub struct HttpInsuranceService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpInsuranceService {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl InsuranceService for HttpInsuranceService {
    async fn fetch_quote(&self, request: &InsuranceQuoteRequest) -> Result<InsuranceQuote> {
        let wire = WireInsuranceRequest {
            vehicle_type: request.trip.vehicle_type,
            distance: request.trip.distance_miles,
            item_value: request.item_value,
            origin: [request.trip.pickup.lat, request.trip.pickup.lng],
            destination: [request.trip.dropoff.lat, request.trip.dropoff.lng],
            user_email: &request.user_email,
        };

        let response = self
            .client
            .post(format!("{}/insurance-quote", self.base_url))
            .json(&wire)
            .send()
            .await
            .map_err(|e| FlowError::InsuranceUnavailable {
                code: ServiceErrorCode::InsuranceUnavailable,
                message: e.to_string(),
            })?;

        let body: WireInsuranceResponse =
            response
                .json()
                .await
                .map_err(|e| FlowError::InsuranceUnavailable {
                    code: ServiceErrorCode::InsuranceUnavailable,
                    message: e.to_string(),
                })?;

        match (body.success, body.insurance) {
            (true, Some(offer)) => Ok(InsuranceQuote {
                offer_id: offer.offer_id,
                quote_id: offer.quote_id,
                premium: offer.premium,
                currency: offer.currency,
                item_value: request.item_value,
            }),
            _ => Err(FlowError::InsuranceUnavailable {
                code: ServiceErrorCode::from_wire(body.code.as_deref()),
                message: body
                    .error
                    .unwrap_or_else(|| "insurance quote failed".to_string()),
            }),
        }
    }
}

/// Quote lifecycle for one booking draft.
#[derive(Debug, Clone, PartialEq)]
pub enum QuoteState {
    Idle,
    Loading,
    Ready(InsuranceQuote),
    Error {
        code: ServiceErrorCode,
        message: String,
    },
}

/// Owns the coverage toggle and the quote cache for a single booking draft.
///
/// State machine: `Idle -> Loading -> Ready | Error`, with `Error ->
/// Loading` only via explicit retry. Toggling coverage off does not
/// transition state; it only stops the cached quote from being applied.
pub struct InsuranceQuoteManager {
    service: Arc<dyn InsuranceService>,
    state: QuoteState,
    included: bool,
}

impl InsuranceQuoteManager {
    pub fn new(service: Arc<dyn InsuranceService>) -> Self {
        Self {
            service,
            state: QuoteState::Idle,
            included: false,
        }
    }

    pub fn state(&self) -> &QuoteState {
        &self.state
    }

    pub fn included(&self) -> bool {
        self.included
    }

    /// Enable coverage. Reuses the cached quote when one is ready for the
    /// same item value; otherwise fetches a fresh one. From the `Error`
    /// state this returns the stored error without a network call: leaving
    /// `Error` takes an explicit [`retry`](Self::retry).
    pub async fn enable(&mut self, request: &InsuranceQuoteRequest) -> Result<()> {
        self.included = true;
        match &self.state {
            QuoteState::Ready(quote) if cents_eq(quote.item_value, request.item_value) => {
                info!(quote_id = %quote.quote_id, "reusing cached insurance quote");
                Ok(())
            }
            QuoteState::Ready(quote) => {
                info!(
                    cached_value = quote.item_value,
                    new_value = request.item_value,
                    "item value changed, re-quoting coverage"
                );
                self.fetch(request).await
            }
            QuoteState::Error { code, message } => Err(FlowError::InsuranceUnavailable {
                code: *code,
                message: message.clone(),
            }),
            QuoteState::Idle | QuoteState::Loading => self.fetch(request).await,
        }
    }

    /// Turn coverage off. Keeps the cached quote; it simply stops being
    /// applied to the fare.
    pub fn disable(&mut self) {
        self.included = false;
    }

    /// Explicit user retry. Only meaningful from the `Error` state.
    pub async fn retry(&mut self, request: &InsuranceQuoteRequest) -> Result<()> {
        match self.state {
            QuoteState::Error { .. } => self.fetch(request).await,
            _ => Ok(()),
        }
    }

    async fn fetch(&mut self, request: &InsuranceQuoteRequest) -> Result<()> {
        self.state = QuoteState::Loading;
        match self.service.fetch_quote(request).await {
            Ok(quote) => {
                info!(quote_id = %quote.quote_id, premium = quote.premium, "insurance quote ready");
                self.state = QuoteState::Ready(quote);
                Ok(())
            }
            Err(FlowError::InsuranceUnavailable { code, message }) => {
                warn!(%code, %message, "insurance quote failed");
                self.state = QuoteState::Error {
                    code,
                    message: message.clone(),
                };
                Err(FlowError::InsuranceUnavailable { code, message })
            }
            Err(other) => {
                self.state = QuoteState::Error {
                    code: ServiceErrorCode::Unclassified,
                    message: other.to_string(),
                };
                Err(other)
            }
        }
    }

    /// Coverage is mandatory when quoting fails: booking confirmation stays
    /// blocked while the manager is in `Error`.
    pub fn can_confirm(&self) -> bool {
        !matches!(self.state, QuoteState::Error { .. })
    }

    /// Value snapshot for the booking draft.
    pub fn selection(&self) -> CoverageSelection {
        let quote = match &self.state {
            QuoteState::Ready(q) => Some(q.clone()),
            _ => None,
        };
        CoverageSelection {
            included: self.included,
            quote,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trip::{VehicleType, test_trip};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingInsuranceService {
        calls: AtomicU32,
        fail_with: Option<ServiceErrorCode>,
    }

    impl CountingInsuranceService {
        fn ok() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_with: None,
            }
        }

        fn failing(code: ServiceErrorCode) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_with: Some(code),
            }
        }
    }

    #[async_trait]
    impl InsuranceService for CountingInsuranceService {
        async fn fetch_quote(&self, request: &InsuranceQuoteRequest) -> Result<InsuranceQuote> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(code) = self.fail_with {
                return Err(FlowError::InsuranceUnavailable {
                    code,
                    message: "quote rejected".to_string(),
                });
            }
            Ok(InsuranceQuote {
                offer_id: "offer-1".to_string(),
                quote_id: "quote-1".to_string(),
                premium: 12.50,
                currency: "usd".to_string(),
                item_value: request.item_value,
            })
        }
    }

    fn request(item_value: f64) -> InsuranceQuoteRequest {
        InsuranceQuoteRequest {
            trip: test_trip(10.0, VehicleType::CargoVan),
            item_value,
            user_email: "customer@example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn toggle_off_and_on_reuses_cached_quote() {
        let service = Arc::new(CountingInsuranceService::ok());
        let mut manager = InsuranceQuoteManager::new(service.clone());

        manager.enable(&request(500.0)).await.unwrap();
        assert!(matches!(manager.state(), QuoteState::Ready(_)));
        assert_eq!(manager.selection().applied_premium(), 12.50);

        manager.disable();
        assert!(matches!(manager.state(), QuoteState::Ready(_)));
        assert_eq!(manager.selection().applied_premium(), 0.0);

        manager.enable(&request(500.0)).await.unwrap();
        assert_eq!(manager.selection().applied_premium(), 12.50);

        // One network request total.
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn changed_item_value_forces_requote() {
        let service = Arc::new(CountingInsuranceService::ok());
        let mut manager = InsuranceQuoteManager::new(service.clone());

        manager.enable(&request(500.0)).await.unwrap();
        manager.disable();
        manager.enable(&request(900.0)).await.unwrap();

        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
        match manager.state() {
            QuoteState::Ready(quote) => assert_eq!(quote.item_value, 900.0),
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_state_blocks_confirmation_until_retry() {
        let service = Arc::new(CountingInsuranceService::failing(
            ServiceErrorCode::ItemValueRequired,
        ));
        let mut manager = InsuranceQuoteManager::new(service.clone());

        let err = manager.enable(&request(0.0)).await.unwrap_err();
        assert!(matches!(
            err,
            FlowError::InsuranceUnavailable {
                code: ServiceErrorCode::ItemValueRequired,
                ..
            }
        ));
        assert!(!manager.can_confirm());
        assert_eq!(manager.selection().applied_premium(), 0.0);

        // Re-enabling does not leave Error and does not re-fetch; only an
        // explicit retry does.
        let _ = manager.enable(&request(0.0)).await.unwrap_err();
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);

        // Retry from error transitions back through Loading.
        let ok_service = Arc::new(CountingInsuranceService::ok());
        let mut recovered = InsuranceQuoteManager::new(ok_service);
        recovered.state = QuoteState::Error {
            code: ServiceErrorCode::InsuranceUnavailable,
            message: "down".to_string(),
        };
        recovered.included = true;
        recovered.retry(&request(500.0)).await.unwrap();
        assert!(recovered.can_confirm());
    }

    #[tokio::test]
    async fn retry_is_a_noop_outside_error_state() {
        let service = Arc::new(CountingInsuranceService::ok());
        let mut manager = InsuranceQuoteManager::new(service.clone());
        manager.enable(&request(500.0)).await.unwrap();

        manager.retry(&request(500.0)).await.unwrap();
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }
}
