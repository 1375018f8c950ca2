use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::draft::{BookingDraft, CustomerRef, ItemSummary};
use crate::error::{FlowError, Result};
use crate::fare::FareBreakdown;
use crate::payment::PaymentTransaction;
use crate::status::DeliveryStatus;
use crate::storage::BookingStore;
use crate::trip::{GeoPoint, VehicleType};

/// Settled payment reference carried on a booking. A value copy of the
/// transaction's identifiers, not the transaction itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub transaction_id: Uuid,
    pub intent_id: String,
    pub amount: f64,
    pub currency: String,
}

/// Coverage bound to a booking, value-copied from the accepted quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsuranceRecord {
    pub offer_id: String,
    pub quote_id: String,
    pub premium: f64,
    pub currency: String,
}

/// The immutable, persisted record created after successful payment. Never
/// deleted; only its `status` field (and post-delivery feedback) changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub customer: CustomerRef,
    pub pickup: GeoPoint,
    pub pickup_address: String,
    pub dropoff: GeoPoint,
    pub dropoff_address: String,
    pub item: ItemSummary,
    pub vehicle_type: VehicleType,
    /// Snapshot taken at confirmation time. Later fare changes in the UI
    /// never reach a confirmed booking.
    pub fare: FareBreakdown,
    pub payment: PaymentRecord,
    pub insurance: Option<InsuranceRecord>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: DeliveryStatus,
    pub feedback: Option<DeliveryFeedback>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Post-delivery customer feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryFeedback {
    pub rating: u8,
    pub comment: Option<String>,
}

/// Pure combination step: draft + succeeded payment -> immutable booking.
/// Fails fast if payment has not settled; nothing partial is ever built.
pub fn assemble(draft: &BookingDraft, transaction: &PaymentTransaction) -> Result<Booking> {
    if !transaction.succeeded() {
        return Err(FlowError::PaymentNotSettled);
    }
    let intent_id = transaction
        .intent_id
        .clone()
        .ok_or(FlowError::PaymentNotSettled)?;

    // Value copies only: the persisted fare and quote are decoupled from
    // any live pricing or quote state still moving in the UI.
    let fare = draft.confirmation_fare()?;
    let coverage = draft.coverage();
    let insurance = if coverage.included {
        coverage.quote.as_ref().map(|quote| InsuranceRecord {
            offer_id: quote.offer_id.clone(),
            quote_id: quote.quote_id.clone(),
            premium: quote.premium,
            currency: quote.currency.clone(),
        })
    } else {
        None
    };

    let now = Utc::now();
    Ok(Booking {
        id: Uuid::new_v4(),
        customer: draft.customer.clone(),
        pickup: draft.trip.pickup,
        pickup_address: draft.pickup_address.clone(),
        dropoff: draft.trip.dropoff,
        dropoff_address: draft.dropoff_address.clone(),
        item: draft.item.clone(),
        vehicle_type: draft.trip.vehicle_type,
        fare,
        payment: PaymentRecord {
            transaction_id: transaction.id,
            intent_id,
            amount: transaction.amount,
            currency: transaction.currency.clone(),
        },
        insurance,
        scheduled_at: draft.scheduled_at,
        status: DeliveryStatus::Accepted,
        feedback: None,
        created_at: now,
        updated_at: now,
    })
}

/// Assembles and persists bookings. Submission happens exactly once per
/// draft; a persist failure after a successful payment is surfaced as
/// `BookingPersistFailed` and is never retried automatically, because money
/// has already moved.
pub struct BookingAssembler {
    store: Arc<dyn BookingStore>,
}

impl BookingAssembler {
    pub fn new(store: Arc<dyn BookingStore>) -> Self {
        Self { store }
    }

    pub async fn submit(
        &self,
        draft: &BookingDraft,
        transaction: &PaymentTransaction,
    ) -> Result<Uuid> {
        let booking = assemble(draft, transaction)?;
        let total = booking.fare.total();
        match self.store.save(booking).await {
            Ok(id) => {
                info!(booking_id = %id, total, "booking persisted");
                Ok(id)
            }
            Err(e) => {
                error!(draft_id = %draft.id, error = %e, "booking persist failed after successful payment");
                Err(FlowError::BookingPersistFailed(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::test_draft;
    use crate::insurance::{CoverageSelection, InsuranceQuote};
    use crate::payment::{PaymentMethodRef, PaymentState};
    use crate::pricing::FareSheet;
    use crate::storage::InMemoryBookingStore;
    use std::collections::HashMap;

    fn priced_draft() -> BookingDraft {
        let mut draft = test_draft();
        let mut prices = HashMap::new();
        prices.insert(
            VehicleType::CargoVan,
            FareBreakdown::compute(65.0, 27.5, 5.99, 1.0, 0.0),
        );
        draft
            .apply_fares(FareSheet {
                prices,
                distance_miles: 10.0,
                estimated_minutes: 30.0,
                degraded: false,
            })
            .unwrap();
        draft
    }

    fn settled_transaction(amount: f64) -> PaymentTransaction {
        PaymentTransaction {
            id: Uuid::new_v4(),
            state: PaymentState::Succeeded,
            intent_id: Some("pi_42".to_string()),
            client_secret: Some("pi_42_secret".to_string()),
            method: Some(PaymentMethodRef {
                id: "pm_123".to_string(),
                label: "Visa •••• 4242".to_string(),
            }),
            amount,
            currency: "usd".to_string(),
            last_error: None,
            retry_count: 0,
        }
    }

    #[test]
    fn assembly_requires_settled_payment() {
        let draft = priced_draft();
        let mut tx = settled_transaction(106.37);
        tx.state = PaymentState::Failed;
        assert!(matches!(
            assemble(&draft, &tx),
            Err(FlowError::PaymentNotSettled)
        ));
    }

    #[test]
    fn booking_snapshots_fare_and_quote_by_value() {
        let mut draft = priced_draft();
        draft
            .apply_coverage(CoverageSelection {
                included: true,
                quote: Some(InsuranceQuote {
                    offer_id: "offer-1".to_string(),
                    quote_id: "quote-1".to_string(),
                    premium: 12.50,
                    currency: "usd".to_string(),
                    item_value: 500.0,
                }),
            })
            .unwrap();

        let booking = assemble(&draft, &settled_transaction(119.87)).unwrap();
        assert_eq!(booking.fare.coverage_fee(), 12.50);
        assert_eq!(booking.insurance.as_ref().unwrap().quote_id, "quote-1");
        assert_eq!(booking.status, DeliveryStatus::Accepted);

        // Mutating the draft afterwards does not touch the booking.
        let snapshot_total = booking.fare.total();
        draft
            .apply_coverage(CoverageSelection {
                included: false,
                quote: None,
            })
            .unwrap();
        assert_eq!(booking.fare.total(), snapshot_total);
    }

    #[test]
    fn coverage_excluded_leaves_no_insurance_record() {
        let mut draft = priced_draft();
        draft
            .apply_coverage(CoverageSelection {
                included: false,
                quote: Some(InsuranceQuote {
                    offer_id: "offer-1".to_string(),
                    quote_id: "quote-1".to_string(),
                    premium: 12.50,
                    currency: "usd".to_string(),
                    item_value: 500.0,
                }),
            })
            .unwrap();

        let booking = assemble(&draft, &settled_transaction(106.37)).unwrap();
        assert!(booking.insurance.is_none());
        assert_eq!(booking.fare.coverage_fee(), 0.0);
    }

    #[tokio::test]
    async fn submit_persists_once_and_returns_store_id() {
        let store = Arc::new(InMemoryBookingStore::new());
        let assembler = BookingAssembler::new(store.clone());
        let draft = priced_draft();

        let id = assembler
            .submit(&draft, &settled_transaction(106.37))
            .await
            .unwrap();
        let fetched = store.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.vehicle_type, VehicleType::CargoVan);
    }
}
