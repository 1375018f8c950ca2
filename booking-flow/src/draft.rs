use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FlowError, Result};
use crate::fare::FareBreakdown;
use crate::insurance::CoverageSelection;
use crate::pricing::FareSheet;
use crate::trip::TripParameters;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerRef {
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSummary {
    pub description: String,
    /// Declared value in currency units; required before coverage can be
    /// quoted.
    pub declared_value: Option<f64>,
}

/// Mutable in-progress booking state prior to payment success.
///
/// The draft is the single owner of the fare sheet and coverage selection:
/// only the pricing callback writes fares and only the insurance callback
/// writes coverage, each through the `apply_*` methods below. Once closed,
/// late-arriving results are rejected so an abandoned draft never
/// resurrects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingDraft {
    pub id: Uuid,
    pub customer: CustomerRef,
    pub trip: TripParameters,
    pub item: ItemSummary,
    pub pickup_address: String,
    pub dropoff_address: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    fares: Option<FareSheet>,
    coverage: CoverageSelection,
    closed: bool,
    pub created_at: DateTime<Utc>,
}

impl BookingDraft {
    pub fn new(
        customer: CustomerRef,
        trip: TripParameters,
        item: ItemSummary,
        pickup_address: impl Into<String>,
        dropoff_address: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer,
            trip,
            item,
            pickup_address: pickup_address.into(),
            dropoff_address: dropoff_address.into(),
            scheduled_at: None,
            fares: None,
            coverage: CoverageSelection {
                included: false,
                quote: None,
            },
            closed: false,
            created_at: Utc::now(),
        }
    }

    pub fn fares(&self) -> Option<&FareSheet> {
        self.fares.as_ref()
    }

    pub fn coverage(&self) -> &CoverageSelection {
        &self.coverage
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the draft. Pricing and insurance results that arrive after
    /// this point are discarded by the `apply_*` guards.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Pricing callback. The only writer of the fare sheet.
    pub fn apply_fares(&mut self, sheet: FareSheet) -> Result<()> {
        if self.closed {
            return Err(FlowError::DraftClosed);
        }
        self.fares = Some(sheet);
        Ok(())
    }

    /// Insurance callback. The only writer of the coverage selection.
    pub fn apply_coverage(&mut self, selection: CoverageSelection) -> Result<()> {
        if self.closed {
            return Err(FlowError::DraftClosed);
        }
        self.coverage = selection;
        Ok(())
    }

    /// The fare the customer will actually be charged: the selected
    /// vehicle's live fare with the applied coverage premium folded in.
    /// Degraded (static-estimate) sheets are never chargeable; the caller
    /// must re-quote first.
    pub fn confirmation_fare(&self) -> Result<FareBreakdown> {
        let sheet = self
            .fares
            .as_ref()
            .ok_or_else(|| FlowError::PricingUnavailable("no fare sheet on draft".to_string()))?;
        if sheet.degraded {
            return Err(FlowError::PricingUnavailable(
                "draft holds static estimates; live pricing required before payment".to_string(),
            ));
        }
        let fare = sheet.fare_for(self.trip.vehicle_type).ok_or_else(|| {
            FlowError::PricingUnavailable(format!(
                "no fare for vehicle type {:?}",
                self.trip.vehicle_type
            ))
        })?;
        Ok(fare.with_coverage(self.coverage.applied_premium()))
    }
}

#[cfg(test)]
pub(crate) fn test_draft() -> BookingDraft {
    use crate::trip::{VehicleType, test_trip};
    BookingDraft::new(
        CustomerRef {
            user_id: "user-1".to_string(),
            email: "customer@example.com".to_string(),
        },
        test_trip(10.0, VehicleType::CargoVan),
        ItemSummary {
            description: "3-seat sofa".to_string(),
            declared_value: Some(500.0),
        },
        "100 Main St",
        "200 Oak Ave",
    )
}
