use serde::{Deserialize, Serialize};

use crate::money::round2;
use crate::trip::VehicleType;

/// Sales tax applied to the subtotal (base + mileage + service + coverage).
pub const TAX_RATE: f64 = 0.08;

/// Itemized price components for one vehicle type on one trip.
///
/// Fields are private: the only way to obtain a `FareBreakdown` is through
/// [`FareBreakdown::compute`], which derives tax and total from the
/// components. `total` is never stored independently of its inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FareBreakdown {
    base_fare: f64,
    mileage_charge: f64,
    service_fee: f64,
    surge_multiplier: f64,
    coverage_fee: f64,
    tax: f64,
    total: f64,
}

impl FareBreakdown {
    /// Build a breakdown from its components. `base_fare` and
    /// `mileage_charge` arrive with surge already applied by the pricing
    /// service; `surge_multiplier` is recorded for display only.
    pub fn compute(
        base_fare: f64,
        mileage_charge: f64,
        service_fee: f64,
        surge_multiplier: f64,
        coverage_fee: f64,
    ) -> Self {
        let surge_multiplier = surge_multiplier.max(1.0);
        let base_fare = round2(base_fare);
        let mileage_charge = round2(mileage_charge);
        let service_fee = round2(service_fee);
        let coverage_fee = round2(coverage_fee);
        let subtotal = base_fare + mileage_charge + service_fee + coverage_fee;
        let tax = round2(subtotal * TAX_RATE);
        let total = round2(subtotal + tax);
        Self {
            base_fare,
            mileage_charge,
            service_fee,
            surge_multiplier,
            coverage_fee,
            tax,
            total,
        }
    }

    /// Same components with a different coverage fee. Tax and total are
    /// recomputed; the original breakdown is untouched.
    pub fn with_coverage(&self, coverage_fee: f64) -> Self {
        Self::compute(
            self.base_fare,
            self.mileage_charge,
            self.service_fee,
            self.surge_multiplier,
            coverage_fee,
        )
    }

    pub fn base_fare(&self) -> f64 {
        self.base_fare
    }

    pub fn mileage_charge(&self) -> f64 {
        self.mileage_charge
    }

    pub fn service_fee(&self) -> f64 {
        self.service_fee
    }

    pub fn surge_multiplier(&self) -> f64 {
        self.surge_multiplier
    }

    pub fn coverage_fee(&self) -> f64 {
        self.coverage_fee
    }

    pub fn tax(&self) -> f64 {
        self.tax
    }

    pub fn total(&self) -> f64 {
        self.total
    }
}

/// Static estimate table used when the pricing service is unreachable.
/// These are published rack rates, not live prices; fares built from them
/// are flagged as degraded so the UI can label them as estimates.
pub mod static_rates {
    use super::*;

    pub const SERVICE_FEE: f64 = 5.99;

    pub const PICKUP_TRUCK_BASE: f64 = 45.00;
    pub const PICKUP_TRUCK_PER_MILE: f64 = 2.25;

    pub const CARGO_VAN_BASE: f64 = 65.00;
    pub const CARGO_VAN_PER_MILE: f64 = 2.75;

    /// Estimate for one vehicle type, no coverage, no surge.
    pub fn estimate(vehicle: VehicleType, distance_miles: f64) -> FareBreakdown {
        let (base, per_mile) = match vehicle {
            VehicleType::PickupTruck => (PICKUP_TRUCK_BASE, PICKUP_TRUCK_PER_MILE),
            VehicleType::CargoVan => (CARGO_VAN_BASE, CARGO_VAN_PER_MILE),
        };
        FareBreakdown::compute(base, per_mile * distance_miles, SERVICE_FEE, 1.0, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::cents_eq;

    #[test]
    fn total_equals_sum_of_components_plus_tax() {
        let fare = FareBreakdown::compute(45.0, 22.5, 5.99, 1.0, 12.50);
        let subtotal =
            fare.base_fare() + fare.mileage_charge() + fare.service_fee() + fare.coverage_fee();
        assert!(cents_eq(fare.tax(), round2(subtotal * TAX_RATE)));
        assert!(cents_eq(fare.total(), round2(subtotal + fare.tax())));
    }

    // Scenario: 10 mile Cargo Van trip with no coverage.
    #[test]
    fn cargo_van_ten_miles_no_coverage() {
        let fare = static_rates::estimate(VehicleType::CargoVan, 10.0);
        assert_eq!(fare.base_fare(), 65.00);
        assert_eq!(fare.mileage_charge(), 27.50);
        assert_eq!(fare.service_fee(), 5.99);
        assert_eq!(fare.coverage_fee(), 0.0);
        let subtotal = 65.00 + 27.50 + 5.99;
        assert!(cents_eq(fare.tax(), round2(subtotal * 0.08)));
        assert!(cents_eq(fare.total(), round2(subtotal + fare.tax())));
    }

    // Scenario: enabling coverage with a 12.50 premium adds it to the
    // subtotal before tax.
    #[test]
    fn coverage_premium_is_taxed_in_subtotal() {
        let without = FareBreakdown::compute(45.0, 22.5, 5.99, 1.0, 0.0);
        let with = without.with_coverage(12.50);
        assert_eq!(with.coverage_fee(), 12.50);
        let expected_subtotal = 45.0 + 22.5 + 5.99 + 12.50;
        assert!(cents_eq(with.tax(), round2(expected_subtotal * TAX_RATE)));
        assert!(cents_eq(
            with.total(),
            round2(expected_subtotal + with.tax())
        ));
        // Original untouched.
        assert_eq!(without.coverage_fee(), 0.0);
    }

    #[test]
    fn surge_floor_is_one() {
        let fare = FareBreakdown::compute(45.0, 10.0, 5.99, 0.4, 0.0);
        assert_eq!(fare.surge_multiplier(), 1.0);
    }
}
