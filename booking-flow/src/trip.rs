use serde::{Deserialize, Serialize};

/// WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    PickupTruck,
    CargoVan,
}

impl VehicleType {
    pub const ALL: [VehicleType; 2] = [VehicleType::PickupTruck, VehicleType::CargoVan];

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PickupTruck => "Pickup Truck",
            Self::CargoVan => "Cargo Van",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightClass {
    Light,
    Medium,
    Heavy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

/// Trip parameters the user confirmed before pricing. Immutable once a
/// pricing request has been issued: changing any of these means starting a
/// new booking draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripParameters {
    pub vehicle_type: VehicleType,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub distance_miles: f64,
    pub duration_minutes: f64,
    /// Local hour of day, 0-23. Feeds surge pricing on the service side.
    pub hour_of_day: u8,
    pub day_of_week: DayOfWeek,
    pub help_needed: bool,
    pub item_weight: WeightClass,
}

#[cfg(test)]
pub(crate) fn test_trip(distance_miles: f64, vehicle_type: VehicleType) -> TripParameters {
    TripParameters {
        vehicle_type,
        pickup: GeoPoint {
            lat: 34.0522,
            lng: -118.2437,
        },
        dropoff: GeoPoint {
            lat: 34.1015,
            lng: -118.3269,
        },
        distance_miles,
        duration_minutes: distance_miles * 3.0,
        hour_of_day: 14,
        day_of_week: DayOfWeek::Tuesday,
        help_needed: false,
        item_weight: WeightClass::Medium,
    }
}
