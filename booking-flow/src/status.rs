use serde::{Deserialize, Serialize};

/// Delivery lifecycle, in order. The numeric index backs the monotonicity
/// check in the status poller: a fetched status with a lower index than one
/// already observed is a stale read and is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryStatus {
    Accepted,
    InProgress,
    ArrivedAtPickup,
    PickedUp,
    EnRouteToDropoff,
    ArrivedAtDropoff,
    Completed,
    Cancelled,
}

impl DeliveryStatus {
    pub fn index(&self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::InProgress => 1,
            Self::ArrivedAtPickup => 2,
            Self::PickedUp => 3,
            Self::EnRouteToDropoff => 4,
            Self::ArrivedAtDropoff => 5,
            Self::Completed => 6,
            // Cancellation can happen from any stage.
            Self::Cancelled => 7,
        }
    }

    /// No further transitions expected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Accepted => "Driver accepted",
            Self::InProgress => "Driver on the way",
            Self::ArrivedAtPickup => "Driver arrived at pickup",
            Self::PickedUp => "Item picked up",
            Self::EnRouteToDropoff => "En route to dropoff",
            Self::ArrivedAtDropoff => "Driver arrived at dropoff",
            Self::Completed => "Delivered",
            Self::Cancelled => "Cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_indices_are_strictly_increasing() {
        let order = [
            DeliveryStatus::Accepted,
            DeliveryStatus::InProgress,
            DeliveryStatus::ArrivedAtPickup,
            DeliveryStatus::PickedUp,
            DeliveryStatus::EnRouteToDropoff,
            DeliveryStatus::ArrivedAtDropoff,
            DeliveryStatus::Completed,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].index() < pair[1].index());
        }
    }

    #[test]
    fn terminal_states() {
        assert!(DeliveryStatus::Completed.is_terminal());
        assert!(DeliveryStatus::Cancelled.is_terminal());
        assert!(!DeliveryStatus::EnRouteToDropoff.is_terminal());
    }

    #[test]
    fn wire_format_is_camel_case() {
        let s = serde_json::to_string(&DeliveryStatus::EnRouteToDropoff).unwrap();
        assert_eq!(s, "\"enRouteToDropoff\"");
    }
}
