use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Error codes returned by the insurance and payment services. The wire shape
/// is an ad hoc `{success: false, code, error}` object; it is mapped into this
/// enum at the boundary of every external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceErrorCode {
    InsuranceUnavailable,
    ItemValueRequired,
    InsuranceRequired,
    Unclassified,
}

impl ServiceErrorCode {
    pub fn from_wire(code: Option<&str>) -> Self {
        match code {
            Some("INSURANCE_UNAVAILABLE") => Self::InsuranceUnavailable,
            Some("ITEM_VALUE_REQUIRED") => Self::ItemValueRequired,
            Some("INSURANCE_REQUIRED") => Self::InsuranceRequired,
            _ => Self::Unclassified,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InsuranceUnavailable => "INSURANCE_UNAVAILABLE",
            Self::ItemValueRequired => "ITEM_VALUE_REQUIRED",
            Self::InsuranceRequired => "INSURANCE_REQUIRED",
            Self::Unclassified => "UNCLASSIFIED",
        }
    }
}

impl std::fmt::Display for ServiceErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error taxonomy for the booking pipeline.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("pricing service unavailable: {0}")]
    PricingUnavailable(String),

    #[error("insurance quote failed ({code}): {message}")]
    InsuranceUnavailable {
        code: ServiceErrorCode,
        message: String,
    },

    #[error("no payment method on file")]
    PaymentMethodMissing,

    #[error("payment intent creation failed ({code}): {message}")]
    PaymentIntentFailed {
        code: ServiceErrorCode,
        message: String,
    },

    #[error("payment confirmation failed: {0}")]
    PaymentConfirmationFailed(String),

    #[error("a payment attempt is already in flight for this draft")]
    PaymentInFlight,

    #[error("payment has not succeeded; booking cannot be assembled")]
    PaymentNotSettled,

    #[error("failed to persist booking: {0}")]
    BookingPersistFailed(String),

    #[error("failed to fetch delivery status: {0}")]
    StatusFetchFailed(String),

    #[error("booking draft is closed")]
    DraftClosed,

    #[error("booking not found: {0}")]
    BookingNotFound(Uuid),

    #[error("invalid charge amount: {0}")]
    InvalidAmount(f64),
}

impl FlowError {
    /// Specific, human-readable message for every fatal error in the
    /// pipeline. The UI must never show a generic technical string.
    pub fn user_message(&self) -> String {
        match self {
            Self::PricingUnavailable(_) => {
                "Live pricing is temporarily unavailable. Showing estimated rates.".to_string()
            }
            Self::InsuranceUnavailable { code, .. }
            | Self::PaymentIntentFailed { code, .. } => match code {
                ServiceErrorCode::ItemValueRequired => {
                    "Please enter your item's value so we can quote protection coverage."
                        .to_string()
                }
                ServiceErrorCode::InsuranceRequired => {
                    "Item protection is required for this delivery. Please add coverage before booking."
                        .to_string()
                }
                ServiceErrorCode::InsuranceUnavailable => {
                    "Item protection quoting is temporarily unavailable. Please try again."
                        .to_string()
                }
                ServiceErrorCode::Unclassified => {
                    "We couldn't process that request. Please try again.".to_string()
                }
            },
            Self::PaymentMethodMissing => {
                "Add a payment method to continue with your booking.".to_string()
            }
            Self::PaymentConfirmationFailed(_) => {
                "Your payment could not be confirmed. You can retry, use a different card, or cancel."
                    .to_string()
            }
            Self::PaymentInFlight => {
                "A payment is already being processed for this booking.".to_string()
            }
            Self::PaymentNotSettled => {
                "Payment has not completed yet. Please finish payment before booking.".to_string()
            }
            Self::BookingPersistFailed(_) => {
                "Your payment went through, but we couldn't record the booking. Please contact support; do not pay again."
                    .to_string()
            }
            Self::StatusFetchFailed(_) => {
                "Couldn't refresh delivery status. Showing the last known update.".to_string()
            }
            Self::DraftClosed => "This booking draft is no longer active.".to_string(),
            Self::BookingNotFound(_) => "We couldn't find that booking.".to_string(),
            Self::InvalidAmount(_) => {
                "The charge amount is invalid. Please re-check your price and try again.".to_string()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_map_to_known_set() {
        assert_eq!(
            ServiceErrorCode::from_wire(Some("INSURANCE_REQUIRED")),
            ServiceErrorCode::InsuranceRequired
        );
        assert_eq!(
            ServiceErrorCode::from_wire(Some("ITEM_VALUE_REQUIRED")),
            ServiceErrorCode::ItemValueRequired
        );
        assert_eq!(
            ServiceErrorCode::from_wire(Some("something-else")),
            ServiceErrorCode::Unclassified
        );
        assert_eq!(
            ServiceErrorCode::from_wire(None),
            ServiceErrorCode::Unclassified
        );
    }

    #[test]
    fn every_error_has_a_specific_user_message() {
        let err = FlowError::PaymentIntentFailed {
            code: ServiceErrorCode::InsuranceRequired,
            message: "insurance required".to_string(),
        };
        assert!(err.user_message().contains("protection is required"));

        let err = FlowError::BookingPersistFailed("db down".to_string());
        assert!(err.user_message().contains("contact support"));
    }
}
