//! Booking and fulfillment orchestration: turns a confirmed pickup/dropoff
//! pair and item description into a priced, insured, paid booking, then
//! tracks the delivery lifecycle to completion.

pub mod booking;
pub mod draft;
pub mod error;
pub mod fare;
pub mod insurance;
pub mod money;
pub mod payment;
pub mod poller;
pub mod pricing;
pub mod status;
pub mod storage;
pub mod trip;

// Re-export commonly used types
pub use booking::{Booking, BookingAssembler, DeliveryFeedback, InsuranceRecord, PaymentRecord};
pub use draft::{BookingDraft, CustomerRef, ItemSummary};
pub use error::{FlowError, Result, ServiceErrorCode};
pub use fare::{FareBreakdown, TAX_RATE, static_rates};
pub use insurance::{
    CoverageSelection, HttpInsuranceService, InsuranceQuote, InsuranceQuoteManager,
    InsuranceQuoteRequest, InsuranceService, QuoteState,
};
pub use money::round2;
pub use payment::{
    ChargeDetails, HttpPaymentService, PaymentCoordinator, PaymentMethodProvider,
    PaymentMethodRef, PaymentService, PaymentState, PaymentTransaction,
};
pub use poller::{
    DeliveryStatusPoller, PollerConfig, TrackingHandle, TrackingSnapshot, TrackingView,
};
pub use pricing::{FareSheet, HttpPricingService, PricingClient, PricingService};
pub use status::DeliveryStatus;
pub use storage::{BookingStore, InMemoryBookingStore};
pub use trip::{DayOfWeek, GeoPoint, TripParameters, VehicleType, WeightClass};
