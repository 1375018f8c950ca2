use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::booking::{Booking, DeliveryFeedback};
use crate::error::{FlowError, Result};
use crate::status::DeliveryStatus;

/// Persistence boundary for bookings. Bookings are never deleted; they are
/// only marked completed or cancelled through status updates.
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Persist a new booking and return its assigned identifier.
    async fn save(&self, booking: Booking) -> Result<Uuid>;
    async fn get(&self, id: Uuid) -> Result<Option<Booking>>;
    async fn set_status(&self, id: Uuid, status: DeliveryStatus) -> Result<()>;
    async fn set_feedback(&self, id: Uuid, feedback: DeliveryFeedback) -> Result<()>;
}

/// In-memory implementation of [`BookingStore`].
pub struct InMemoryBookingStore {
    bookings: Arc<DashMap<Uuid, Booking>>,
}

impl InMemoryBookingStore {
    pub fn new() -> Self {
        Self {
            bookings: Arc::new(DashMap::new()),
        }
    }
}

impl Default for InMemoryBookingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BookingStore for InMemoryBookingStore {
    async fn save(&self, booking: Booking) -> Result<Uuid> {
        let id = booking.id;
        self.bookings.insert(id, booking);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Booking>> {
        Ok(self.bookings.get(&id).map(|entry| entry.clone()))
    }

    async fn set_status(&self, id: Uuid, status: DeliveryStatus) -> Result<()> {
        let mut entry = self
            .bookings
            .get_mut(&id)
            .ok_or(FlowError::BookingNotFound(id))?;
        entry.status = status;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn set_feedback(&self, id: Uuid, feedback: DeliveryFeedback) -> Result<()> {
        let mut entry = self
            .bookings
            .get_mut(&id)
            .ok_or(FlowError::BookingNotFound(id))?;
        entry.feedback = Some(feedback);
        entry.updated_at = Utc::now();
        Ok(())
    }
}
