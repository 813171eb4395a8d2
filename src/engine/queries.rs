use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub fn session(&self, id: &Ulid) -> Result<Session, EngineError> {
        self.store
            .session(id)
            .ok_or_else(|| EngineError::session_not_found(*id))
    }

    /// The consumer's booking with its sessions.
    pub fn booking_view_for_consumer(&self, consumer_id: &Ulid) -> Result<BookingView, EngineError> {
        let booking = self
            .store
            .booking_for_consumer(consumer_id)
            .ok_or_else(|| EngineError::NotFound {
                entity: "booking",
                id: consumer_id.to_string(),
            })?;
        Ok(self.view(booking))
    }

    pub fn booking_view(&self, booking_id: &Ulid) -> Result<BookingView, EngineError> {
        let booking = self
            .store
            .booking(booking_id)
            .ok_or_else(|| EngineError::NotFound {
                entity: "booking",
                id: booking_id.to_string(),
            })?;
        Ok(self.view(booking))
    }

    fn view(&self, booking: Booking) -> BookingView {
        let sessions = self.store.sessions_of(&booking);
        BookingView { booking, sessions }
    }

    /// All sessions of a provider, earliest slot first.
    pub fn provider_sessions(&self, provider_id: &Ulid) -> Vec<Session> {
        self.store.provider_sessions(provider_id)
    }

    pub fn transaction(&self, id: &Ulid) -> Result<Transaction, EngineError> {
        self.store.transaction(id).ok_or_else(|| EngineError::NotFound {
            entity: "transaction",
            id: id.to_string(),
        })
    }

    pub fn transaction_id_for_payment(&self, key: &PaymentKey) -> Option<Ulid> {
        self.store.transaction_id_for_payment(key)
    }

    pub fn transaction_for_payment(&self, key: &PaymentKey) -> Option<Transaction> {
        let id = self.store.transaction_id_for_payment(key)?;
        self.store.transaction(&id)
    }

    pub fn order(&self, order_id: &str) -> Option<PaymentOrder> {
        self.store.order(order_id)
    }

    pub fn order_for_session(&self, session_id: &Ulid) -> Option<PaymentOrder> {
        self.store.order_for_session(session_id)
    }

    pub fn transaction_count(&self) -> usize {
        self.store.transaction_count()
    }

    /// Holds whose deadline is at or before `now`. Candidates only: each one
    /// is re-checked under its calendar lock before it is expired.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<Ulid> {
        self.store.expired_candidates(now)
    }

    /// Whether `span` would collide with an active slot on the provider.
    #[cfg(test)]
    pub async fn has_conflict(&self, provider_id: &Ulid, span: &Span) -> bool {
        let Some(calendar) = self.store.calendar(provider_id) else {
            return false;
        };
        let guard = calendar.read().await;
        super::conflict::find_conflict(&guard, span).is_some()
    }
}
