use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::SharedCalendar;

/// Time-slot store: sessions, per-provider calendars, bookings and payments.
///
/// Writes to a session only happen while its provider calendar is write-locked,
/// so the calendar lock linearizes every transition of that session.
pub struct InMemoryStore {
    calendars: DashMap<Ulid, SharedCalendar>,
    sessions: DashMap<Ulid, Session>,
    /// Keyed by consumer id.
    bookings: DashMap<Ulid, Booking>,
    booking_consumers: DashMap<Ulid, Ulid>,
    transactions: DashMap<Ulid, Transaction>,
    /// Unique index: one transaction per external payment id.
    payment_index: DashMap<PaymentKey, Ulid>,
    orders: DashMap<String, PaymentOrder>,
    session_orders: DashMap<Ulid, String>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            calendars: DashMap::new(),
            sessions: DashMap::new(),
            bookings: DashMap::new(),
            booking_consumers: DashMap::new(),
            transactions: DashMap::new(),
            payment_index: DashMap::new(),
            orders: DashMap::new(),
            session_orders: DashMap::new(),
        }
    }

    // ── Calendars ────────────────────────────────────────────

    pub fn calendar(&self, provider_id: &Ulid) -> Option<SharedCalendar> {
        self.calendars.get(provider_id).map(|e| e.value().clone())
    }

    pub fn calendar_or_create(&self, provider_id: Ulid) -> SharedCalendar {
        self.calendars
            .entry(provider_id)
            .or_insert_with(|| Arc::new(RwLock::new(ProviderCalendar::new(provider_id))))
            .value()
            .clone()
    }

    /// Rebuild every calendar from the session records. Replay only.
    pub fn rebuild_calendars(&self) {
        let mut by_provider: HashMap<Ulid, ProviderCalendar> = HashMap::new();
        for entry in self.sessions.iter() {
            let s = entry.value();
            if s.status.holds_slot() {
                by_provider
                    .entry(s.provider_id)
                    .or_insert_with(|| ProviderCalendar::new(s.provider_id))
                    .insert_slot(Slot {
                        session_id: s.id,
                        span: s.span,
                    });
            }
        }
        self.calendars.clear();
        for (provider_id, calendar) in by_provider {
            self.calendars
                .insert(provider_id, Arc::new(RwLock::new(calendar)));
        }
    }

    // ── Sessions & bookings ──────────────────────────────────

    pub fn session(&self, id: &Ulid) -> Option<Session> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    pub fn session_provider(&self, id: &Ulid) -> Option<Ulid> {
        self.sessions.get(id).map(|e| e.provider_id)
    }

    pub fn provider_sessions(&self, provider_id: &Ulid) -> Vec<Session> {
        let mut out: Vec<Session> = self
            .sessions
            .iter()
            .filter(|e| e.provider_id == *provider_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|s| s.span.start);
        out
    }

    /// Unpaid holds past their deadline.
    pub fn expired_candidates(&self, now: Ms) -> Vec<Ulid> {
        self.sessions
            .iter()
            .filter(|e| e.is_sweep_eligible(now))
            .map(|e| *e.key())
            .collect()
    }

    /// Booking id for the consumer, opening an empty booking on first use.
    pub fn open_booking(
        &self,
        consumer_id: Ulid,
        consumer_name: &str,
        consumer_email: Option<&str>,
        now: Ms,
    ) -> Ulid {
        let id = self
            .bookings
            .entry(consumer_id)
            .or_insert_with(|| {
                Booking::new(
                    Ulid::new(),
                    consumer_id,
                    consumer_name.to_string(),
                    consumer_email.map(str::to_string),
                    now,
                )
            })
            .id;
        self.booking_consumers.insert(id, consumer_id);
        id
    }

    pub fn booking_for_consumer(&self, consumer_id: &Ulid) -> Option<Booking> {
        self.bookings.get(consumer_id).map(|e| e.value().clone())
    }

    pub fn booking(&self, booking_id: &Ulid) -> Option<Booking> {
        let consumer_id = *self.booking_consumers.get(booking_id)?;
        self.booking_for_consumer(&consumer_id)
    }

    pub fn sessions_of(&self, booking: &Booking) -> Vec<Session> {
        booking
            .session_ids
            .iter()
            .filter_map(|id| self.session(id))
            .collect()
    }

    fn recompute_booking(&self, consumer_id: &Ulid) {
        let Some(booking) = self.booking_for_consumer(consumer_id) else {
            return;
        };
        let sessions = self.sessions_of(&booking);
        if let Some(mut b) = self.bookings.get_mut(consumer_id) {
            b.recompute_totals(sessions.iter());
        }
    }

    // ── Payments ─────────────────────────────────────────────

    /// Claim `key` for `transaction_id`. Fails with the current owner if taken.
    pub fn reserve_payment_key(&self, key: &PaymentKey, transaction_id: Ulid) -> Result<(), Ulid> {
        match self.payment_index.entry(key.clone()) {
            Entry::Occupied(e) => Err(*e.get()),
            Entry::Vacant(e) => {
                e.insert(transaction_id);
                Ok(())
            }
        }
    }

    pub fn release_payment_key(&self, key: &PaymentKey, transaction_id: Ulid) {
        self.payment_index
            .remove_if(key, |_, owner| *owner == transaction_id);
    }

    pub fn transaction_id_for_payment(&self, key: &PaymentKey) -> Option<Ulid> {
        self.payment_index.get(key).map(|e| *e.value())
    }

    pub fn transaction(&self, id: &Ulid) -> Option<Transaction> {
        self.transactions.get(id).map(|e| e.value().clone())
    }

    pub fn contains_transaction(&self, id: &Ulid) -> bool {
        self.transactions.contains_key(id)
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Claim the order slot for a session. Fails with the existing order id.
    pub fn reserve_order(&self, session_id: Ulid, order_id: &str) -> Result<(), String> {
        match self.session_orders.entry(session_id) {
            Entry::Occupied(e) => Err(e.get().clone()),
            Entry::Vacant(e) => {
                e.insert(order_id.to_string());
                Ok(())
            }
        }
    }

    pub fn release_order(&self, session_id: &Ulid, order_id: &str) {
        self.session_orders
            .remove_if(session_id, |_, owner| owner == order_id);
    }

    pub fn order(&self, order_id: &str) -> Option<PaymentOrder> {
        self.orders.get(order_id).map(|e| e.value().clone())
    }

    pub fn order_for_session(&self, session_id: &Ulid) -> Option<PaymentOrder> {
        let order_id = self.session_orders.get(session_id)?.value().clone();
        self.order(&order_id)
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event to the indexes. The caller holds the write lock on the
    /// session's provider calendar and passes it in; replay passes `None` and
    /// rebuilds calendars afterwards.
    pub fn apply_event(&self, calendar: Option<&mut ProviderCalendar>, event: &Event) {
        match event {
            Event::SessionRequested {
                session,
                consumer_name,
                consumer_email,
            } => {
                self.bookings
                    .entry(session.consumer_id)
                    .or_insert_with(|| {
                        Booking::new(
                            session.booking_id,
                            session.consumer_id,
                            consumer_name.clone(),
                            consumer_email.clone(),
                            session.created_at,
                        )
                    });
                self.booking_consumers
                    .insert(session.booking_id, session.consumer_id);
                if let Some(cal) = calendar
                    && session.status.holds_slot()
                {
                    cal.insert_slot(Slot {
                        session_id: session.id,
                        span: session.span,
                    });
                }
                self.sessions.insert(session.id, session.clone());
                if let Some(mut b) = self.bookings.get_mut(&session.consumer_id)
                    && !b.session_ids.contains(&session.id)
                {
                    b.session_ids.push(session.id);
                }
                self.recompute_booking(&session.consumer_id);
            }
            Event::OrderOpened { order } => {
                self.session_orders
                    .insert(order.session_id, order.order_id.clone());
                self.orders.insert(order.order_id.clone(), order.clone());
            }
            Event::TransactionRecorded { transaction } => {
                self.payment_index
                    .insert(transaction.payment_id.clone(), transaction.id);
                self.transactions
                    .insert(transaction.id, transaction.clone());
            }
            Event::RefundFlagged { transaction_id } => {
                if let Some(mut t) = self.transactions.get_mut(transaction_id) {
                    t.refund_due = true;
                }
            }
            other => {
                let Some(id) = other.session_id() else { return };
                let touched = self.sessions.get_mut(&id).map(|mut s| {
                    let held = s.status.holds_slot();
                    apply_to_session(&mut s, other);
                    (s.consumer_id, held && !s.status.holds_slot())
                });
                let Some((consumer_id, released)) = touched else {
                    return;
                };
                if released && let Some(cal) = calendar {
                    cal.remove_slot(id);
                }
                self.recompute_booking(&consumer_id);
            }
        }
    }

    /// Minimal event list that recreates the current state.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::new();
        let bookings: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        for booking in &bookings {
            for session in self.sessions_of(booking) {
                events.push(Event::SessionRequested {
                    session,
                    consumer_name: booking.consumer_name.clone(),
                    consumer_email: booking.consumer_email.clone(),
                });
            }
        }
        for entry in self.orders.iter() {
            events.push(Event::OrderOpened {
                order: entry.value().clone(),
            });
        }
        for entry in self.transactions.iter() {
            events.push(Event::TransactionRecorded {
                transaction: entry.value().clone(),
            });
        }
        events
    }
}
