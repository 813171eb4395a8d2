use std::fmt;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::MAX_PAYMENT_KEY_LEN;

/// Unix milliseconds, UTC.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Session ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Confirmed => "confirmed",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::NoShow => "no-show",
        }
    }

    /// Pending and confirmed sessions occupy their provider's slot.
    pub fn holds_slot(&self) -> bool {
        matches!(self, SessionStatus::Pending | SessionStatus::Confirmed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutStatus {
    Active,
    Expired,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Video,
    Audio,
    Chat,
    InPerson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    Consumer,
    Provider,
    System,
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActorRole::Consumer => "consumer",
            ActorRole::Provider => "provider",
            ActorRole::System => "system",
        })
    }
}

/// Who is asking for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Consumer(Ulid),
    Provider(Ulid),
    System,
}

impl Actor {
    pub fn role(&self) -> ActorRole {
        match self {
            Actor::Consumer(_) => ActorRole::Consumer,
            Actor::Provider(_) => ActorRole::Provider,
            Actor::System => ActorRole::System,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cancellation {
    pub reason: String,
    pub cancelled_by: ActorRole,
    pub cancelled_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub provider_id: Ulid,
    pub consumer_id: Ulid,
    pub scheduled_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub duration_minutes: u32,
    pub session_type: SessionType,
    /// Absolute slot occupied on the provider's calendar.
    pub span: Span,
    pub status: SessionStatus,
    /// Minor currency units.
    pub price: i64,
    pub currency: String,
    pub payment_status: PaymentStatus,
    pub timeout_at: Option<Ms>,
    pub timeout_status: TimeoutStatus,
    pub notes: Option<String>,
    pub cancellation: Option<Cancellation>,
    pub transaction_id: Option<Ulid>,
    pub payment_completed_at: Option<Ms>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Session {
    /// Unpaid hold whose deadline has passed and which no sweep has touched yet.
    pub fn is_sweep_eligible(&self, now: Ms) -> bool {
        self.status == SessionStatus::Pending
            && self.payment_status == PaymentStatus::Pending
            && self.timeout_status == TimeoutStatus::Active
            && self.timeout_at.is_some_and(|deadline| deadline <= now)
    }

    /// A captured payment can still be attached to this session.
    pub fn accepts_payment(&self) -> bool {
        self.status.holds_slot() && self.payment_status == PaymentStatus::Pending
    }

    /// Once status or payment leaves pending the hold deadline is inert.
    fn retire_deadline(&mut self) {
        if self.timeout_status == TimeoutStatus::Active {
            self.timeout_status = TimeoutStatus::Completed;
        }
    }
}

// ── Booking aggregate ────────────────────────────────────────────

/// One booking per consumer; sessions are appended, never removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: Ulid,
    pub consumer_id: Ulid,
    pub consumer_name: String,
    pub consumer_email: Option<String>,
    pub session_ids: Vec<Ulid>,
    pub total_sessions: u32,
    /// Sum of prices of paid sessions, minor units.
    pub total_spent: i64,
    pub created_at: Ms,
}

impl Booking {
    pub fn new(id: Ulid, consumer_id: Ulid, consumer_name: String, consumer_email: Option<String>, created_at: Ms) -> Self {
        Self {
            id,
            consumer_id,
            consumer_name,
            consumer_email,
            session_ids: Vec::new(),
            total_sessions: 0,
            total_spent: 0,
            created_at,
        }
    }

    pub fn recompute_totals<'a>(&mut self, sessions: impl Iterator<Item = &'a Session>) {
        let mut count = 0u32;
        let mut spent = 0i64;
        for s in sessions {
            count += 1;
            if s.payment_status == PaymentStatus::Paid {
                spent += s.price;
            }
        }
        self.total_sessions = count;
        self.total_spent = spent;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingView {
    #[serde(flatten)]
    pub booking: Booking,
    pub sessions: Vec<Session>,
}

// ── Payments ─────────────────────────────────────────────────────

/// External payment identifier used as the settlement dedup key.
///
/// The store keeps a unique index over these; that index is what makes a
/// payment settle at most once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentKey(String);

impl PaymentKey {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.len() > MAX_PAYMENT_KEY_LEN {
            return None;
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PaymentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
    Refunded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Ulid,
    pub consumer_id: Ulid,
    pub session_id: Ulid,
    pub amount: i64,
    pub currency: String,
    pub method: Option<String>,
    pub status: TransactionStatus,
    pub order_id: String,
    pub payment_id: PaymentKey,
    pub signature: Option<String>,
    /// Captured against a session that could no longer take it.
    pub refund_due: bool,
    pub created_at: Ms,
    pub completed_at: Option<Ms>,
}

/// A gateway order opened for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOrder {
    pub order_id: String,
    pub session_id: Ulid,
    pub amount: i64,
    pub currency: String,
    pub created_at: Ms,
}

// ── Provider calendar ────────────────────────────────────────────

/// A slot held by a pending or confirmed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub session_id: Ulid,
    pub span: Span,
}

/// Slots currently occupied on one provider, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct ProviderCalendar {
    pub provider_id: Ulid,
    pub slots: Vec<Slot>,
}

impl ProviderCalendar {
    pub fn new(provider_id: Ulid) -> Self {
        Self {
            provider_id,
            slots: Vec::new(),
        }
    }

    /// Insert slot maintaining sort order by span.start.
    pub fn insert_slot(&mut self, slot: Slot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn remove_slot(&mut self, session_id: Ulid) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.session_id == session_id)?;
        Some(self.slots.remove(pos))
    }

    /// Slots whose span overlaps the query window.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Slot> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// New hold. Also the snapshot form of any session during compaction.
    SessionRequested {
        session: Session,
        consumer_name: String,
        consumer_email: Option<String>,
    },
    SessionConfirmed {
        id: Ulid,
        at: Ms,
    },
    SessionCancelled {
        id: Ulid,
        reason: String,
        by: ActorRole,
        at: Ms,
        expired: bool,
    },
    SessionCompleted {
        id: Ulid,
        at: Ms,
    },
    SessionNoShow {
        id: Ulid,
        at: Ms,
    },
    PaymentApplied {
        session_id: Ulid,
        transaction_id: Ulid,
        at: Ms,
    },
    /// Payment failed at the gateway: the hold is released.
    PaymentFailed {
        session_id: Ulid,
        at: Ms,
    },
    OrderOpened {
        order: PaymentOrder,
    },
    TransactionRecorded {
        transaction: Transaction,
    },
    RefundFlagged {
        transaction_id: Ulid,
    },
}

impl Event {
    /// Session touched by this event, if any.
    pub fn session_id(&self) -> Option<Ulid> {
        match self {
            Event::SessionRequested { session, .. } => Some(session.id),
            Event::SessionConfirmed { id, .. }
            | Event::SessionCancelled { id, .. }
            | Event::SessionCompleted { id, .. }
            | Event::SessionNoShow { id, .. } => Some(*id),
            Event::PaymentApplied { session_id, .. } | Event::PaymentFailed { session_id, .. } => {
                Some(*session_id)
            }
            Event::OrderOpened { .. }
            | Event::TransactionRecorded { .. }
            | Event::RefundFlagged { .. } => None,
        }
    }
}

/// Apply a session-level event to the session record.
///
/// Returns false if the event does not concern sessions.
pub fn apply_to_session(session: &mut Session, event: &Event) -> bool {
    match event {
        Event::SessionConfirmed { at, .. } => {
            session.status = SessionStatus::Confirmed;
            session.retire_deadline();
            session.updated_at = *at;
        }
        Event::SessionCancelled {
            reason,
            by,
            at,
            expired,
            ..
        } => {
            session.status = SessionStatus::Cancelled;
            session.cancellation = Some(Cancellation {
                reason: reason.clone(),
                cancelled_by: *by,
                cancelled_at: *at,
            });
            if *expired {
                session.timeout_status = TimeoutStatus::Expired;
            } else {
                session.retire_deadline();
            }
            session.updated_at = *at;
        }
        Event::SessionCompleted { at, .. } => {
            session.status = SessionStatus::Completed;
            session.updated_at = *at;
        }
        Event::SessionNoShow { at, .. } => {
            session.status = SessionStatus::NoShow;
            session.updated_at = *at;
        }
        Event::PaymentApplied {
            transaction_id, at, ..
        } => {
            session.payment_status = PaymentStatus::Paid;
            session.transaction_id = Some(*transaction_id);
            session.payment_completed_at = Some(*at);
            session.retire_deadline();
            session.updated_at = *at;
        }
        Event::PaymentFailed { at, .. } => {
            session.payment_status = PaymentStatus::Failed;
            session.status = SessionStatus::Cancelled;
            session.cancellation = Some(Cancellation {
                reason: "payment_failed".into(),
                cancelled_by: ActorRole::System,
                cancelled_at: *at,
            });
            session.retire_deadline();
            session.updated_at = *at;
        }
        Event::SessionRequested { .. }
        | Event::OrderOpened { .. }
        | Event::TransactionRecorded { .. }
        | Event::RefundFlagged { .. } => return false,
    }
    true
}

// ── Notifications ────────────────────────────────────────────────

/// Published on every session transition after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionNotice {
    pub booking_id: Ulid,
    pub session_id: Ulid,
    pub status: SessionStatus,
    pub payment_status: PaymentStatus,
    pub reason: Option<String>,
    pub timestamp: Ms,
}

impl TransitionNotice {
    pub fn for_session(session: &Session, reason: Option<String>) -> Self {
        Self {
            booking_id: session.booking_id,
            session_id: session.id,
            status: session.status,
            payment_status: session.payment_status,
            reason,
            timestamp: session.updated_at,
        }
    }
}
