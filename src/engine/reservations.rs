use chrono::{NaiveDate, NaiveTime};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, resolve_slot};
use super::{Engine, EngineError};

/// Everything needed to place a hold. Identity and price are resolved by the
/// caller.
#[derive(Debug, Clone)]
pub struct HoldRequest {
    pub provider_id: Ulid,
    pub consumer_id: Ulid,
    pub consumer_name: String,
    pub consumer_email: Option<String>,
    pub session_type: SessionType,
    pub scheduled_date: NaiveDate,
    pub start_time: NaiveTime,
    pub duration_minutes: u32,
    pub price: i64,
    pub currency: String,
    pub notes: Option<String>,
}

/// Explicitly requested state-machine transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Confirm,
    Cancel,
    Complete,
    NoShow,
}

impl Transition {
    pub fn action(&self) -> &'static str {
        match self {
            Transition::Confirm => "confirm",
            Transition::Cancel => "cancel",
            Transition::Complete => "complete",
            Transition::NoShow => "mark no-show",
        }
    }

    fn allowed_from(&self, status: SessionStatus) -> bool {
        match self {
            Transition::Confirm => status == SessionStatus::Pending,
            Transition::Cancel => status.holds_slot(),
            Transition::Complete | Transition::NoShow => status == SessionStatus::Confirmed,
        }
    }
}

/// State first, then actor: a transition out of a terminal state is always
/// `InvalidTransition`, whoever asks.
pub(super) fn authorize(session: &Session, transition: Transition, actor: &Actor) -> Result<(), EngineError> {
    if !transition.allowed_from(session.status) {
        return Err(EngineError::InvalidTransition {
            from: session.status,
            action: transition.action(),
        });
    }
    let permitted = match (transition, actor) {
        (_, Actor::Provider(id)) => *id == session.provider_id,
        (Transition::Cancel, Actor::Consumer(id)) => *id == session.consumer_id,
        (Transition::Cancel, Actor::System) => true,
        _ => false,
    };
    if !permitted {
        return Err(EngineError::Forbidden {
            actor: actor.role(),
            action: transition.action(),
        });
    }
    Ok(())
}

/// Result of attaching a captured payment to its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Applied,
    /// This transaction was already applied.
    AlreadyApplied,
    /// Session is cancelled/finished or paid by another transaction.
    NotPayable,
}

fn validate_hold(req: &HoldRequest) -> Result<(), EngineError> {
    if req.consumer_name.trim().is_empty() || req.consumer_name.len() > MAX_NAME_LEN {
        return Err(EngineError::Validation("consumer name is required".into()));
    }
    if req.price < 0 {
        return Err(EngineError::Validation("price cannot be negative".into()));
    }
    if req.currency.trim().is_empty() || req.currency.len() > MAX_CURRENCY_LEN {
        return Err(EngineError::Validation("currency is required".into()));
    }
    if let Some(ref n) = req.notes
        && n.len() > MAX_NOTES_LEN
    {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    if req.provider_id == req.consumer_id {
        return Err(EngineError::Validation("cannot book a session with yourself".into()));
    }
    Ok(())
}

impl Engine {
    /// Place a pending hold on the provider's slot.
    ///
    /// The overlap check and the insert happen under the provider calendar's
    /// write lock, so two racing holds for the same slot cannot both land.
    pub async fn create_session(&self, req: HoldRequest) -> Result<Session, EngineError> {
        validate_hold(&req)?;
        let (end_time, span) = resolve_slot(
            req.scheduled_date,
            req.start_time,
            req.duration_minutes,
            self.settings.min_duration_minutes,
        )?;
        let now = self.clock.now_ms();
        if span.start <= now {
            return Err(EngineError::Validation("cannot book a slot in the past".into()));
        }

        let calendar = self.store.calendar_or_create(req.provider_id);
        let mut guard = calendar.write().await;
        if guard.slots.len() >= MAX_ACTIVE_SLOTS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many active sessions on provider"));
        }
        if let Err(e) = check_no_conflict(&guard, &span) {
            metrics::counter!(crate::observability::SLOT_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let booking_id = self.store.open_booking(
            req.consumer_id,
            &req.consumer_name,
            req.consumer_email.as_deref(),
            now,
        );
        let hold_ms = Ms::try_from(self.settings.hold_duration.as_millis()).unwrap_or(Ms::MAX);
        let deadline = now.saturating_add(hold_ms);
        let session = Session {
            id: Ulid::new(),
            booking_id,
            provider_id: req.provider_id,
            consumer_id: req.consumer_id,
            scheduled_date: req.scheduled_date,
            start_time: req.start_time,
            end_time,
            duration_minutes: req.duration_minutes,
            session_type: req.session_type,
            span,
            status: SessionStatus::Pending,
            price: req.price,
            currency: req.currency.trim().to_uppercase(),
            payment_status: PaymentStatus::Pending,
            timeout_at: Some(deadline),
            timeout_status: TimeoutStatus::Active,
            notes: req.notes,
            cancellation: None,
            transaction_id: None,
            payment_completed_at: None,
            created_at: now,
            updated_at: now,
        };
        let event = Event::SessionRequested {
            session: session.clone(),
            consumer_name: req.consumer_name,
            consumer_email: req.consumer_email,
        };
        self.persist_and_apply(Some(&mut *guard), &event).await?;
        metrics::counter!(crate::observability::HOLDS_CREATED_TOTAL).increment(1);
        info!(
            session = %session.id,
            provider = %session.provider_id,
            "hold placed until {}",
            deadline
        );
        Ok(session)
    }

    pub async fn confirm_session(&self, id: Ulid, actor: Actor) -> Result<Session, EngineError> {
        self.transition(id, Transition::Confirm, actor, None).await
    }

    pub async fn cancel_session(&self, id: Ulid, actor: Actor, reason: &str) -> Result<Session, EngineError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EngineError::Validation("cancellation reason is required".into()));
        }
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("cancellation reason too long"));
        }
        self.transition(id, Transition::Cancel, actor, Some(reason)).await
    }

    pub async fn complete_session(&self, id: Ulid, actor: Actor) -> Result<Session, EngineError> {
        self.transition(id, Transition::Complete, actor, None).await
    }

    /// Manual terminal state, provider only, from confirmed.
    pub async fn mark_no_show(&self, id: Ulid, actor: Actor) -> Result<Session, EngineError> {
        self.transition(id, Transition::NoShow, actor, None).await
    }

    async fn transition(
        &self,
        id: Ulid,
        transition: Transition,
        actor: Actor,
        reason: Option<&str>,
    ) -> Result<Session, EngineError> {
        let (session, mut guard) = self.lock_session(&id).await?;
        authorize(&session, transition, &actor)?;
        let at = self.clock.now_ms();
        let event = match transition {
            Transition::Confirm => Event::SessionConfirmed { id, at },
            Transition::Cancel => Event::SessionCancelled {
                id,
                reason: reason.unwrap_or("cancelled").to_string(),
                by: actor.role(),
                at,
                expired: false,
            },
            Transition::Complete => Event::SessionCompleted { id, at },
            Transition::NoShow => Event::SessionNoShow { id, at },
        };
        self.persist_and_apply(Some(&mut *guard), &event).await?;
        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "action" => transition.action())
            .increment(1);
        info!(session = %id, actor = %actor.role(), "session {}", transition.action());
        self.store
            .session(&id)
            .ok_or_else(|| EngineError::session_not_found(id))
    }

    /// Expire one hold if it still matches the sweep filter at `now`.
    /// `Ok(None)` means someone else already moved it on.
    pub async fn expire_hold(&self, id: Ulid, now: Ms) -> Result<Option<Session>, EngineError> {
        let (session, mut guard) = self.lock_session(&id).await?;
        if !session.is_sweep_eligible(now) {
            return Ok(None);
        }
        let event = Event::SessionCancelled {
            id,
            reason: "expired".into(),
            by: ActorRole::System,
            at: now,
            expired: true,
        };
        self.persist_and_apply(Some(&mut *guard), &event).await?;
        Ok(self.store.session(&id))
    }

    /// Attach a completed transaction to its session.
    pub async fn apply_payment(&self, session_id: Ulid, transaction_id: Ulid) -> Result<PaymentOutcome, EngineError> {
        let (session, mut guard) = self.lock_session(&session_id).await?;
        if session.transaction_id == Some(transaction_id) {
            return Ok(PaymentOutcome::AlreadyApplied);
        }
        if !session.accepts_payment() {
            return Ok(PaymentOutcome::NotPayable);
        }
        let event = Event::PaymentApplied {
            session_id,
            transaction_id,
            at: self.clock.now_ms(),
        };
        self.persist_and_apply(Some(&mut *guard), &event).await?;
        info!(session = %session_id, transaction = %transaction_id, "payment applied");
        Ok(PaymentOutcome::Applied)
    }

    /// Gateway reported the payment failed: release the hold.
    /// Returns false if the session had already moved on.
    pub async fn fail_payment(&self, session_id: Ulid) -> Result<bool, EngineError> {
        let (session, mut guard) = self.lock_session(&session_id).await?;
        if !session.accepts_payment() {
            return Ok(false);
        }
        let event = Event::PaymentFailed {
            session_id,
            at: self.clock.now_ms(),
        };
        self.persist_and_apply(Some(&mut *guard), &event).await?;
        info!(session = %session_id, "payment failed, hold released");
        Ok(true)
    }

    /// Session the consumer may open a payment order for.
    pub fn payable_session(&self, session_id: Ulid, actor: Actor) -> Result<Session, EngineError> {
        let session = self
            .store
            .session(&session_id)
            .ok_or_else(|| EngineError::session_not_found(session_id))?;
        if actor != Actor::Consumer(session.consumer_id) {
            return Err(EngineError::Forbidden {
                actor: actor.role(),
                action: "pay for",
            });
        }
        if session.status != SessionStatus::Pending || !session.accepts_payment() {
            return Err(EngineError::InvalidTransition {
                from: session.status,
                action: "pay for",
            });
        }
        Ok(session)
    }

    /// Record the gateway order for a session. One order per session: if one
    /// already exists it is returned instead.
    pub async fn record_order(&self, order: PaymentOrder) -> Result<PaymentOrder, EngineError> {
        if order.order_id.is_empty() || order.order_id.len() > MAX_ORDER_ID_LEN {
            return Err(EngineError::Validation("invalid order id".into()));
        }
        if let Err(existing) = self.store.reserve_order(order.session_id, &order.order_id) {
            return self
                .store
                .order(&existing)
                .ok_or(EngineError::AlreadyExists(order.session_id));
        }
        let event = Event::OrderOpened { order: order.clone() };
        if let Err(e) = self.persist_and_apply(None, &event).await {
            self.store.release_order(&order.session_id, &order.order_id);
            return Err(e);
        }
        Ok(order)
    }

    /// Insert a transaction under the unique payment-id index.
    ///
    /// Fails with `DuplicatePayment` when another transaction owns the payment
    /// id and with `AlreadyExists` when the transaction id itself is taken.
    pub async fn record_transaction(&self, transaction: Transaction) -> Result<Ulid, EngineError> {
        let key = transaction.payment_id.clone();
        let id = transaction.id;
        if let Err(existing) = self.store.reserve_payment_key(&key, id) {
            return Err(EngineError::DuplicatePayment { key, existing });
        }
        if self.store.contains_transaction(&id) {
            self.store.release_payment_key(&key, id);
            return Err(EngineError::AlreadyExists(id));
        }
        let event = Event::TransactionRecorded { transaction };
        if let Err(e) = self.persist_and_apply(None, &event).await {
            self.store.release_payment_key(&key, id);
            return Err(e);
        }
        Ok(id)
    }

    /// Mark a transaction as owed back to the consumer. Idempotent.
    pub async fn flag_refund(&self, transaction_id: Ulid) -> Result<(), EngineError> {
        let tx = self
            .store
            .transaction(&transaction_id)
            .ok_or_else(|| EngineError::NotFound {
                entity: "transaction",
                id: transaction_id.to_string(),
            })?;
        if tx.refund_due {
            return Ok(());
        }
        warn!(transaction = %transaction_id, session = %tx.session_id, "captured payment needs refund");
        self.persist_and_apply(None, &Event::RefundFlagged { transaction_id })
            .await
    }
}
