//! Payment settlement.
//!
//! A captured payment is recorded exactly once no matter how many times the
//! client confirms it or the gateway redelivers the webhook. The unique
//! payment-id index in the store is the only source of truth for that; the
//! pre-check here just avoids a gateway round trip on obvious repeats.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError, PaymentOutcome};
use crate::gateway::{GatewayError, GatewayPaymentStatus, PaymentGateway};
use crate::limits::{MAX_SIGNATURE_LEN, MAX_WEBHOOK_BODY_BYTES};
use crate::model::*;
use crate::observability::{REFUNDS_FLAGGED_TOTAL, SETTLEMENTS_TOTAL, SIGNATURE_FAILURES_TOTAL};
use crate::signature::SignatureVerifier;

/// Insert attempts before a unique-index collision is reported as a conflict.
const INSERT_ATTEMPTS: usize = 2;
/// How long a losing insert waits for the winner to commit.
const WINNER_POLLS: usize = 50;
const WINNER_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("signature mismatch")]
    Unauthorized,
    #[error("invalid payment data: {0}")]
    InvalidPaymentData(String),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("could not settle payment {0}")]
    Conflict(PaymentKey),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl SettlementError {
    pub fn kind(&self) -> &'static str {
        match self {
            SettlementError::Unauthorized => "Unauthorized",
            SettlementError::InvalidPaymentData(_) => "InvalidPaymentData",
            SettlementError::Malformed(_) => "ValidationError",
            SettlementError::Conflict(_) => "SettlementConflict",
            SettlementError::Gateway(_) => "GatewayError",
            SettlementError::Engine(e) => e.kind(),
        }
    }
}

/// What the client claims happened at the gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAssertion {
    pub external_order_id: String,
    pub external_payment_id: String,
    pub signature: String,
    /// Informational only; the gateway's amount is what gets recorded.
    #[serde(default)]
    pub declared_amount: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReceipt {
    pub transaction_id: Ulid,
    pub status: TransactionStatus,
    /// The payment had already been recorded by an earlier call.
    pub duplicate: bool,
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    event: String,
    #[serde(default)]
    payment: Option<WebhookPayment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayment {
    id: String,
    order_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Settled(SettlementReceipt),
    Ignored(String),
}

pub struct SettlementHandler {
    engine: Arc<Engine>,
    gateway: Arc<dyn PaymentGateway>,
    verifier: SignatureVerifier,
}

impl SettlementHandler {
    pub fn new(engine: Arc<Engine>, gateway: Arc<dyn PaymentGateway>, verifier: SignatureVerifier) -> Self {
        Self {
            engine,
            gateway,
            verifier,
        }
    }

    /// Open (or return the existing) gateway order for a pending session.
    pub async fn open_order(&self, session_id: Ulid, actor: Actor) -> Result<PaymentOrder, SettlementError> {
        let session = self.engine.payable_session(session_id, actor)?;
        if let Some(existing) = self.engine.order_for_session(&session_id) {
            return Ok(existing);
        }
        let order = self
            .gateway
            .create_order(session.price, &session.currency, &session_id.to_string())
            .await?;
        let recorded = self
            .engine
            .record_order(PaymentOrder {
                order_id: order.id,
                session_id,
                amount: session.price,
                currency: session.currency,
                created_at: self.engine.now_ms(),
            })
            .await?;
        info!(session = %session_id, order = %recorded.order_id, "payment order opened");
        Ok(recorded)
    }

    /// Client-side confirmation of a completed checkout.
    pub async fn verify(&self, assertion: PaymentAssertion) -> Result<SettlementReceipt, SettlementError> {
        if assertion.signature.len() > MAX_SIGNATURE_LEN {
            return Err(SettlementError::Malformed("signature too long".into()));
        }
        if !self.verifier.verify_payment(
            &assertion.external_order_id,
            &assertion.external_payment_id,
            &assertion.signature,
        ) {
            metrics::counter!(SIGNATURE_FAILURES_TOTAL, "source" => "verify").increment(1);
            warn!(order = %assertion.external_order_id, "payment signature rejected");
            return Err(SettlementError::Unauthorized);
        }
        self.settle(
            &assertion.external_order_id,
            &assertion.external_payment_id,
            Some(assertion.signature.trim().to_ascii_lowercase()),
            assertion.declared_amount,
        )
        .await
    }

    /// Gateway-initiated notification. `signature` covers the raw body.
    pub async fn handle_webhook(&self, body: &[u8], signature: &str) -> Result<WebhookOutcome, SettlementError> {
        if body.len() > MAX_WEBHOOK_BODY_BYTES {
            return Err(SettlementError::Malformed("webhook body too large".into()));
        }
        if !self.verifier.verify_webhook(body, signature) {
            metrics::counter!(SIGNATURE_FAILURES_TOTAL, "source" => "webhook").increment(1);
            warn!("webhook signature rejected");
            return Err(SettlementError::Unauthorized);
        }
        let envelope: WebhookEnvelope =
            serde_json::from_slice(body).map_err(|e| SettlementError::Malformed(e.to_string()))?;
        match envelope.event.as_str() {
            "payment.captured" | "payment.failed" => {
                let payment = envelope
                    .payment
                    .ok_or_else(|| SettlementError::Malformed("missing payment".into()))?;
                let receipt = self
                    .settle(&payment.order_id, &payment.id, None, None)
                    .await?;
                Ok(WebhookOutcome::Settled(receipt))
            }
            other => {
                debug!(event = other, "ignoring webhook event");
                Ok(WebhookOutcome::Ignored(other.to_string()))
            }
        }
    }

    async fn settle(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: Option<String>,
        declared_amount: Option<i64>,
    ) -> Result<SettlementReceipt, SettlementError> {
        let key = PaymentKey::parse(payment_id)
            .ok_or_else(|| SettlementError::InvalidPaymentData("invalid payment id".into()))?;

        if let Some(existing) = self.engine.transaction_for_payment(&key) {
            self.drive_session(&existing).await?;
            metrics::counter!(SETTLEMENTS_TOTAL, "outcome" => "duplicate").increment(1);
            debug!(payment = %key, transaction = %existing.id, "payment already settled");
            return Ok(receipt(&existing, true));
        }

        let order = self.engine.order(order_id).ok_or_else(|| EngineError::NotFound {
            entity: "order",
            id: order_id.to_string(),
        })?;
        let session = self.engine.session(&order.session_id)?;
        let payment = match self.gateway.fetch_payment(key.as_str()).await {
            Ok(p) => p,
            Err(GatewayError::NotFound { .. }) => {
                return Err(SettlementError::InvalidPaymentData(
                    "payment unknown to gateway".into(),
                ));
            }
            Err(e) => return Err(e.into()),
        };
        if payment.order_id != order.order_id {
            return Err(SettlementError::InvalidPaymentData(
                "payment does not belong to order".into(),
            ));
        }
        if let Some(declared) = declared_amount
            && declared != payment.amount
        {
            warn!(payment = %key, declared, actual = payment.amount, "declared amount ignored");
        }

        let now = self.engine.now_ms();
        let (status, currency, completed_at) = match payment.status {
            GatewayPaymentStatus::Captured => {
                let currency = payment
                    .currency
                    .clone()
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| SettlementError::InvalidPaymentData("missing currency".into()))?;
                if payment.amount <= 0 {
                    return Err(SettlementError::InvalidPaymentData(
                        "amount must be positive".into(),
                    ));
                }
                (TransactionStatus::Completed, currency, Some(now))
            }
            GatewayPaymentStatus::Failed => {
                let currency = payment.currency.clone().unwrap_or(order.currency.clone());
                (TransactionStatus::Failed, currency, None)
            }
            _ => {
                return Err(SettlementError::InvalidPaymentData(
                    "payment not captured".into(),
                ));
            }
        };

        let mut transaction = Transaction {
            id: Ulid::new(),
            consumer_id: session.consumer_id,
            session_id: session.id,
            amount: payment.amount,
            currency,
            method: payment.method,
            status,
            order_id: order.order_id,
            payment_id: key.clone(),
            signature,
            refund_due: false,
            created_at: now,
            completed_at,
        };

        for _ in 0..INSERT_ATTEMPTS {
            match self.engine.record_transaction(transaction.clone()).await {
                Ok(_) => {
                    self.drive_session(&transaction).await?;
                    metrics::counter!(SETTLEMENTS_TOTAL, "outcome" => "new").increment(1);
                    info!(
                        payment = %key,
                        transaction = %transaction.id,
                        session = %transaction.session_id,
                        "payment settled as {:?}",
                        transaction.status
                    );
                    return Ok(receipt(&transaction, false));
                }
                Err(EngineError::DuplicatePayment { .. }) => {
                    metrics::counter!(SETTLEMENTS_TOTAL, "outcome" => "raced").increment(1);
                    if let Some(winner) = self.await_winner(&key).await {
                        self.drive_session(&winner).await?;
                        return Ok(receipt(&winner, true));
                    }
                    transaction.id = Ulid::new();
                }
                Err(EngineError::AlreadyExists(_)) => transaction.id = Ulid::new(),
                Err(e) => return Err(e.into()),
            }
        }
        warn!(payment = %key, "settlement conflict unresolved after retry");
        Err(SettlementError::Conflict(key))
    }

    /// Wait for a concurrent insert of `key` to commit. `None` once the
    /// claim is released or the wait runs out; only committed ids are
    /// ever handed back to a caller.
    async fn await_winner(&self, key: &PaymentKey) -> Option<Transaction> {
        for _ in 0..WINNER_POLLS {
            if let Some(winner) = self.engine.transaction_for_payment(key) {
                return Some(winner);
            }
            if self.engine.transaction_id_for_payment(key).is_none() {
                debug!(payment = %key, "racing settlement released its claim");
                return None;
            }
            tokio::time::sleep(WINNER_POLL_INTERVAL).await;
        }
        self.engine.transaction_for_payment(key)
    }

    /// Push a recorded transaction's effect onto its session. Safe to repeat.
    async fn drive_session(&self, transaction: &Transaction) -> Result<(), EngineError> {
        match transaction.status {
            TransactionStatus::Completed => {
                match self
                    .engine
                    .apply_payment(transaction.session_id, transaction.id)
                    .await?
                {
                    PaymentOutcome::Applied | PaymentOutcome::AlreadyApplied => {}
                    PaymentOutcome::NotPayable => {
                        if !transaction.refund_due {
                            metrics::counter!(REFUNDS_FLAGGED_TOTAL).increment(1);
                        }
                        self.engine.flag_refund(transaction.id).await?;
                    }
                }
            }
            TransactionStatus::Failed => {
                self.engine.fail_payment(transaction.session_id).await?;
            }
            TransactionStatus::Pending | TransactionStatus::Cancelled | TransactionStatus::Refunded => {}
        }
        Ok(())
    }
}

fn receipt(transaction: &Transaction, duplicate: bool) -> SettlementReceipt {
    SettlementReceipt {
        transaction_id: transaction.id,
        status: transaction.status,
        duplicate,
    }
}
