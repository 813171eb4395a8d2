use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::MAX_WEBHOOK_BODY_BYTES;
use crate::model::{PaymentOrder, Transaction, TransactionStatus};
use crate::settlement::{PaymentAssertion, WebhookOutcome};

use super::extract::{ApiJson, IdPath};
use super::{ApiError, ApiResult, AppState, RequestActor, WEBHOOK_SIGNATURE_HEADER, ok};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub session_id: Ulid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub transaction_id: Ulid,
    pub verified: bool,
    pub status: TransactionStatus,
    pub duplicate: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<Ulid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignored: Option<String>,
}

pub async fn create_order(
    State(state): State<AppState>,
    actor: RequestActor,
    ApiJson(req): ApiJson<CreateOrderRequest>,
) -> ApiResult<PaymentOrder> {
    Ok(ok(state.settlement.open_order(req.session_id, actor.0).await?))
}

pub async fn verify(
    State(state): State<AppState>,
    ApiJson(assertion): ApiJson<PaymentAssertion>,
) -> ApiResult<VerifyResponse> {
    let receipt = state.settlement.verify(assertion).await?;
    Ok(ok(VerifyResponse {
        transaction_id: receipt.transaction_id,
        verified: receipt.status == TransactionStatus::Completed,
        status: receipt.status,
        duplicate: receipt.duplicate,
    }))
}

/// Gateway callback. The signature covers the exact bytes received, so the
/// body is taken raw rather than through `Json`.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<WebhookResponse> {
    if body.len() > MAX_WEBHOOK_BODY_BYTES {
        return Err(ApiError::validation("webhook body too large"));
    }
    let signature = headers
        .get(WEBHOOK_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let response = match state.settlement.handle_webhook(&body, signature).await? {
        WebhookOutcome::Settled(receipt) => WebhookResponse {
            received: true,
            transaction_id: Some(receipt.transaction_id),
            ignored: None,
        },
        WebhookOutcome::Ignored(event) => WebhookResponse {
            received: true,
            transaction_id: None,
            ignored: Some(event),
        },
    };
    Ok(ok(response))
}

pub async fn get_transaction(
    State(state): State<AppState>,
    actor: RequestActor,
    IdPath(id): IdPath,
) -> ApiResult<Transaction> {
    let tx = state.engine.transaction(&id)?;
    let session = state.engine.session(&tx.session_id)?;
    if !actor.is_party(session.consumer_id, session.provider_id) {
        return Err(ApiError::forbidden("not a party to this transaction"));
    }
    Ok(ok(tx))
}
