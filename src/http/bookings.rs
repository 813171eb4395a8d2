use axum::{Json, extract::State, http::StatusCode};
use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use ulid::Ulid;

use crate::engine::HoldRequest;
use crate::model::{BookingView, Session, SessionType};

use super::extract::{ApiJson, IdPath};
use super::{ApiError, ApiResult, AppState, Envelope, RequestActor, ok};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBookingRequest {
    pub provider_id: Ulid,
    pub session_type: SessionType,
    /// Minutes.
    pub duration: u32,
    pub scheduled_date: NaiveDate,
    /// `HH:MM` or `HH:MM:SS`, UTC.
    pub start_time: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub reason: String,
}

fn parse_time(raw: &str) -> Result<NaiveTime, ApiError> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|_| ApiError::validation(format!("invalid start time {raw:?}")))
}

pub async fn create_booking(
    State(state): State<AppState>,
    actor: RequestActor,
    ApiJson(req): ApiJson<CreateBookingRequest>,
) -> Result<(StatusCode, Json<Envelope<Session>>), ApiError> {
    let consumer_id = actor.consumer_id()?;
    let start_time = parse_time(&req.start_time)?;
    let provider = state
        .directory
        .provider(&req.provider_id)
        .await
        .ok_or_else(|| ApiError::not_found("provider", req.provider_id))?;
    let consumer = state
        .directory
        .consumer(&consumer_id)
        .await
        .ok_or_else(|| ApiError::not_found("consumer", consumer_id))?;

    let session = state
        .engine
        .create_session(HoldRequest {
            provider_id: provider.id,
            consumer_id,
            consumer_name: consumer.name,
            consumer_email: consumer.email,
            session_type: req.session_type,
            scheduled_date: req.scheduled_date,
            start_time,
            duration_minutes: req.duration,
            price: provider.price_for(req.duration),
            currency: provider.currency,
            notes: req.notes,
        })
        .await?;
    Ok((StatusCode::CREATED, ok(session)))
}

pub async fn get_session(
    State(state): State<AppState>,
    actor: RequestActor,
    IdPath(id): IdPath,
) -> ApiResult<Session> {
    let session = state.engine.session(&id)?;
    if !actor.is_party(session.consumer_id, session.provider_id) {
        return Err(ApiError::forbidden("not a party to this session"));
    }
    Ok(ok(session))
}

pub async fn my_booking(State(state): State<AppState>, actor: RequestActor) -> ApiResult<BookingView> {
    let consumer_id = actor.consumer_id()?;
    Ok(ok(state.engine.booking_view_for_consumer(&consumer_id)?))
}

pub async fn provider_sessions(
    State(state): State<AppState>,
    actor: RequestActor,
    IdPath(id): IdPath,
) -> ApiResult<Vec<Session>> {
    if actor.provider_id()? != id {
        return Err(ApiError::forbidden("not this provider"));
    }
    Ok(ok(state.engine.provider_sessions(&id)))
}

pub async fn confirm(
    State(state): State<AppState>,
    actor: RequestActor,
    IdPath(id): IdPath,
) -> ApiResult<Session> {
    Ok(ok(state.engine.confirm_session(id, actor.0).await?))
}

pub async fn cancel(
    State(state): State<AppState>,
    actor: RequestActor,
    IdPath(id): IdPath,
    ApiJson(req): ApiJson<CancelRequest>,
) -> ApiResult<Session> {
    Ok(ok(state.engine.cancel_session(id, actor.0, &req.reason).await?))
}

pub async fn complete(
    State(state): State<AppState>,
    actor: RequestActor,
    IdPath(id): IdPath,
) -> ApiResult<Session> {
    Ok(ok(state.engine.complete_session(id, actor.0).await?))
}

pub async fn no_show(
    State(state): State<AppState>,
    actor: RequestActor,
    IdPath(id): IdPath,
) -> ApiResult<Session> {
    Ok(ok(state.engine.mark_no_show(id, actor.0).await?))
}
