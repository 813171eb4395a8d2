//! HTTP surface: JSON handlers over the engine and the settlement handler,
//! plus a websocket per booking for live transitions.

mod actor;
mod bookings;
mod error;
mod events;
mod extract;
mod payments;

pub use actor::{ACTOR_ID_HEADER, ACTOR_ROLE_HEADER, RequestActor};
pub use error::ApiError;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{MatchedPath, Request},
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::engine::Engine;
use crate::identity::IdentityDirectory;
use crate::observability::{REQUEST_DURATION_SECONDS, REQUESTS_TOTAL};
use crate::settlement::SettlementHandler;

pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-webhook-signature";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub settlement: Arc<SettlementHandler>,
    pub directory: Arc<dyn IdentityDirectory>,
}

/// Success envelope: `{"success": true, "data": ..}`.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    success: bool,
    data: T,
}

pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data,
    })
}

pub type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/bookings", post(bookings::create_booking))
        .route("/bookings/mine", get(bookings::my_booking))
        .route("/bookings/:id", get(bookings::get_session))
        .route("/bookings/:id/confirm", put(bookings::confirm))
        .route("/bookings/:id/cancel", put(bookings::cancel))
        .route("/bookings/:id/complete", put(bookings::complete))
        .route("/bookings/:id/no-show", put(bookings::no_show))
        .route("/bookings/:id/events", get(events::subscribe))
        .route("/providers/:id/sessions", get(bookings::provider_sessions))
        .route("/payments/orders", post(payments::create_order))
        .route("/payments/verify", post(payments::verify))
        .route("/payments/webhook", post(payments::webhook))
        .route("/transactions/:id", get(payments::get_transaction))
        .route_layer(middleware::from_fn(track_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    now: i64,
}

async fn health(axum::extract::State(state): axum::extract::State<AppState>) -> Json<Envelope<Health>> {
    ok(Health {
        status: "ok",
        now: state.engine.now_ms(),
    })
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".into());
    let started = Instant::now();
    let response = next.run(req).await;
    metrics::counter!(
        REQUESTS_TOTAL,
        "route" => route.clone(),
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    metrics::histogram!(REQUEST_DURATION_SECONDS, "route" => route)
        .record(started.elapsed().as_secs_f64());
    response
}
