use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::{Actor, TransitionNotice};
use crate::notify::NotifyHub;
use crate::observability::SUBSCRIBERS_ACTIVE;

use super::extract::IdPath;
use super::{ApiError, AppState, RequestActor};

/// Live transitions for one booking. Open to the booking's consumer and to any
/// provider holding a session in it.
///
/// The subscription is taken before the upgrade completes, so nothing that
/// happens after the handshake is missed. Slow readers lose notices.
pub async fn subscribe(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    actor: RequestActor,
    IdPath(booking_id): IdPath,
) -> Result<Response, ApiError> {
    let view = state.engine.booking_view(&booking_id)?;
    let allowed = match actor.0 {
        Actor::Consumer(id) => id == view.booking.consumer_id,
        Actor::Provider(id) => view.sessions.iter().any(|s| s.provider_id == id),
        Actor::System => false,
    };
    if !allowed {
        return Err(ApiError::forbidden("not a party to this booking"));
    }
    let rx = state.engine.notify.subscribe(booking_id);
    let hub = state.engine.notify.clone();
    info!(booking = %booking_id, "websocket subscription opened");
    Ok(ws.on_upgrade(move |socket| forward(socket, rx, hub, booking_id)))
}

async fn forward(
    socket: WebSocket,
    mut rx: broadcast::Receiver<TransitionNotice>,
    hub: std::sync::Arc<NotifyHub>,
    booking_id: Ulid,
) {
    metrics::gauge!(SUBSCRIBERS_ACTIVE).increment(1.0);
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            notice = rx.recv() => match notice {
                Ok(notice) => {
                    let text = match serde_json::to_string(&notice) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!("cannot encode notice: {e}");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!(booking = %booking_id, "subscriber lagged, {n} notices dropped");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    drop(rx);
    hub.release(&booking_id);
    metrics::gauge!(SUBSCRIBERS_ACTIVE).decrement(1.0);
    debug!(booking = %booking_id, "websocket subscription closed");
}
