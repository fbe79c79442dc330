use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::authorizer::{Authorizer, Identity};
use crate::push::PushHub;
use crate::router::RelayRouter;

/// State shared by every websocket connection.
#[derive(Clone)]
pub struct RelayState {
    pub router: Arc<RelayRouter>,
    pub hub: Arc<PushHub>,
    pub authorizer: Arc<Authorizer>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(default)]
    token: Option<String>,
}

/// WebSocket upgrade handler. The bearer token is checked before upgrading.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<RelayState>,
) -> Response {
    match state.authorizer.authorize(query.token.as_deref()).await {
        Ok(identity) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, identity))
            .into_response(),
        Err(err) => {
            counter!("tether_relay_auth_failures_total", 1);
            warn!(error = %err, "rejecting websocket: token validation failed");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

async fn handle_socket(socket: WebSocket, state: RelayState, identity: Identity) {
    let connection_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();
    let mut outbound = state.hub.register(&connection_id);

    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        debug!(connection = %writer_id, "writer task ended");
    });

    info!(
        connection = %connection_id,
        user = %identity.user_id,
        authenticated = identity.is_authenticated,
        "websocket connected"
    );

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(connection = %connection_id, error = %err, "websocket read failed");
                break;
            }
        };
        match frame {
            Message::Text(text) => {
                state.router.dispatch(&connection_id, &identity, &text).await;
            }
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => state.router.dispatch(&connection_id, &identity, &text).await,
                Err(_) => debug!(connection = %connection_id, "ignoring non-UTF8 binary frame"),
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    state.hub.unregister(&connection_id);
    state.router.disconnect(&connection_id).await;
    writer.abort();
    info!(connection = %connection_id, "websocket disconnected");
}
