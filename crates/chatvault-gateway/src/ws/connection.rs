use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum_extra::extract::CookieJar;
use chatvault_core::types::ConnId;
use chatvault_protocol::{ChangeEvent, ClientAction, ClientMessage, PongEvent, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::app::AppState;

/// Close code for sessions that never authenticated, or whose session has
/// since expired — distinct from the ordinary 1000/1001 codes so clients
/// know to redirect to login rather than simply reconnect.
const CLOSE_AUTH_REQUIRED: u16 = 4001;

/// `GET /ws/updates` — upgrades to a WebSocket after resolving the caller's
/// session from the request cookie. Connections that fail to authenticate
/// are still upgraded (so the client receives a well-formed close frame)
/// but are closed immediately with [`CLOSE_AUTH_REQUIRED`].
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> impl IntoResponse {
    match crate::auth::resolve_caller(&jar, &state) {
        Ok(caller) => ws.on_upgrade(move |socket| handle_connection(socket, state, caller)),
        Err(_) => ws.on_upgrade(|socket| reject_unauthenticated(socket)),
    }
}

async fn reject_unauthenticated(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_AUTH_REQUIRED,
            reason: Cow::Borrowed("authentication required"),
        })))
        .await;
}

/// Per-connection task lifetime: scope is resolved once at upgrade (a
/// master account change takes effect on the viewer's next login, not
/// mid-session — same rule the session table already enforces). The
/// client's subscription set starts empty, meaning "all chats visible
/// under scope" per the fan-out broadcast rule.
async fn handle_connection(socket: WebSocket, state: Arc<AppState>, caller: chatvault_core::types::CallerContext) {
    let conn_id = ConnId::new();
    let scope = state.scope.effective_scope(&caller);
    info!(conn_id = %conn_id, username = %caller.username, "websocket connection opened");
    state.ws_registry.insert(conn_id.clone());

    let (mut tx, mut rx) = socket.split();
    let mut events = state.bridge.subscribe();
    let mut subscriptions: HashSet<i64> = HashSet::new();

    loop {
        tokio::select! {
            msg = rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_client_message(&text, &scope, &mut subscriptions, &mut tx).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(conn_id = %conn_id, error = %e, "websocket read error");
                        break;
                    }
                }
            }
            change = events.recv() => {
                match change {
                    Ok(event) => {
                        if !deliver(&event, &scope, &subscriptions, &mut tx).await {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(conn_id = %conn_id, skipped, "websocket subscriber lagged behind change feed");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    state.ws_registry.remove(&conn_id);
    info!(conn_id = %conn_id, "websocket connection closed");
}

/// Handle one inbound client frame. Returns `false` if the connection
/// should be torn down (send failure).
async fn handle_client_message(
    text: &str,
    scope: &chatvault_core::types::Scope,
    subscriptions: &mut HashSet<i64>,
    tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
) -> bool {
    let Ok(msg) = serde_json::from_str::<ClientMessage>(text) else {
        debug!("ignoring malformed websocket message");
        return true;
    };

    match msg.action {
        ClientAction::Subscribe => {
            if let Some(chat_id) = msg.chat_id {
                if chatvault_core::types::scope_allows(scope, chat_id) {
                    subscriptions.insert(chat_id);
                }
            }
            true
        }
        ClientAction::Unsubscribe => {
            if let Some(chat_id) = msg.chat_id {
                subscriptions.remove(&chat_id);
            }
            true
        }
        ClientAction::Ping => send_event(tx, &ServerEvent::Pong(PongEvent::default())).await,
    }
}

/// Apply the broadcast rule: drop if the event's chat falls outside the
/// connection's scope; otherwise deliver if the chat is in the client's
/// subscription set or the set is empty (meaning "everything in scope").
async fn deliver(
    event: &ChangeEvent,
    scope: &chatvault_core::types::Scope,
    subscriptions: &HashSet<i64>,
    tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
) -> bool {
    if !chatvault_core::types::scope_allows(scope, event.chat_id) {
        return true;
    }
    if !subscriptions.is_empty() && !subscriptions.contains(&event.chat_id) {
        return true;
    }
    send_event(tx, &ServerEvent::Change(event.clone())).await
}

async fn send_event(
    tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> bool {
    let json = serde_json::to_string(event).unwrap_or_default();
    tx.send(Message::Text(json.into())).await.is_ok()
}
