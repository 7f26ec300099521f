use axum::{debug_handler, extract::{ws::Message as Frame, State, WebSocketUpgrade}, response::{IntoResponse, Response}};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use sqlx::SqlitePool;
use tokio::sync::broadcast::{self, error::RecvError};
use tower_sessions::Session;
use tracing::{debug, warn};

use crate::{db::{Message, UserId}, events::Envelope, session::require_user, AppResult};

use super::msg;

/// An incoming frame: post `content` to `chat_id`.
#[derive(Debug, Deserialize)]
struct ChatFrame {
    chat_id: String,
    content: String,
}

/// Sends one inbound frame as a message from `user_id`. Frames that don't
/// parse, or that the send rejects, are dropped.
pub(crate) async fn handle_frame(
    db_pool: &SqlitePool,
    events: &broadcast::Sender<Envelope>,
    user_id: &str,
    data: &[u8],
) -> Option<Message> {
    let Ok(ChatFrame { chat_id, content }) = serde_json::from_slice(data) else {
        debug!(%user_id, "ignoring frame");
        return None;
    };

    match msg::send_message(db_pool, events, user_id, &chat_id, &content).await {
        Ok(message) => Some(message),
        Err(err) => {
            debug!(%user_id, %chat_id, error = %err.0, "frame rejected");
            None
        }
    }
}

/// Pushes every event meant for `user_id` into `sink` as a JSON text frame,
/// until the sink fails or the channel closes.
pub(crate) async fn forward_events<S>(mut rx: broadcast::Receiver<Envelope>, mut sink: S, user_id: UserId)
where
    S: Sink<Frame> + Unpin,
{
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                if !envelope.is_for(&user_id) {
                    continue;
                }
                let Ok(text) = serde_json::to_string(&envelope.event) else {
                    continue;
                };
                if sink.send(Frame::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(%user_id, skipped, "event feed lagging");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn chat_ws(
    State(db_pool): State<SqlitePool>,
    State(events): State<broadcast::Sender<Envelope>>,
    session: Session,

    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let user_id = require_user(&session).await?;

    Ok(ws.on_upgrade(async move |stream| {
        let (sender, mut receiver) = stream.split();
        let feed_task = tokio::spawn(forward_events(events.subscribe(), sender, user_id.clone()));

        while let Some(Ok(frame)) = receiver.next().await {
            match frame {
                Frame::Text(_) | Frame::Binary(_) => {
                    handle_frame(&db_pool, &events, &user_id, &frame.into_data()).await;
                }
                Frame::Close(_) => break,
                _ => {}
            }
        }

        feed_task.abort();
    }).into_response())
}
