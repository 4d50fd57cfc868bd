use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use eel_core::Session;
use futures::{future, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;

/// Run one WebSocket as the session's connection until the peer goes away.
///
/// A writer task drains the session's outbound channel into the socket; the
/// read half is handed to [`Session::serve`] as a stream of text frames.
pub async fn handle_ws_connection(socket: WebSocket, session: Arc<Session>) {
    let (mut ws_tx, ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    session.serve(out_tx, inbound_text(ws_rx)).await;

    // The session dropped its sender on disconnect, so the writer finishes
    // once the queue is flushed.
    if tokio::time::timeout(std::time::Duration::from_secs(1), writer)
        .await
        .is_err()
    {
        tracing::debug!("writer still busy after disconnect, dropping it");
    }
}

/// Text payloads of `frames`, ending at the first Close frame or transport
/// error.
pub fn inbound_text<S, E>(frames: S) -> impl Stream<Item = String> + Send
where
    S: Stream<Item = Result<WsMessage, E>> + Send,
    E: std::fmt::Display + Send,
{
    frames
        .take_while(|frame| {
            let open = match frame {
                Ok(WsMessage::Close(_)) => false,
                Ok(_) => true,
                Err(e) => {
                    tracing::debug!(error = %e, "websocket read failed");
                    false
                }
            };
            future::ready(open)
        })
        .filter_map(|frame| future::ready(frame.ok().and_then(frame_text)))
}

fn frame_text(frame: WsMessage) -> Option<String> {
    match frame {
        WsMessage::Text(text) => Some(text.as_str().to_owned()),
        WsMessage::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Some(text),
            Err(_) => {
                tracing::warn!(len = bytes.len(), "dropping non-UTF-8 binary frame");
                None
            }
        },
        // axum answers pings itself
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Close(_) => None,
    }
}
