use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use parley_common::Envelope;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::SharedState;

const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let evicted = CancellationToken::new();
    let (id, mut outbound) = state.hub.subscribe({
        let evicted = evicted.clone();
        move || evicted.cancel()
    });
    info!(subscriber = id, "subscriber connected");

    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn({
        let evicted = evicted.clone();
        async move {
            loop {
                tokio::select! {
                    biased;
                    _ = evicted.cancelled() => {
                        let close = CloseFrame {
                            code: close_code::POLICY,
                            reason: "subscriber too slow".into(),
                        };
                        let _ = sink.send(Message::Close(Some(close))).await;
                        break;
                    }
                    frame = outbound.recv() => match frame {
                        Some(frame) => {
                            if sink.send(Message::Text(frame.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        }
    });

    let reader = async {
        while let Some(message) = stream.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text.to_string(),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!(subscriber = id, error = %e, "subscriber read failed");
                    break;
                }
            };
            match Envelope::decode(&text) {
                Ok(envelope) => {
                    debug!(subscriber = id, kind = envelope.kind(), "relaying envelope");
                    match envelope.encode() {
                        Ok(frame) => {
                            state.hub.broadcast_text(&frame);
                        }
                        Err(e) => warn!(error = %e, "failed to re-encode envelope"),
                    }
                }
                Err(e) => warn!(subscriber = id, error = %e, "skipping invalid envelope"),
            }
        }
    };

    tokio::select! {
        _ = reader => {}
        _ = &mut writer => {}
    }

    state.hub.unsubscribe(id);
    writer.abort();
    info!(subscriber = id, "subscriber disconnected");
}
