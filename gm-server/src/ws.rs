//! WebSocket handling for player connections.
//!
//! Each connection gets a writer task fed by a bounded channel. Turns run in
//! their own tasks so that a dropped connection never cancels a turn and the
//! reader keeps answering pings while the model works.

use crate::state::{send_all, AppState, ConnectParams};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use gm_core::error::ErrorKind;
use gm_core::protocol::{ClientMessage, ServerMessage, StreamEncoder};
use gm_core::Language;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Buffer size for per-connection message channel.
const CONNECTION_CHANNEL_BUFFER: usize = 256;

/// WebSocket upgrade handler - entry point for new connections.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, params: ConnectParams) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let connection_id = Uuid::new_v4();

    let (tx, mut rx) = mpsc::channel::<ServerMessage>(CONNECTION_CHANNEL_BUFFER);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg.to_json() {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!(error = %e, "Failed to encode server message"),
            }
        }
    });

    let (session_id, reattached) = state.attach(&params).await;
    let mut language = params.language(state.default_language);
    tracing::info!(
        connection_id = %connection_id,
        session_id = %session_id,
        reattached,
        "WebSocket connection established"
    );

    // New and returning clients both start from a sync so they learn the
    // session id, the phase and any check still waiting for a roll.
    match state.manager.snapshot(session_id).await {
        Ok(snapshot) => {
            let encoder = StreamEncoder::new(language, state.chunk_size);
            send_all(&tx, encoder.sync(snapshot)).await;
        }
        Err(e) => {
            let _ = tx.send(ServerMessage::error(e.to_string(), Some(e.kind()))).await;
        }
    }

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match ClientMessage::decode(&text) {
                Ok(ClientMessage::Ping) => {
                    let _ = tx.try_send(ServerMessage::Pong);
                }
                Ok(msg) => {
                    if let Some(lang) = message_language(&msg) {
                        language = lang;
                    }
                    let state = state.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        state.run_turn(session_id, msg, language, &tx).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(connection_id = %connection_id, error = %e, "Failed to parse message");
                    let _ = tx.try_send(ServerMessage::error(
                        format!("Invalid message format: {e}"),
                        Some(ErrorKind::ProtocolError),
                    ));
                }
            },
            Ok(Message::Ping(_)) => {
                let _ = tx.try_send(ServerMessage::Pong);
            }
            Ok(Message::Close(_)) => {
                tracing::info!(connection_id = %connection_id, "WebSocket closed by client");
                break;
            }
            Err(e) => {
                tracing::error!(connection_id = %connection_id, error = %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    // Let in-flight turns finish writing before the writer goes away.
    drop(tx);
    if tokio::time::timeout(std::time::Duration::from_secs(1), send_task)
        .await
        .is_err()
    {
        tracing::debug!(connection_id = %connection_id, "Writer still busy at close");
    }

    tracing::info!(
        connection_id = %connection_id,
        session_id = %session_id,
        "WebSocket connection terminated"
    );
}

fn message_language(msg: &ClientMessage) -> Option<Language> {
    match msg {
        ClientMessage::PlayerInput { lang, .. } | ClientMessage::DiceResult { lang, .. } => *lang,
        ClientMessage::Ping => None,
    }
}
