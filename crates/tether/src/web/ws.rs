//! WebSocket handler: one relay session per connection.
//!
//! Text protocol in both directions, one JSON envelope per message:
//!   client → server  `{"event": "<command>", "data": {...}}`
//!   server → client  `{"event": "<event>", "data": ...}`
//! Binary messages from the client are rejected and logged.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::ProtocolError;
use crate::server::{Relay, SessionId};

/// Commands waiting behind the one being applied
const COMMAND_QUEUE: usize = 32;

/// Handle a single WebSocket connection.
///
/// Outbound events come from the session queue; each socket write is
/// bounded by `send_timeout`, and a failed or timed-out write ends only
/// this connection. Commands run on a separate task in arrival order, so
/// a slow actuator never stops the queue from draining.
pub async fn handle_ws(socket: WebSocket, relay: Relay, send_timeout: Duration, cancel: CancellationToken) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut session = relay.open_session();
    let id = session.id();
    debug!(session = id, "WebSocket client connected");

    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
    let worker = tokio::spawn(run_commands(relay.clone(), id, cmd_rx));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                send_bounded(&mut ws_tx, Message::Close(None), send_timeout, id).await;
                break;
            }
            // Forward queued events to the client
            event = session.recv() => {
                let Some(event) = event else {
                    debug!(session = id, "Session closed by relay");
                    send_bounded(&mut ws_tx, Message::Close(None), send_timeout, id).await;
                    break;
                };
                let text = match event.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(session = id, event = event.name(), "Failed to encode event: {}", e);
                        continue;
                    }
                };
                if !send_bounded(&mut ws_tx, Message::Text(text.into()), send_timeout, id).await {
                    break;
                }
            }
            // Commands from the client
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if cmd_tx.try_send(text.as_str().to_owned()).is_err() {
                            warn!(session = id, "Command queue full, dropping command");
                        }
                    }
                    Some(Ok(Message::Binary(_))) => relay.reject(id, &ProtocolError::Binary),
                    // Pings are answered by the protocol layer
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(session = id, "WebSocket receive error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    // The worker finishes the command in flight, then sees the queue end
    drop(cmd_tx);
    relay.close_session(id);
    if let Err(e) = worker.await {
        warn!(session = id, "Command worker failed: {}", e);
    }
    debug!(session = id, "WebSocket client disconnected");
}

/// Apply commands from one connection in order
async fn run_commands(relay: Relay, id: SessionId, mut commands: mpsc::Receiver<String>) {
    while let Some(text) = commands.recv().await {
        relay.handle_message(id, &text).await;
    }
}

/// Write one message within `timeout`. Returns false if the connection should end.
async fn send_bounded(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    msg: Message,
    timeout: Duration,
    id: SessionId,
) -> bool {
    match tokio::time::timeout(timeout, ws_tx.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(session = id, "WebSocket send failed: {}", e);
            false
        }
        Err(_) => {
            warn!(session = id, "WebSocket send timed out after {:?}", timeout);
            false
        }
    }
}
