//! WebSocket handling for viewers
//!
//! Each socket is split: a writer task drains the connection's outbound queue
//! and the reader loop feeds inbound text and pongs to the hub.

use crate::hub::{BroadcastHub, ClientConnection, Outbound};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub async fn handle_connection(socket: WebSocket, hub: Arc<BroadcastHub>, buffer: usize) {
    let (conn, mut outbound_rx) = ClientConnection::open(buffer);
    let (mut ws_tx, mut ws_rx) = socket.split();
    let token = conn.shutdown_token();

    let writer_conn = conn.clone();
    let writer_token = token.clone();
    let writer = tokio::spawn(async move {
        loop {
            // Drain queued frames before honouring cancellation so a queued
            // close frame still goes out.
            let frame = tokio::select! {
                biased;
                frame = outbound_rx.recv() => frame,
                _ = writer_token.cancelled() => None,
            };
            let sent = match frame {
                Some(Outbound::Text(text)) => ws_tx.send(WsMessage::Text(text)).await,
                Some(Outbound::Ping) => ws_tx.send(WsMessage::Ping(Vec::new())).await,
                Some(Outbound::Close) => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
                None => break,
            };
            if let Err(e) = sent {
                debug!(client = %writer_conn.id(), "Socket write failed: {}", e);
                break;
            }
        }
        writer_conn.mark_closed();
    });

    if !hub.register(conn.clone()) {
        conn.close();
        let _ = writer.await;
        return;
    }

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => hub.on_message(&conn, &text),
                    Some(Ok(WsMessage::Pong(_))) => hub.on_pong(&conn),
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!(client = %conn.id(), "Viewer disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(client = %conn.id(), "WebSocket error: {}", e);
                        break;
                    }
                    _ => {} // Binary, Ping (answered by the transport)
                }
            }
        }
    }

    hub.deregister(conn.id());
    conn.close();
    let _ = writer.await;
}
