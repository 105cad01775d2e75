// src/hub/connection.rs

//! Per-connection handshake and serve loop.
//!
//! Grounded in original `ipc_server.py`: `_handshake` validates the token
//! and closes with an "Invalid Token" reason on mismatch, otherwise
//! allocates a uid and replies with `{"uid", "client_uids"}`; `_serve`
//! then reads frames and forwards them via `_dispatch` without needing to
//! fully understand their contents — it only needs `recipients`. Cleanup
//! of the uid from the shared client table on disconnect follows the RAII
//! idiom of `connection/guard.rs`'s `ConnectionGuard`.

use crate::error::FleetError;
use crate::hub::state::HubState;
use crate::hub::stream::AnyStream;
use crate::ipc::payload::{INVALID_TOKEN_CLOSE_CODE, Uid};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, frame::coding::CloseCode};
use tracing::{info, warn};

#[derive(Deserialize)]
struct HandshakeRequest {
    token: String,
}

/// Just enough of the wire envelope to route a frame without fully
/// decoding its `Payload` variant, mirroring `_dispatch`'s shallow parse.
#[derive(Deserialize)]
struct PeekEnvelope {
    recipients: Vec<Uid>,
}

/// Deregisters the connection's uid from the shared client table on drop,
/// so an early return or a dropped task can never leak a stale entry.
struct ClientGuard {
    state: Arc<HubState>,
    uid: Uid,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        if self.state.clients.remove(&self.uid).is_none() {
            warn!(uid = self.uid, "connection guard: uid already absent from client table");
        } else {
            info!(uid = self.uid, "client disconnected");
        }
    }
}

/// Accept a single client connection: `WebSocket` upgrade, handshake,
/// serve loop. Runs until the peer disconnects or the hub shuts down.
pub async fn handle_connection(
    state: Arc<HubState>,
    stream: AnyStream,
    addr: SocketAddr,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%addr, error = %e, "websocket upgrade failed");
            return;
        }
    };

    if let Err(e) = serve(state, ws, addr, &mut shutdown_rx).await {
        warn!(%addr, error = %e, "connection terminated");
    }
}

async fn serve(
    state: Arc<HubState>,
    ws: WebSocketStream<AnyStream>,
    addr: SocketAddr,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<(), FleetError> {
    let (mut writer, mut reader) = ws.split();

    let uid = match handshake(&state, &mut writer, &mut reader).await {
        Ok(uid) => uid,
        Err(e) => {
            warn!(%addr, error = %e, "handshake failed");
            return Err(e);
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(256);
    state.clients.insert(uid, outbound_tx);
    let _guard = ClientGuard {
        state: state.clone(),
        uid,
    };
    info!(uid, %addr, "client connected");

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                let _ = writer.send(Message::Close(None)).await;
                return Ok(());
            }
            Some(out) = outbound_rx.recv() => {
                if writer.send(out).await.is_err() {
                    return Ok(());
                }
            }
            msg = reader.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => route_frame(&state, &text),
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
    }
}

fn route_frame(state: &HubState, raw: &str) {
    match serde_json::from_str::<PeekEnvelope>(raw) {
        Ok(envelope) => state.route_raw(&envelope.recipients, raw),
        Err(e) => warn!(error = %e, "dropping malformed frame"),
    }
}

async fn handshake(
    state: &Arc<HubState>,
    writer: &mut futures::stream::SplitSink<WebSocketStream<AnyStream>, Message>,
    reader: &mut futures::stream::SplitStream<WebSocketStream<AnyStream>>,
) -> Result<Uid, FleetError> {
    let text = match reader.next().await {
        Some(Ok(Message::Text(text))) => text,
        Some(Ok(_)) | None => {
            return Err(FleetError::Protocol("handshake: expected text frame".into()));
        }
        Some(Err(e)) => return Err(e.into()),
    };

    let request: HandshakeRequest = serde_json::from_str(&text)?;
    if request.token != state.token {
        let frame = CloseFrame {
            code: CloseCode::from(INVALID_TOKEN_CLOSE_CODE),
            reason: "Invalid Token".into(),
        };
        let _ = writer.send(Message::Close(Some(frame))).await;
        return Err(FleetError::InvalidIpcToken);
    }

    let uid = state.allocate_uid();
    let ack = serde_json::json!({
        "uid": uid,
        "client_uids": state.connected_uids(),
    });
    writer.send(Message::Text(serde_json::to_string(&ack)?.into())).await?;
    Ok(uid)
}
