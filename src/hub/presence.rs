// src/hub/presence.rs

//! Periodic broadcast of the connected-uid set to every client, so each
//! client's local `PresenceRegistry`/callback bookkeeping can detect
//! disconnects without a per-peer heartbeat. Grounded in original
//! `ipc_server.py`'s `_send_client_uids_loop`.

use crate::hub::state::HubState;
use crate::ipc::payload::PresenceFrame;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

const PRESENCE_INTERVAL: Duration = Duration::from_secs(5);

/// Runs until `shutdown_rx` fires. Spawned once by `hub::mod`, not
/// per-connection.
pub async fn run(state: Arc<HubState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(PRESENCE_INTERVAL);
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return,
            _ = interval.tick() => broadcast_presence(&state),
        }
    }
}

fn broadcast_presence(state: &HubState) {
    let frame = PresenceFrame::new(state.connected_uids());
    let text = match serde_json::to_string(&frame) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "failed to encode presence frame");
            return;
        }
    };

    for entry in state.clients.iter() {
        let _ = entry.value().try_send(Message::Text(text.clone().into()));
    }
}
