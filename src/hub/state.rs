// src/hub/state.rs

//! Shared hub state: the auth token, uid allocation, and the table of
//! connected clients' outbound channels. An `Arc`-shared struct handed to
//! every per-connection task.

use crate::ipc::payload::Uid;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

pub struct HubState {
    pub token: String,
    next_uid: AtomicU32,
    pub clients: DashMap<Uid, mpsc::Sender<Message>>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl HubState {
    pub fn new(token: String) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            token,
            next_uid: AtomicU32::new(1),
            clients: DashMap::new(),
            shutdown_tx,
        }
    }

    pub fn allocate_uid(&self) -> Uid {
        self.next_uid.fetch_add(1, Ordering::Relaxed)
    }

    pub fn connected_uids(&self) -> Vec<Uid> {
        self.clients.iter().map(|e| *e.key()).collect()
    }

    /// Forward a raw wire frame to every uid in `recipients` that is still
    /// connected, exactly as `ipc_server.py`'s `_dispatch` forwards the
    /// undecoded message bytes.
    pub fn route_raw(&self, recipients: &[Uid], raw: &str) {
        for uid in recipients {
            if let Some(sender) = self.clients.get(uid) {
                let _ = sender.try_send(Message::Text(raw.to_string().into()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_uid_is_monotonic_and_starts_at_one() {
        let state = HubState::new("secret".into());
        assert_eq!(state.allocate_uid(), 1);
        assert_eq!(state.allocate_uid(), 2);
        assert_eq!(state.allocate_uid(), 3);
    }

    #[test]
    fn connected_uids_reflects_clients_table() {
        let state = HubState::new("secret".into());
        let (tx, _rx) = mpsc::channel(1);
        state.clients.insert(5, tx);
        assert_eq!(state.connected_uids(), vec![5]);
    }
}
