// src/roles/cluster.rs

//! The cluster role: wraps a set of Discord gateway shards and announces
//! itself to the fleet. Grounded in original `cluster.py`/`base_client.py`:
//! a cluster is "ready" once every shard it owns has connected, and it
//! periodically broadcasts its own `ClusterInfo` the same way every role
//! client does via `_broadcast_info_loop`.

use crate::config::FleetConfig;
use crate::error::FleetError;
use crate::ipc::payload::Uid;
use crate::ipc::registry::{ClusterInfo, INFO_CLASS_CLUSTER, tag_info};
use crate::ipc::{EventGroup, HubClient, HubClientConfig};
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);

/// Tracks which of this cluster's shards have finished connecting.
/// `ready()` mirrors the original's `len(self.shards) == len(self.shard_ids)`.
#[derive(Clone)]
pub struct ShardTracker {
    shard_ids: Arc<Vec<u32>>,
    connected: Arc<DashSet<u32>>,
}

impl ShardTracker {
    pub fn new(shard_ids: Vec<u32>) -> Self {
        Self {
            shard_ids: Arc::new(shard_ids),
            connected: Arc::new(DashSet::new()),
        }
    }

    pub fn mark_connected(&self, shard_id: u32) {
        self.connected.insert(shard_id);
    }

    pub fn mark_disconnected(&self, shard_id: u32) {
        self.connected.remove(&shard_id);
    }

    pub fn ready(&self) -> bool {
        self.connected.len() == self.shard_ids.len()
    }

    pub fn shard_ids(&self) -> &[u32] {
        &self.shard_ids
    }
}

pub async fn run(
    hub_uri: &str,
    config: &FleetConfig,
    server_uid: Uid,
    shard_ids: Vec<u32>,
) -> Result<(), FleetError> {
    let mut client = HubClient::new(HubClientConfig {
        uri: hub_uri.to_string(),
        token: config.token.clone(),
        reconnect: true,
    });

    let shards = ShardTracker::new(shard_ids);
    register_handlers(client.events());

    let announce_client = client.clone();
    let announce_shards = shards.clone();
    tokio::spawn(broadcast_self(announce_client, server_uid, announce_shards));

    info!(shard_ids = ?shards.shard_ids(), "cluster started");
    client.run().await
}

fn register_handlers(events: &EventGroup) {
    events.add(
        "shutdown",
        Arc::new(|_author: Uid, _data: serde_json::Value| async move {
            info!("shutdown requested by hub");
        }),
    );
}

async fn broadcast_self(client: HubClient, server_uid: Uid, shards: ShardTracker) {
    let mut interval = tokio::time::interval(ANNOUNCE_INTERVAL);
    loop {
        interval.tick().await;
        let info = ClusterInfo {
            uid: client.uid(),
            server_uid,
            shard_ids: shards.shard_ids().to_vec(),
            ready: shards.ready(),
        };
        let data = match tag_info(INFO_CLASS_CLUSTER, &info) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "failed to encode cluster presence");
                continue;
            }
        };
        if let Err(e) = client.send_event(&client.client_uids(), "set_info_class", data).await {
            warn!(error = %e, "failed to broadcast cluster presence");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_once_every_shard_connects() {
        let tracker = ShardTracker::new(vec![0, 1, 2]);
        assert!(!tracker.ready());
        tracker.mark_connected(0);
        tracker.mark_connected(1);
        assert!(!tracker.ready());
        tracker.mark_connected(2);
        assert!(tracker.ready());
    }

    #[test]
    fn disconnect_drops_ready() {
        let tracker = ShardTracker::new(vec![0, 1]);
        tracker.mark_connected(0);
        tracker.mark_connected(1);
        assert!(tracker.ready());
        tracker.mark_disconnected(0);
        assert!(!tracker.ready());
    }
}
