// src/roles/brain.rs

//! The placement controller: decides which server should launch the next
//! cluster of shards and when, reacting to clusters dying and to shutdown
//! requests. Grounded in original `brain.py`'s `_get_next_cluster_to_launch`
//! and `waiting_for` bookkeeping.

use crate::config::FleetConfig;
use crate::error::FleetError;
use crate::ipc::payload::Uid;
use crate::ipc::registry::{BrainInfo, ClusterInfo, INFO_CLASS_BRAIN, PresenceRegistry, tag_info};
use crate::ipc::{EventGroup, HubClient, HubClientConfig};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// How often the brain re-evaluates placement and re-announces itself.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, serde::Deserialize)]
struct ClusterDiedArgs {
    smallest_shard_id: u32,
}

/// `(server_uid, smallest shard id of the pending launch)`. Only one
/// launch is ever outstanding at a time — the brain never starts a second
/// cluster until the previous one reports ready.
type WaitingFor = Arc<Mutex<Option<(Uid, u32)>>>;

/// Picks the next `(server_uid, shard_ids, total_shards)` to launch, given
/// the fleet's current presence. Returns `None` if a launch is already
/// outstanding, if any known cluster isn't ready yet (launches serialize),
/// if every server is already at `clusters_per_server` capacity, or if
/// every shard up to `total_shards` is already live.
fn next_cluster_to_launch(
    registry: &PresenceRegistry,
    waiting_for: &Option<(Uid, u32)>,
    total_servers: usize,
    clusters_per_server: usize,
    shards_per_cluster: usize,
) -> Option<(Uid, Vec<u32>, u32)> {
    if waiting_for.is_some() {
        return None;
    }

    let clusters = registry.clusters();
    if clusters.iter().any(|c| !c.ready) {
        return None;
    }

    let mut servers = registry.servers();
    servers.sort_by_key(|s| s.uid);
    let target = servers
        .into_iter()
        .find(|s| clusters.iter().filter(|c| c.server_uid == s.uid).count() < clusters_per_server)?;

    let total_shards = (total_servers * clusters_per_server * shards_per_cluster) as u32;
    let live: HashSet<u32> = registry.live_shards().into_iter().collect();
    let needed: Vec<u32> = (0..total_shards).filter(|s| !live.contains(s)).collect();
    if needed.len() < shards_per_cluster {
        return None;
    }

    Some((target.uid, needed[..shards_per_cluster].to_vec(), total_shards))
}

/// Clears `waiting_for` once the server it targeted disappears, or the
/// shard it was waiting on shows up as live — read lazily on every tick
/// rather than driven by a notification, per the original's polling design.
fn invalidate_waiting_for(waiting_for: &mut Option<(Uid, u32)>, registry: &PresenceRegistry) {
    let Some((server_uid, min_shard)) = *waiting_for else {
        return;
    };
    let server_present = registry.servers().iter().any(|s| s.uid == server_uid);
    let shard_live = registry.live_shards().contains(&min_shard);
    if !server_present || shard_live {
        *waiting_for = None;
    }
}

/// Runs the brain role until shutdown. Connects to the hub, keeps a
/// presence registry in sync via `set_info_class` events, and drives
/// placement on a 1Hz tick.
pub async fn run(hub_uri: &str, config: &FleetConfig) -> Result<(), FleetError> {
    let mut client = HubClient::new(HubClientConfig {
        uri: hub_uri.to_string(),
        token: config.token.clone(),
        reconnect: true,
    });

    let registry = Arc::new(PresenceRegistry::new());
    let waiting_for: WaitingFor = Arc::new(Mutex::new(None));

    register_handlers(client.events(), registry.clone(), waiting_for.clone(), client.clone());

    let announce_client = client.clone();
    tokio::spawn(broadcast_self(announce_client));

    let placement_client = client.clone();
    let placement_registry = registry.clone();
    let placement_waiting = waiting_for.clone();
    let (total_servers, clusters_per_server, shards_per_cluster) =
        (config.total_servers, config.clusters_per_server, config.shards_per_cluster);
    tokio::spawn(placement_loop(
        placement_client,
        placement_registry,
        placement_waiting,
        total_servers,
        clusters_per_server,
        shards_per_cluster,
    ));

    info!("brain started");
    client.run().await
}

fn register_handlers(
    events: &EventGroup,
    registry: Arc<PresenceRegistry>,
    waiting_for: WaitingFor,
    client: HubClient,
) {
    let set_info_registry = registry.clone();
    events.add(
        "set_info_class",
        Arc::new(move |_author: Uid, data: serde_json::Value| {
            let registry = set_info_registry.clone();
            async move { registry.ingest_info_event(data) }
        }),
    );

    let died_waiting = waiting_for.clone();
    let died_registry = registry.clone();
    events.add(
        "cluster_died",
        Arc::new(move |_author: Uid, data: serde_json::Value| {
            let waiting = died_waiting.clone();
            let registry = died_registry.clone();
            async move {
                let Ok(args) = serde_json::from_value::<ClusterDiedArgs>(data) else {
                    return;
                };
                if let Some(cluster) = registry
                    .clusters()
                    .into_iter()
                    .find(|c| c.smallest_shard() == Some(args.smallest_shard_id))
                {
                    registry.remove_cluster(cluster.uid);
                }
                let mut slot = waiting.lock().unwrap();
                if matches!(*slot, Some((_, shard)) if shard == args.smallest_shard_id) {
                    *slot = None;
                }
                warn!(shard_id = args.smallest_shard_id, "cluster died, will reschedule");
            }
        }),
    );

    events.add(
        "brain_stop",
        Arc::new({
            let client = client.clone();
            move |_author: Uid, _data: serde_json::Value| {
                let client = client.clone();
                async move { client.request_shutdown() }
            }
        }),
    );

    events.add(
        "shutdown",
        Arc::new(move |_author: Uid, _data: serde_json::Value| {
            let client = client.clone();
            let registry = registry.clone();
            async move {
                let server_uids: Vec<Uid> = registry.servers().into_iter().map(|s| s.uid).collect();
                if let Err(e) = client.send_event(&server_uids, "server_stop", serde_json::Value::Null).await {
                    warn!(error = %e, "failed to notify servers of shutdown");
                }
                client.request_shutdown();
            }
        }),
    );
}

/// Broadcasts this brain's own presence every tick.
async fn broadcast_self(client: HubClient) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    loop {
        interval.tick().await;
        let info = BrainInfo { uid: client.uid() };
        let data = match tag_info(INFO_CLASS_BRAIN, &info) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "failed to encode brain presence");
                continue;
            }
        };
        if let Err(e) = client.send_event(&client.client_uids(), "set_info_class", data).await {
            warn!(error = %e, "failed to broadcast brain presence");
        }
    }
}

/// Drives placement: each tick, picks the next cluster to launch (if any)
/// and asks the target server to launch it, recording the pending launch
/// in `waiting_for` until presence shows the shard as live.
async fn placement_loop(
    client: HubClient,
    registry: Arc<PresenceRegistry>,
    waiting_for: WaitingFor,
    total_servers: usize,
    clusters_per_server: usize,
    shards_per_cluster: usize,
) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    loop {
        interval.tick().await;

        let target = {
            let mut slot = waiting_for.lock().unwrap();
            invalidate_waiting_for(&mut slot, &registry);
            next_cluster_to_launch(&registry, &slot, total_servers, clusters_per_server, shards_per_cluster)
        };
        let Some((server_uid, shard_ids, total_shards)) = target else {
            continue;
        };

        *waiting_for.lock().unwrap() = shard_ids.iter().min().map(|min| (server_uid, *min));

        let args = serde_json::json!({ "shard_ids": shard_ids, "shard_count": total_shards });
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.send_command(&[server_uid], "launch_cluster", args).await {
                warn!(error = %e, "launch_cluster command failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_server(uid: Uid, cluster_uids: Vec<Uid>) -> crate::ipc::registry::ServerInfo {
        crate::ipc::registry::ServerInfo { uid, cluster_uids }
    }

    #[test]
    fn picks_first_unowned_shard_range() {
        let registry = PresenceRegistry::new();
        registry.update_server(sample_server(1, vec![]));
        let (server, shards, total) = next_cluster_to_launch(&registry, &None, 1, 2, 2).unwrap();
        assert_eq!(server, 1);
        assert_eq!(shards, vec![0, 1]);
        assert_eq!(total, 4);
    }

    #[test]
    fn skips_shards_already_owned() {
        let registry = PresenceRegistry::new();
        registry.update_server(sample_server(1, vec![10]));
        registry.update_cluster(ClusterInfo {
            uid: 10,
            server_uid: 1,
            shard_ids: vec![0, 1],
            ready: true,
        });
        let (_server, shards, _total) = next_cluster_to_launch(&registry, &None, 2, 2, 2).unwrap();
        assert_eq!(shards, vec![2, 3]);
    }

    #[test]
    fn returns_none_once_fully_launched() {
        let registry = PresenceRegistry::new();
        registry.update_server(sample_server(1, vec![10]));
        registry.update_cluster(ClusterInfo {
            uid: 10,
            server_uid: 1,
            shard_ids: vec![0, 1],
            ready: true,
        });
        assert!(next_cluster_to_launch(&registry, &None, 1, 1, 2).is_none());
    }

    #[test]
    fn skips_servers_already_at_capacity() {
        let registry = PresenceRegistry::new();
        registry.update_server(sample_server(1, vec![10]));
        registry.update_server(sample_server(2, vec![]));
        registry.update_cluster(ClusterInfo {
            uid: 10,
            server_uid: 1,
            shard_ids: vec![0, 1],
            ready: true,
        });
        let (server, _shards, _total) = next_cluster_to_launch(&registry, &None, 2, 1, 2).unwrap();
        assert_eq!(server, 2);
    }

    #[test]
    fn skips_while_a_launch_is_outstanding() {
        let registry = PresenceRegistry::new();
        registry.update_server(sample_server(1, vec![]));
        let waiting = Some((1, 0));
        assert!(next_cluster_to_launch(&registry, &waiting, 1, 2, 2).is_none());
    }

    #[test]
    fn skips_while_any_known_cluster_is_not_ready() {
        let registry = PresenceRegistry::new();
        registry.update_server(sample_server(1, vec![10]));
        registry.update_cluster(ClusterInfo {
            uid: 10,
            server_uid: 1,
            shard_ids: vec![0, 1],
            ready: false,
        });
        assert!(next_cluster_to_launch(&registry, &None, 2, 2, 2).is_none());
    }

    #[test]
    fn invalidate_clears_slot_once_shard_goes_live() {
        let registry = PresenceRegistry::new();
        registry.update_server(sample_server(1, vec![10]));
        registry.update_cluster(ClusterInfo {
            uid: 10,
            server_uid: 1,
            shard_ids: vec![0, 1],
            ready: true,
        });
        let mut waiting = Some((1, 0));
        invalidate_waiting_for(&mut waiting, &registry);
        assert!(waiting.is_none());
    }

    #[test]
    fn invalidate_clears_slot_once_server_disappears() {
        let registry = PresenceRegistry::new();
        let mut waiting = Some((99, 0));
        invalidate_waiting_for(&mut waiting, &registry);
        assert!(waiting.is_none());
    }
}
