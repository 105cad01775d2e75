// src/roles/server_role.rs

//! The server role: a process supervisor that launches cluster worker
//! subprocesses on the brain's command and reports their deaths. The
//! Rust analogue of `multiprocessing.Process` in original `server.py` is
//! `tokio::process::Command`, re-invoking our own binary with a `cluster`
//! subcommand.

use crate::config::FleetConfig;
use crate::error::FleetError;
use crate::ipc::payload::Uid;
use crate::ipc::registry::{INFO_CLASS_SERVER, PresenceRegistry, ServerInfo, tag_info};
use crate::ipc::{CommandGroup, EventGroup, HubClient, HubClientConfig};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);
const REAP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct LaunchClusterArgs {
    shard_ids: Vec<u32>,
    shard_count: u32,
}

#[derive(Debug, Serialize)]
struct ClusterDiedArgs {
    smallest_shard_id: u32,
}

/// Tracks one launched worker subprocess, keyed by its smallest shard id
/// (the same stable key the brain uses for a `ClusterInfo`).
struct LaunchedCluster {
    smallest_shard_id: u32,
    child: Child,
}

pub async fn run(hub_uri: &str, config: &FleetConfig) -> Result<(), FleetError> {
    let mut client = HubClient::new(HubClientConfig {
        uri: hub_uri.to_string(),
        token: config.token.clone(),
        reconnect: true,
    });

    let clusters: Arc<DashMap<u32, LaunchedCluster>> = Arc::new(DashMap::new());
    let registry = Arc::new(PresenceRegistry::new());

    register_handlers(
        client.commands(),
        client.events(),
        clusters.clone(),
        registry.clone(),
        client.clone(),
    );

    let announce_client = client.clone();
    let announce_registry = registry.clone();
    tokio::spawn(broadcast_self(announce_client, announce_registry));

    let reap_client = client.clone();
    let reap_clusters = clusters.clone();
    tokio::spawn(reap_loop(reap_client, reap_clusters));

    info!("server role started");
    client.run().await
}

fn register_handlers(
    commands: &CommandGroup,
    events: &EventGroup,
    clusters: Arc<DashMap<u32, LaunchedCluster>>,
    registry: Arc<PresenceRegistry>,
    client: HubClient,
) {
    events.add(
        "set_info_class",
        Arc::new(move |_author: Uid, data: Value| {
            let registry = registry.clone();
            async move { registry.ingest_info_event(data) }
        }),
    );

    let launch_clusters = clusters.clone();
    let launch_client = client.clone();
    let result = commands.add(
        "launch_cluster",
        Arc::new(move |_author: Uid, data: Value| {
            let clusters = launch_clusters.clone();
            let client = launch_client.clone();
            async move {
                let args: LaunchClusterArgs = serde_json::from_value(data)
                    .map_err(|e| FleetError::Protocol(format!("invalid launch_cluster args: {e}")))?;
                launch_cluster(&clusters, client.uid(), args).await
            }
        }),
    );
    if let Err(e) = result {
        warn!(error = %e, "failed to register launch_cluster handler");
    }

    events.add(
        "server_stop",
        Arc::new(move |_author: Uid, _data: Value| {
            let client = client.clone();
            async move { client.request_shutdown() }
        }),
    );
}

async fn launch_cluster(
    clusters: &Arc<DashMap<u32, LaunchedCluster>>,
    server_uid: Uid,
    args: LaunchClusterArgs,
) -> Result<Value, FleetError> {
    let Some(&smallest_shard_id) = args.shard_ids.iter().min() else {
        return Err(FleetError::Protocol("launch_cluster requires at least one shard".into()));
    };

    let exe = std::env::current_exe().map_err(FleetError::from)?;
    let shard_arg = args.shard_ids.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
    let child = Command::new(exe)
        .arg("cluster")
        .arg("--shard-ids")
        .arg(&shard_arg)
        .arg("--shard-count")
        .arg(args.shard_count.to_string())
        .arg("--server-uid")
        .arg(server_uid.to_string())
        .kill_on_drop(true)
        .spawn()
        .map_err(FleetError::from)?;

    info!(shard_ids = ?args.shard_ids, pid = ?child.id(), "launched cluster worker");
    clusters.insert(smallest_shard_id, LaunchedCluster { smallest_shard_id, child });
    Ok(Value::Bool(true))
}

/// Every 5 seconds, reaps any worker subprocess that has exited and tells
/// the brain so it can reschedule those shards — original `server.py`'s
/// death-detection loop over `multiprocessing.Process.is_alive()`.
async fn reap_loop(client: HubClient, clusters: Arc<DashMap<u32, LaunchedCluster>>) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    loop {
        interval.tick().await;
        let mut dead = Vec::new();
        for mut entry in clusters.iter_mut() {
            if matches!(entry.child.try_wait(), Ok(Some(_))) {
                dead.push(*entry.key());
            }
        }
        for key in dead {
            if let Some((_, cluster)) = clusters.remove(&key) {
                warn!(shard_id = cluster.smallest_shard_id, "cluster worker died");
                let args = serde_json::to_value(ClusterDiedArgs {
                    smallest_shard_id: cluster.smallest_shard_id,
                })
                .unwrap_or(Value::Null);
                if let Err(e) = client.send_event(&client.client_uids(), "cluster_died", args).await {
                    warn!(error = %e, "failed to report cluster death");
                }
            }
        }
    }
}

async fn broadcast_self(client: HubClient, registry: Arc<PresenceRegistry>) {
    let mut interval = tokio::time::interval(ANNOUNCE_INTERVAL);
    loop {
        interval.tick().await;
        let self_uid = client.uid();
        let cluster_uids = registry
            .clusters()
            .into_iter()
            .filter(|c| c.server_uid == self_uid)
            .map(|c| c.uid)
            .collect();
        let info = ServerInfo {
            uid: self_uid,
            cluster_uids,
        };
        let data = match tag_info(INFO_CLASS_SERVER, &info) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "failed to encode server presence");
                continue;
            }
        };
        if let Err(e) = client.send_event(&client.client_uids(), "set_info_class", data).await {
            warn!(error = %e, "failed to broadcast server presence");
        }
    }
}
