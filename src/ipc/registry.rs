// src/ipc/registry.rs

//! Presence/info-class registry.
//!
//! Grounded in original `info_classes.py`: every role client periodically
//! broadcasts a `set_info_class` event describing itself (`ServerInfo`,
//! `ClusterInfo`, `BrainInfo`), and every other client keeps a local mirror
//! of the fleet's presence keyed by info-class id, then by uid.

use crate::ipc::payload::Uid;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Discriminates which `InfoClass` a `set_info_class` event carries,
/// mirroring `BaseInfo.__init_subclass__`'s auto-registered class id.
pub type InfoClassId = u8;

pub const INFO_CLASS_SERVER: InfoClassId = 0;
pub const INFO_CLASS_CLUSTER: InfoClassId = 1;
pub const INFO_CLASS_BRAIN: InfoClassId = 2;

/// Top-level tag every `set_info_class` event's `data` carries alongside
/// the flattened `InfoRecord` fields, identifying which one it is.
pub const INFO_CLASS_TAG: &str = "_info_class_id";

/// Builds the wire `data` for a `set_info_class` event: `info`'s own
/// fields, flattened, plus a top-level [`INFO_CLASS_TAG`].
pub fn tag_info(class: InfoClassId, info: &impl Serialize) -> serde_json::Result<Value> {
    let mut value = serde_json::to_value(info)?;
    if let Value::Object(map) = &mut value {
        map.insert(INFO_CLASS_TAG.to_string(), Value::from(class));
    }
    Ok(value)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub uid: Uid,
    pub cluster_uids: Vec<Uid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub uid: Uid,
    pub server_uid: Uid,
    pub shard_ids: Vec<u32>,
    pub ready: bool,
}

impl ClusterInfo {
    /// The lowest shard id this cluster owns — used as the cluster's
    /// stable identity key by the brain.
    pub fn smallest_shard(&self) -> Option<u32> {
        self.shard_ids.iter().copied().min()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrainInfo {
    pub uid: Uid,
}

/// Mirrors the fleet's presence as seen from any one connected client:
/// which uids are currently connected to the hub, and the latest
/// self-reported info for each known server/cluster/brain.
#[derive(Default)]
pub struct PresenceRegistry {
    client_uids: DashMap<Uid, ()>,
    servers: DashMap<Uid, ServerInfo>,
    clusters: DashMap<Uid, ClusterInfo>,
    brains: DashMap<Uid, BrainInfo>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_client_uids(&self, uids: &[Uid]) {
        self.client_uids.clear();
        for uid in uids {
            self.client_uids.insert(*uid, ());
        }
        // Drop presence entries for uids that disconnected.
        self.servers.retain(|uid, _| self.client_uids.contains_key(uid));
        self.clusters.retain(|uid, _| self.client_uids.contains_key(uid));
        self.brains.retain(|uid, _| self.client_uids.contains_key(uid));
    }

    pub fn is_connected(&self, uid: Uid) -> bool {
        self.client_uids.contains_key(&uid)
    }

    pub fn client_uids(&self) -> Vec<Uid> {
        self.client_uids.iter().map(|e| *e.key()).collect()
    }

    pub fn update_server(&self, info: ServerInfo) {
        self.servers.insert(info.uid, info);
    }

    pub fn update_cluster(&self, info: ClusterInfo) {
        self.clusters.insert(info.uid, info);
    }

    pub fn update_brain(&self, info: BrainInfo) {
        self.brains.insert(info.uid, info);
    }

    /// Decodes a `set_info_class` event's `data` by its [`INFO_CLASS_TAG`]
    /// and folds it into the matching table. An unrecognized or malformed
    /// tag is dropped — the sender simply re-announces on the next tick.
    pub fn ingest_info_event(&self, data: Value) {
        let Some(class) = data.get(INFO_CLASS_TAG).and_then(Value::as_u64) else {
            return;
        };
        match class as InfoClassId {
            INFO_CLASS_SERVER => match serde_json::from_value::<ServerInfo>(data) {
                Ok(info) => self.update_server(info),
                Err(e) => warn!(error = %e, "malformed ServerInfo in set_info_class"),
            },
            INFO_CLASS_CLUSTER => match serde_json::from_value::<ClusterInfo>(data) {
                Ok(info) => self.update_cluster(info),
                Err(e) => warn!(error = %e, "malformed ClusterInfo in set_info_class"),
            },
            INFO_CLASS_BRAIN => match serde_json::from_value::<BrainInfo>(data) {
                Ok(info) => self.update_brain(info),
                Err(e) => warn!(error = %e, "malformed BrainInfo in set_info_class"),
            },
            other => warn!(class = other, "unknown info class in set_info_class"),
        }
    }

    pub fn servers(&self) -> Vec<ServerInfo> {
        self.servers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn clusters(&self) -> Vec<ClusterInfo> {
        self.clusters.iter().map(|e| e.value().clone()).collect()
    }

    /// The current brain's info, or `None` if no brain has announced
    /// itself yet. If more than one brain is present (e.g. during a
    /// handover), the highest uid wins and a warning is logged.
    pub fn brain(&self) -> Option<BrainInfo> {
        if self.brains.len() > 1 {
            warn!(count = self.brains.len(), "multiple brains present in presence registry");
        }
        self.brains.iter().max_by_key(|e| *e.key()).map(|e| e.value().clone())
    }

    /// Every shard id currently owned by some cluster, fleet-wide,
    /// regardless of readiness.
    pub fn all_shards(&self) -> Vec<u32> {
        self.clusters
            .iter()
            .flat_map(|e| e.value().shard_ids.clone())
            .collect()
    }

    /// Shards owned by clusters that are fully acknowledged three ways:
    /// the cluster reports `ready`, its claimed server is present, and
    /// that server in turn lists the cluster among its own `cluster_uids`.
    /// A cluster missing any leg of this handshake doesn't count as live,
    /// so the brain won't skip re-launching its shards.
    pub fn live_shards(&self) -> Vec<u32> {
        self.clusters
            .iter()
            .filter(|e| {
                let cluster = e.value();
                cluster.ready
                    && self
                        .servers
                        .get(&cluster.server_uid)
                        .is_some_and(|server| server.cluster_uids.contains(&cluster.uid))
            })
            .flat_map(|e| e.value().shard_ids.clone())
            .collect()
    }

    pub fn remove_cluster(&self, uid: Uid) {
        self.clusters.remove(&uid);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_client_uids_evicts_stale_presence() {
        let reg = PresenceRegistry::new();
        reg.update_cluster(ClusterInfo {
            uid: 5,
            server_uid: 1,
            shard_ids: vec![0, 1],
            ready: true,
        });
        reg.set_client_uids(&[5]);
        assert_eq!(reg.clusters().len(), 1);

        reg.set_client_uids(&[]);
        assert_eq!(reg.clusters().len(), 0);
    }

    #[test]
    fn smallest_shard_picks_min() {
        let info = ClusterInfo {
            uid: 1,
            server_uid: 1,
            shard_ids: vec![4, 1, 2],
            ready: false,
        };
        assert_eq!(info.smallest_shard(), Some(1));
    }

    #[test]
    fn tag_info_flattens_fields_with_class_tag() {
        let value = tag_info(INFO_CLASS_BRAIN, &BrainInfo { uid: 9 }).unwrap();
        assert_eq!(value["uid"], 9);
        assert_eq!(value[INFO_CLASS_TAG], INFO_CLASS_BRAIN);
    }

    #[test]
    fn ingest_info_event_routes_by_tag() {
        let reg = PresenceRegistry::new();

        let server = tag_info(INFO_CLASS_SERVER, &ServerInfo { uid: 1, cluster_uids: vec![5] }).unwrap();
        reg.ingest_info_event(server);
        assert_eq!(reg.servers().len(), 1);

        let cluster = tag_info(
            INFO_CLASS_CLUSTER,
            &ClusterInfo { uid: 5, server_uid: 1, shard_ids: vec![0], ready: true },
        )
        .unwrap();
        reg.ingest_info_event(cluster);
        assert_eq!(reg.clusters().len(), 1);

        let brain = tag_info(INFO_CLASS_BRAIN, &BrainInfo { uid: 2 }).unwrap();
        reg.ingest_info_event(brain);
        assert_eq!(reg.brain().unwrap().uid, 2);
    }

    #[test]
    fn ingest_info_event_ignores_untagged_data() {
        let reg = PresenceRegistry::new();
        reg.ingest_info_event(serde_json::json!({"uid": 1}));
        assert!(reg.servers().is_empty());
    }

    #[test]
    fn brain_picks_highest_uid_when_multiple_present() {
        let reg = PresenceRegistry::new();
        reg.update_brain(BrainInfo { uid: 3 });
        reg.update_brain(BrainInfo { uid: 7 });
        assert_eq!(reg.brain().unwrap().uid, 7);
    }

    #[test]
    fn brain_is_none_when_empty() {
        let reg = PresenceRegistry::new();
        assert!(reg.brain().is_none());
    }

    #[test]
    fn all_shards_aggregates_across_clusters() {
        let reg = PresenceRegistry::new();
        reg.update_cluster(ClusterInfo {
            uid: 1,
            server_uid: 1,
            shard_ids: vec![0, 1],
            ready: true,
        });
        reg.update_cluster(ClusterInfo {
            uid: 2,
            server_uid: 1,
            shard_ids: vec![2, 3],
            ready: true,
        });
        let mut shards = reg.all_shards();
        shards.sort_unstable();
        assert_eq!(shards, vec![0, 1, 2, 3]);
    }
}
