//! The manager set: the public face of the limiting engine.
//!
//! A fixed array of shards partitions the key space by hash. The set routes
//! key-scoped operations to the owning shard, fans configuration snapshots
//! out to every shard, and aggregates debug snapshots across all of them.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time;
use tracing::{error, info, warn};

use crate::config::FileConfig;

use super::message::{
    Decision, InstanceSnapshot, LimiterConfig, PermissionRequest, ShardMsg, SnapshotAll,
};
use super::shard;

/// Default number of manager shards. Enough parallelism that one shard's
/// mailbox is unlikely to bottleneck under key skew, while keeping per-shard
/// registries large enough that creation cost amortizes.
pub const DEFAULT_SHARDS: usize = 25;

/// How long a single-key snapshot may take before it is given up on.
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long each shard may take to answer a full aggregation.
const SNAPSHOT_ALL_TIMEOUT: Duration = Duration::from_secs(10);

/// The sharded manager set. One per process; shared behind an [`Arc`] by
/// every caller task.
pub struct LimiterSet {
    req_id_gen: AtomicU64,
    shards: Vec<mpsc::Sender<ShardMsg>>,
}

impl LimiterSet {
    /// Start `sharding` shards seeded with the global config and the initial
    /// file snapshot, and begin fanning later snapshots from
    /// `file_config_rx` out to all of them.
    ///
    /// Panics when `sharding` is outside `[1, 100]`; that is a programming
    /// error, not a runtime condition.
    pub fn new(
        global: LimiterConfig,
        init_file_config: FileConfig,
        mut file_config_rx: mpsc::Receiver<Arc<FileConfig>>,
        sharding: usize,
    ) -> Self {
        assert!(
            (1..=100).contains(&sharding),
            "BUG: sharding must be in 1..=100, got {sharding}"
        );

        let init = Arc::new(init_file_config);
        let mut shards = Vec::with_capacity(sharding);
        let mut cfg_txs = Vec::with_capacity(sharding);
        for _ in 0..sharding {
            let (tx, cfg_tx) = shard::spawn(global, Arc::clone(&init));
            shards.push(tx);
            cfg_txs.push(cfg_tx);
        }

        // The config source does not know which shard owns which key, so
        // every snapshot is copied to every shard.
        tokio::spawn(async move {
            while let Some(cfg) = file_config_rx.recv().await {
                for cfg_tx in &cfg_txs {
                    let _ = cfg_tx.send(Arc::clone(&cfg)).await;
                }
            }
        });

        Self {
            req_id_gen: AtomicU64::new(0),
            shards,
        }
    }

    /// Index of the shard owning `key`. Public so tests and the HTTP layer's
    /// peer routing can agree with the core's placement.
    pub fn shard_index(&self, key: &str) -> usize {
        fnv1a32(key.as_bytes()) as usize % self.shards.len()
    }

    fn shard_for(&self, key: &str) -> &mpsc::Sender<ShardMsg> {
        &self.shards[self.shard_index(key)]
    }

    /// Ask for one admission slot for `key`.
    ///
    /// `max_requests` and `max_requests_in_queue` override the key's config
    /// in place unless they carry [`super::NO_CHANGE`]. When `give_up`
    /// resolves before the decision arrives, the queued request is withdrawn
    /// and the call returns [`Decision::ClientGaveUp`].
    pub async fn ask_permission(
        &self,
        key: &str,
        can_wait: bool,
        max_requests: i64,
        max_requests_in_queue: i64,
        give_up: impl Future<Output = ()>,
    ) -> (Decision, String) {
        // Single buffered reply slot: the instance can always deliver its
        // decision, even when this caller has already moved on.
        let (resp_tx, resp_rx) = oneshot::channel();

        // A plain counter: ids only need to be unique within the process,
        // and this is far cheaper than generating uuids on the hot path.
        let req_id = self.req_id_gen.fetch_add(1, Ordering::Relaxed) + 1;
        let req = PermissionRequest {
            req_id,
            key: key.to_string(),
            resp: resp_tx,
            can_wait,
            max_requests,
            max_requests_in_queue,
        };

        let mailbox = self.shard_for(key);
        if mailbox.send(ShardMsg::Permission(req)).await.is_err() {
            // The shard is gone; the set is shutting down.
            return (Decision::Denied, req_id.to_string());
        }

        tokio::select! {
            resp = resp_rx => {
                (resp.unwrap_or(Decision::Denied), req_id.to_string())
            }
            _ = give_up => {
                warn!(key = %key, req_id, "Client gave up before receiving a response");
                let _ = mailbox
                    .send(ShardMsg::GaveUp { key: key.to_string(), req_id })
                    .await;
                (Decision::ClientGaveUp, req_id.to_string())
            }
        }
    }

    /// Return one admission slot for `key`. Fire and forget; guaranteed to be
    /// observed before any later permission request for the same key. The
    /// request id is informational.
    pub async fn release(&self, key: &str, req_id: &str) {
        let _ = self
            .shard_for(key)
            .send(ShardMsg::Release {
                key: key.to_string(),
                req_id: req_id.to_string(),
            })
            .await;
    }

    /// Snapshot a single key. `None` when the owning shard did not answer in
    /// time; a snapshot with `found == false` when the key has no instance.
    pub async fn debug_snapshot(&self, key: &str) -> Option<InstanceSnapshot> {
        let (tx, mut rx) = mpsc::channel(1);
        let _ = self
            .shard_for(key)
            .send(ShardMsg::Snapshot {
                key: key.to_string(),
                resp: tx,
            })
            .await;

        match time::timeout(SNAPSHOT_TIMEOUT, rx.recv()).await {
            Ok(Some(snap)) => {
                if !snap.found {
                    warn!(key = %key, "Instance not found");
                }
                Some(snap)
            }
            Ok(None) => None,
            Err(_) => {
                error!(key = %key, "Gave up waiting for a debug snapshot");
                None
            }
        }
    }

    /// Snapshot every live instance, querying all shards in parallel. A shard
    /// that misses its deadline contributes nothing.
    pub async fn debug_snapshots_all(&self) -> SnapshotAll {
        let mut tasks = JoinSet::new();
        for (idx, shard) in self.shards.iter().enumerate() {
            let shard = shard.clone();
            tasks.spawn(async move {
                let (tx, rx) = oneshot::channel();
                if shard.send(ShardMsg::SnapshotAll { resp: tx }).await.is_err() {
                    return None;
                }
                match time::timeout(SNAPSHOT_ALL_TIMEOUT, rx).await {
                    Ok(Ok(snap)) => Some(snap),
                    Ok(Err(_)) => None,
                    Err(_) => {
                        error!(shard = idx, "Gave up waiting for the shard snapshot");
                        None
                    }
                }
            });
        }

        let mut combined = SnapshotAll::default();
        while let Some(res) = tasks.join_next().await {
            if let Ok(Some(snap)) = res {
                combined.instances.extend(snap.instances);
            }
        }
        combined
    }

    /// Tear the whole set down. Shards kill their instances on the way out;
    /// nobody waits for acknowledgements.
    pub async fn close(&self) {
        info!("Killing the limiter set and all of its shards");
        for shard in &self.shards {
            let _ = shard.send(ShardMsg::Kill).await;
        }
    }
}

/// 32-bit FNV-1a. Key placement must be identical across the process
/// lifetime and across peer instances, so the algorithm is pinned rather
/// than borrowed from the standard library's keyed hasher.
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
