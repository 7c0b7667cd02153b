//! Manager shard: owns the key → instance mailbox registry for one hash
//! partition of the key space.
//!
//! A shard routes externally-originated requests to the owning instance,
//! creating instances lazily on first use, and consumes the lifecycle
//! notifications those instances send back. Because every producer for a
//! given instance funnels through its shard, per-key message order is a
//! consequence of the shard's single loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::config::FileConfig;

use super::instance;
use super::message::{InstanceMsg, InstanceSnapshot, LimiterConfig, ShardMsg, SnapshotAll};

/// Buffered requests per shard mailbox.
const MAILBOX_CAP: usize = 10_000;

/// Buffered config snapshots per shard.
const CONFIG_CAP: usize = 10;

/// Ceiling on draining instance snapshots during a full aggregation. One
/// shared deadline for the whole drain, so a pathologically slow instance
/// cannot stall the aggregation once per key.
const GATHER_TIMEOUT: Duration = Duration::from_secs(3);

/// Spawn a shard actor. Returns its request mailbox and its config channel.
pub(super) fn spawn(
    global: LimiterConfig,
    file_config: Arc<FileConfig>,
) -> (mpsc::Sender<ShardMsg>, mpsc::Sender<Arc<FileConfig>>) {
    let (tx, rx) = mpsc::channel(MAILBOX_CAP);
    let (cfg_tx, cfg_rx) = mpsc::channel(CONFIG_CAP);

    let shard = Shard {
        global,
        file_config,
        registry: HashMap::new(),
        mailbox: tx.clone(),
    };
    tokio::spawn(shard.run(rx, cfg_rx));

    (tx, cfg_tx)
}

struct Shard {
    global: LimiterConfig,
    /// Latest file snapshot; later instance creations merge against it.
    file_config: Arc<FileConfig>,
    registry: HashMap<String, mpsc::Sender<InstanceMsg>>,
    /// Clone of the shard's own mailbox, handed to instances as their parent.
    mailbox: mpsc::Sender<ShardMsg>,
}

impl Shard {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<ShardMsg>,
        mut cfg_rx: mpsc::Receiver<Arc<FileConfig>>,
    ) {
        debug!("Limiter shard started");
        let mut cfg_open = true;

        loop {
            tokio::select! {
                maybe_cfg = cfg_rx.recv(), if cfg_open => match maybe_cfg {
                    Some(cfg) => self.apply_file_config(cfg).await,
                    None => cfg_open = false,
                },

                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    if self.handle(msg).await {
                        break;
                    }
                }
            }
        }

        info!("Limiter shard stopped");
    }

    /// Recompute the effective config of every live instance against the new
    /// snapshot, then retain the snapshot for later creations.
    async fn apply_file_config(&mut self, cfg: Arc<FileConfig>) {
        debug!("Received new file config, updating all instances");
        for (key, instance) in &self.registry {
            let merged = merge_configs(key, &self.global, &cfg);
            let _ = instance.send(InstanceMsg::ConfigUpdate(merged)).await;
        }
        self.file_config = cfg;
    }

    /// Returns true when the shard should exit.
    async fn handle(&mut self, msg: ShardMsg) -> bool {
        match msg {
            ShardMsg::Permission(req) => {
                let instance = match self.registry.get(&req.key) {
                    Some(tx) => tx.clone(),
                    None => {
                        let config = merge_configs(&req.key, &self.global, &self.file_config);
                        let tx = instance::spawn(req.key.clone(), config, self.mailbox.clone());
                        self.registry.insert(req.key.clone(), tx.clone());
                        tx
                    }
                };
                let _ = instance.send(InstanceMsg::Permission(req)).await;
            }

            ShardMsg::Release { key, req_id } => match self.registry.get(&key) {
                Some(instance) => {
                    let _ = instance.send(InstanceMsg::Release).await;
                }
                None => warn!(key = %key, req_id = %req_id, "Release for unknown instance"),
            },

            ShardMsg::Snapshot { key, resp } => match self.registry.get(&key) {
                Some(instance) => {
                    let _ = instance.send(InstanceMsg::Snapshot { resp }).await;
                }
                None => {
                    warn!(key = %key, "Snapshot requested for unknown instance");
                    let _ = resp.try_send(InstanceSnapshot::not_found());
                }
            },

            ShardMsg::SnapshotAll { resp } => {
                let all = self.gather_snapshots().await;
                let _ = resp.send(all);
            }

            ShardMsg::GaveUp { key, req_id } => match self.registry.get(&key) {
                Some(instance) => {
                    let _ = instance.send(InstanceMsg::GaveUp { req_id }).await;
                }
                None => warn!(key = %key, req_id, "Gave-up notice for unknown instance"),
            },

            ShardMsg::InstanceExpired { key, mailbox } => {
                match self.registry.get(&key) {
                    None => warn!(key = %key, "Expiry notice for unknown instance"),
                    Some(stored) => {
                        if stored.same_channel(&mailbox) {
                            self.registry.remove(&key);
                        } else {
                            // A later instance already took over the key;
                            // leave the registry alone.
                            warn!(key = %key, "Expiry notice from a replaced instance");
                        }
                    }
                }
                // Either way the reporting instance may stop: once the entry
                // is gone, the next request for the key creates a fresh one.
                let _ = mailbox.send(InstanceMsg::Kill).await;
            }

            ShardMsg::InstanceDied { key } => {
                debug!(key = %key, "Instance died");
            }

            ShardMsg::Kill => {
                info!("Kill received, stopping all instances and the shard");
                for instance in self.registry.values() {
                    let _ = instance.send(InstanceMsg::Kill).await;
                }
                return true;
            }
        }
        false
    }

    async fn gather_snapshots(&self) -> SnapshotAll {
        let (tx, mut rx) = mpsc::channel(self.registry.len().max(1));
        for instance in self.registry.values() {
            let _ = instance.send(InstanceMsg::Snapshot { resp: tx.clone() }).await;
        }
        drop(tx);

        let mut all = SnapshotAll::default();
        let deadline = Instant::now() + GATHER_TIMEOUT;
        for _ in 0..self.registry.len() {
            match time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(snap)) => {
                    all.instances.insert(snap.key.clone(), snap);
                }
                Ok(None) => break,
                Err(_) => {
                    error!(
                        received = all.instances.len(),
                        expected = self.registry.len(),
                        "Gave up waiting for instance snapshots"
                    );
                    break;
                }
            }
        }
        all
    }
}

/// Effective config for a key: the global config overlaid, in file order, by
/// every rule whose pattern matches the key. Zero-valued rule fields inherit
/// from whatever has accumulated so far.
pub(super) fn merge_configs(key: &str, global: &LimiterConfig, file: &FileConfig) -> LimiterConfig {
    let mut result = *global;
    for rule in &file.keys {
        if rule.matches(key) {
            if rule.max_requests_in_queue != 0 {
                result.max_requests_in_queue = rule.max_requests_in_queue;
            }
            if rule.max_requests_per_window != 0 {
                result.max_requests_per_window = rule.max_requests_per_window;
            }
            if rule.window_millis != 0 {
                result.window_millis = rule.window_millis;
            }
        }
    }
    result
}
