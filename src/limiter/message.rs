//! Message and envelope types exchanged between the manager set, its shards,
//! and the per-key limiter instances.
//!
//! Both message sets are closed: a shard and an instance each consume exactly
//! the variants below, and every request that carries a reply channel is
//! answered at most once.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

/// Sentinel meaning "leave this field alone" in permission requests and
/// config updates. Far enough out of any legitimate range that it cannot
/// collide with a real override.
pub const NO_CHANGE: i64 = -1_000_000_000;

/// The three terminal outcomes of an admission call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Decision {
    Approved,
    Denied,
    ClientGaveUp,
}

impl Decision {
    /// Wire form of the decision.
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approved => "approved",
            Decision::Denied => "denied",
            Decision::ClientGaveUp => "client-gave-up",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-key limiter configuration. Delivered by value; each instance owns a
/// private copy that it may mutate in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimiterConfig {
    /// Length of the fixed counting window in milliseconds.
    pub window_millis: i64,
    /// Admissions granted per window before throttling.
    pub max_requests_per_window: i64,
    /// Maximum parked waiters per key.
    pub max_requests_in_queue: i64,
}

/// An admission request on its way to the instance owning the key.
///
/// The reply channel is a buffered single slot: the instance can always
/// deliver its decision, even when the caller has already given up.
#[derive(Debug)]
pub struct PermissionRequest {
    pub req_id: u64,
    pub key: String,
    pub resp: oneshot::Sender<Decision>,
    pub can_wait: bool,
    /// Override for the per-window limit, or [`NO_CHANGE`].
    pub max_requests: i64,
    /// Override for the queue bound, or [`NO_CHANGE`].
    pub max_requests_in_queue: i64,
}

/// Messages consumed by a limiter instance.
#[derive(Debug)]
pub enum InstanceMsg {
    Permission(PermissionRequest),
    /// Return one admission slot to the window. Not scoped to any prior
    /// request; clamped at zero.
    Release,
    /// Adopt a newly merged configuration. Zero-valued fields inherit.
    ConfigUpdate(LimiterConfig),
    /// The caller of a queued request stopped waiting; drop it from the queue.
    GaveUp { req_id: u64 },
    Snapshot { resp: mpsc::Sender<InstanceSnapshot> },
    /// Drain the queue leniently and exit. Sent only by the parent shard
    /// after deregistering the instance.
    Kill,
}

/// Messages consumed by a manager shard, from the manager set and from the
/// shard's own instances.
#[derive(Debug)]
pub enum ShardMsg {
    Permission(PermissionRequest),
    Release { key: String, req_id: String },
    Snapshot { key: String, resp: mpsc::Sender<InstanceSnapshot> },
    SnapshotAll { resp: oneshot::Sender<SnapshotAll> },
    GaveUp { key: String, req_id: u64 },
    /// An instance reports itself idle. Carries the instance's own mailbox so
    /// the shard can tell whether the registry entry still refers to it.
    InstanceExpired {
        key: String,
        mailbox: mpsc::Sender<InstanceMsg>,
    },
    /// Final sign-off from a killed instance. Informational.
    InstanceDied { key: String },
    Kill,
}

/// Point-in-time view of a single instance, exposed on the debug surface.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub key: String,
    pub config: LimiterConfig,
    pub num_approved_this_window: i64,
    pub num_denied_this_window: i64,
    pub num_waiting: usize,
    /// False when the snapshot was requested for a key with no live instance.
    pub found: bool,
}

impl InstanceSnapshot {
    /// Placeholder reply for a key with no live instance.
    pub fn not_found() -> Self {
        Self {
            key: String::new(),
            config: LimiterConfig {
                window_millis: 0,
                max_requests_per_window: 0,
                max_requests_in_queue: 0,
            },
            num_approved_this_window: 0,
            num_denied_this_window: 0,
            num_waiting: 0,
            found: false,
        }
    }
}

/// Aggregated snapshots across every live instance known to the set.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SnapshotAll {
    pub instances: HashMap<String, InstanceSnapshot>,
}
