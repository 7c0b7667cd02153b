//! The limiting engine: per-key instance actors, manager shards, and the
//! sharded manager set that fronts them.

mod instance;
mod message;
mod set;
mod shard;

pub use message::{Decision, InstanceSnapshot, LimiterConfig, SnapshotAll, NO_CHANGE};
pub use set::{fnv1a32, LimiterSet, DEFAULT_SHARDS};
