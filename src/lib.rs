//! Floodgate - In-Memory Per-Key Rate Limiting Service
//!
//! This crate implements an HTTP rate limiting service built on a fixed
//! counting window per key. Each active key is owned by exactly one actor
//! task; a fixed set of manager shards routes requests to the owning actor
//! by hashing the key, so a single process can serve millions of admission
//! decisions per second without shared mutable state.

pub mod config;
pub mod error;
pub mod http;
pub mod limiter;
pub mod monitor;
