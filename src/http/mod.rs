//! HTTP surface: admission, release, introspection, health, and peer
//! forwarding for distributed deployments.

mod handlers;
mod server;

pub use server::{bind, build_router, serve, AppState};
