//! Offline-first lifecycle for cached quest content.
//!
//! The crate keeps a device-local SQLite replica consistent with an
//! authoritative remote store:
//! - hybrid online/offline query resolution with a TTL cache
//! - per-record download membership (`download_profiles`) tracking
//! - cascading download and undownload of a quest's dependency closure
//! - transactional local offload of a quest
//! - repair of attachment references left behind by interrupted flows
//! - a persisted degraded-mode gate for failing schema migrations

pub mod app;
pub mod attachments;
pub mod cache;
pub mod cascade;
pub mod commands;
pub mod config;
pub mod error;
pub mod ledger;
pub mod local;
pub mod logging;
pub mod migration;
pub mod model;
pub mod network;
pub mod offload;
pub mod remote;

#[cfg(test)]
mod testing;

pub use error::LifecycleError;
