//! Storage, merge engine, snapshots and run coordination.

pub mod broker;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod record;
pub mod schemas;
pub mod snapshot;
pub mod store;
pub mod sync;
pub mod time;
