//! Single-flight streaming audio cache.
//!
//! The first request for a resource starts one production whose output is
//! appended to a shared log; that request and every concurrent or later one
//! tail the log, so each resource is produced once no matter how many clients
//! ask for it at the same time.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod http_retry;
pub mod lock;
pub mod metrics;
pub mod producer;
pub mod server;
pub mod sink;
pub mod store;
