//! VCTSDB continuous queries
//!
//! A background service that periodically materializes aggregate queries into
//! derived measurements, gated by a cluster-wide leadership lease.

pub mod cluster;
pub mod config;
pub mod continuous;
pub mod metrics;
pub mod query;
