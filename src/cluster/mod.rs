//! Cluster coordination for VCTSDB
//! Metadata store access and leadership leases.

pub mod leadership;
pub mod meta;

pub use leadership::{LeadershipGate, LeaseGate};
pub use meta::{ContinuousQueryInfo, DatabaseInfo, Lease, LocalMetaStore, MetaError, MetaStore};
