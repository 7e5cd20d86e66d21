//! Continuous query scheduling for VCTSDB
//! Decides which aggregation windows are due and materializes them through the query engine.

pub mod definition;
pub mod interval;
pub mod runner;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use thiserror::Error;

use crate::query::executor::ExecutionError;
use crate::query::rewriter::RewriteError;

pub use definition::{ContinuousQueryDefinition, DefinitionError, ResamplePolicy};
pub use interval::{DueWindows, Window};
pub use runner::{ContinuousQueryRunner, CqReport};
pub use service::{ContinuousQueryService, RunRequest, ServiceError};

/// Identity of a continuous query: (database, name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CqId {
    pub database: String,
    pub name: String,
}

impl CqId {
    pub fn new(database: &str, name: &str) -> Self {
        Self {
            database: database.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for CqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.name)
    }
}

/// Per-query scheduling state, kept in memory for the lifetime of the process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CqState {
    /// `floor(now, every)` of the last pass that evaluated the query
    pub last_check: Option<i64>,
    /// End of the newest closed window executed successfully through a contiguous prefix
    pub watermark: Option<i64>,
}

#[derive(Debug, Error)]
pub enum CqError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error("failed to rewrite continuous query: {0}")]
    Rewrite(#[from] RewriteError),
    #[error("window {window} failed: {source}")]
    Execution {
        window: Window,
        #[source]
        source: ExecutionError,
    },
}
