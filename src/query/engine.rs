//! Interface to the query execution engine.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::query::executor::ExecutionResult;
use crate::query::parser::ast::SelectStatement;

/// One chunk of output from a running query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub points_written: u64,
    pub error: Option<String>,
}

impl QueryResult {
    pub fn written(points: u64) -> Self {
        Self {
            points_written: points,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            points_written: 0,
            error: Some(message.into()),
        }
    }
}

/// Executes SELECT ... INTO statements and streams back their results.
///
/// The returned channel is closed by the engine once the query finishes. Engines should
/// stop producing when `cancel` fires.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn execute(
        &self,
        statement: &SelectStatement,
        database: &str,
        chunk_size: usize,
        cancel: CancellationToken,
    ) -> ExecutionResult<mpsc::Receiver<QueryResult>>;
}

/// Logs every statement and writes nothing
#[derive(Debug, Default, Clone)]
pub struct DryRunEngine;

#[async_trait]
impl QueryEngine for DryRunEngine {
    async fn execute(
        &self,
        statement: &SelectStatement,
        database: &str,
        chunk_size: usize,
        _cancel: CancellationToken,
    ) -> ExecutionResult<mpsc::Receiver<QueryResult>> {
        info!("[dry-run] {} on {} (chunk size {})", statement, database, chunk_size);
        let (tx, rx) = mpsc::channel(1);
        // Capacity 1 and a fresh channel, so this cannot fail
        let _ = tx.try_send(QueryResult::default());
        Ok(rx)
    }
}
