use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics;
use crate::query::engine::QueryEngine;
use crate::query::rewriter::RewrittenQuery;

/// Error type for execution operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Query dispatch failed: {0}")]
    Dispatch(String),
    #[error("Query execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Query cancelled")]
    Cancelled,
}

/// Result type for execution operations
pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Configuration for query execution
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Points per result chunk requested from the engine
    pub chunk_size: usize,
    /// Upper bound on a single window's execution
    pub timeout: Option<Duration>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            timeout: None,
        }
    }
}

/// Totals of one drained query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub results: usize,
    pub points_written: u64,
}

/// Runs rewritten continuous queries through the engine
#[derive(Clone)]
pub struct ContinuousQueryExecutor {
    engine: Arc<dyn QueryEngine>,
    config: ExecutionConfig,
}

impl ContinuousQueryExecutor {
    pub fn new(engine: Arc<dyn QueryEngine>, config: ExecutionConfig) -> Self {
        Self { engine, config }
    }

    /// Dispatches the query and drains every result, even after an error is reported.
    /// The first reported error becomes the outcome.
    pub async fn execute(
        &self,
        query: &RewrittenQuery,
        database: &str,
        cancel: &CancellationToken,
    ) -> ExecutionResult<ExecutionSummary> {
        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let started = Instant::now();
        let result = match self.config.timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.execute_internal(query, database, cancel)).await {
                    Ok(result) => result,
                    Err(_) => Err(ExecutionError::ExecutionFailed(format!(
                        "Query timeout after {:?}",
                        timeout
                    ))),
                }
            }
            None => self.execute_internal(query, database, cancel).await,
        };

        match &result {
            Ok(summary) => {
                metrics::record_execution(started.elapsed().as_secs_f64() * 1000.0, summary.points_written);
            }
            Err(ExecutionError::Cancelled) => {
                debug!("Execution of {} cancelled", query.window);
            }
            Err(e) => {
                warn!("Execution of {} failed: {}", query.window, e);
                metrics::record_execution_failure();
            }
        }
        result
    }

    async fn execute_internal(
        &self,
        query: &RewrittenQuery,
        database: &str,
        cancel: &CancellationToken,
    ) -> ExecutionResult<ExecutionSummary> {
        let mut results = self
            .engine
            .execute(&query.statement, database, self.config.chunk_size, cancel.child_token())
            .await?;

        let mut summary = ExecutionSummary::default();
        let mut first_error = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    results.close();
                    return Err(ExecutionError::Cancelled);
                }
                next = results.recv() => next,
            };

            let Some(result) = next else { break };
            summary.results += 1;
            match result.error {
                Some(error) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
                None => summary.points_written += result.points_written,
            }
        }

        match first_error {
            Some(error) => Err(ExecutionError::ExecutionFailed(error)),
            None => Ok(summary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuous::interval::Window;
    use crate::continuous::testing::MockEngine;
    use crate::query::engine::QueryResult;
    use crate::query::parser::{parse_statement, Statement};

    fn query() -> RewrittenQuery {
        let statement = match parse_statement("SELECT count(value) INTO m FROM cpu GROUP BY time(1m)").unwrap() {
            Statement::Select(stmt) => stmt,
            other => panic!("Expected SELECT, got {:?}", other),
        };
        RewrittenQuery {
            statement,
            window: Window::new(0, 60_000_000_000),
            targets: vec!["db..m".to_string()],
        }
    }

    #[tokio::test]
    async fn test_execute_sums_points() {
        let engine = Arc::new(MockEngine::new());
        engine.set_results(vec![QueryResult::written(3), QueryResult::written(4)]);
        let executor = ContinuousQueryExecutor::new(engine.clone(), ExecutionConfig::default());

        let summary = executor.execute(&query(), "db", &CancellationToken::new()).await.unwrap();
        assert_eq!(summary, ExecutionSummary { results: 2, points_written: 7 });
        assert_eq!(engine.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_execute_drains_after_error() {
        let engine = Arc::new(MockEngine::new());
        engine.set_results(vec![
            QueryResult::failed("first"),
            QueryResult::written(5),
            QueryResult::failed("second"),
        ]);
        let executor = ContinuousQueryExecutor::new(engine.clone(), ExecutionConfig::default());

        match executor.execute(&query(), "db", &CancellationToken::new()).await {
            Err(ExecutionError::ExecutionFailed(msg)) => assert_eq!(msg, "first"),
            other => panic!("Expected execution failure, got {:?}", other),
        }
        assert_eq!(engine.delivered(), 3);
    }

    #[tokio::test]
    async fn test_dispatch_error() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_dispatch("engine down");
        let executor = ContinuousQueryExecutor::new(engine, ExecutionConfig::default());

        assert!(matches!(
            executor.execute(&query(), "db", &CancellationToken::new()).await,
            Err(ExecutionError::Dispatch(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_stops_draining() {
        let engine = Arc::new(MockEngine::new());
        engine.set_results(vec![QueryResult::written(1); 10]);
        engine.set_result_interval(Duration::from_millis(50));
        let executor = ContinuousQueryExecutor::new(engine, ExecutionConfig::default());

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = executor.execute(&query(), "db", &cancel).await;
        assert!(matches!(result, Err(ExecutionError::Cancelled)));
        assert!(started.elapsed() < Duration::from_millis(400));

        assert!(matches!(
            executor.execute(&query(), "db", &cancel).await,
            Err(ExecutionError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_timeout() {
        let engine = Arc::new(MockEngine::new());
        engine.set_results(vec![QueryResult::written(1); 10]);
        engine.set_result_interval(Duration::from_millis(50));
        let config = ExecutionConfig {
            timeout: Some(Duration::from_millis(60)),
            ..ExecutionConfig::default()
        };
        let executor = ContinuousQueryExecutor::new(engine, config);

        assert!(matches!(
            executor.execute(&query(), "db", &CancellationToken::new()).await,
            Err(ExecutionError::ExecutionFailed(_))
        ));
    }
}
