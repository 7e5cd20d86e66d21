use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::meta::{ContinuousQueryInfo, DatabaseInfo};
use crate::metrics;
use crate::query::executor::{ContinuousQueryExecutor, ExecutionError, ExecutionResult, ExecutionSummary};
use crate::query::rewriter::{rewrite, RewrittenQuery};

use super::definition::ContinuousQueryDefinition;
use super::interval::{self, Window};
use super::{CqError, CqState};

/// What one evaluation of a continuous query did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CqReport {
    /// False when the check cadence skipped the query
    pub checked: bool,
    pub dispatched: usize,
    pub succeeded: usize,
    pub stale_skipped: u64,
}

/// Evaluates single continuous queries: cadence gate, due windows, rewrite,
/// concurrent execution and watermark update.
#[derive(Clone)]
pub struct ContinuousQueryRunner {
    executor: ContinuousQueryExecutor,
    limiter: Arc<Semaphore>,
    log_enabled: bool,
}

impl ContinuousQueryRunner {
    /// `max_concurrent` caps engine executions across every query sharing this runner.
    pub fn new(executor: ContinuousQueryExecutor, max_concurrent: usize, log_enabled: bool) -> Self {
        Self {
            executor,
            limiter: Arc::new(Semaphore::new(max_concurrent.max(1))),
            log_enabled,
        }
    }

    pub async fn execute(
        &self,
        db: &DatabaseInfo,
        cqi: &ContinuousQueryInfo,
        state: &mut CqState,
        now: i64,
        cancel: &CancellationToken,
    ) -> Result<CqReport, CqError> {
        let def = ContinuousQueryDefinition::parse(&db.name, cqi)?;
        self.execute_definition(&def, db.default_retention_policy.as_deref(), state, now, cancel)
            .await
    }

    /// Runs every due window of `def`. `state` is updated even when a window fails;
    /// the first failure is returned afterwards.
    pub async fn execute_definition(
        &self,
        def: &ContinuousQueryDefinition,
        default_retention_policy: Option<&str>,
        state: &mut CqState,
        now: i64,
        cancel: &CancellationToken,
    ) -> Result<CqReport, CqError> {
        let mut report = CqReport::default();
        if !interval::should_check(&def.resample, state.last_check, now) {
            debug!("Continuous query {} not due for a check", def.id());
            return Ok(report);
        }

        let due = interval::due_windows(def, state.last_check, state.watermark, now);
        let queries = due
            .windows
            .iter()
            .map(|window| rewrite(def, *window, default_retention_policy))
            .collect::<Result<Vec<_>, _>>()?;

        state.last_check = Some(interval::check_marker(&def.resample, now));
        report.checked = true;

        if due.stale > 0 {
            warn!(
                "Continuous query {} skipped {} windows older than its FOR horizon",
                def.id(),
                due.stale
            );
            metrics::record_stale_windows(due.stale);
            state.watermark = Some(state.watermark.map_or(due.horizon, |w| w.max(due.horizon)));
            report.stale_skipped = due.stale;
        }

        report.dispatched = queries.len();
        let handles: Vec<(Window, JoinHandle<ExecutionResult<ExecutionSummary>>)> = queries
            .into_iter()
            .map(|query| (query.window, self.spawn_window(def, query, cancel)))
            .collect();

        // Results are consumed in window order so the watermark only covers a
        // contiguous successful prefix of closed windows.
        let mut advancing = true;
        let mut first_failure = None;
        for (window, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(ExecutionError::ExecutionFailed(format!("window task failed: {}", e))),
            };
            match outcome {
                Ok(summary) => {
                    report.succeeded += 1;
                    if self.log_enabled {
                        info!(
                            "Continuous query {} wrote {} points for {}",
                            def.id(),
                            summary.points_written,
                            window
                        );
                    }
                    if advancing && window.is_closed(now) {
                        state.watermark = Some(state.watermark.map_or(window.end, |w| w.max(window.end)));
                    } else {
                        advancing = false;
                    }
                }
                Err(source) => {
                    advancing = false;
                    if first_failure.is_none() {
                        first_failure = Some(CqError::Execution { window, source });
                    }
                }
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    fn spawn_window(
        &self,
        def: &ContinuousQueryDefinition,
        query: RewrittenQuery,
        cancel: &CancellationToken,
    ) -> JoinHandle<ExecutionResult<ExecutionSummary>> {
        let executor = self.executor.clone();
        let limiter = self.limiter.clone();
        let database = def.database.clone();
        let cancel = cancel.clone();
        if self.log_enabled {
            info!(
                "Executing continuous query {} for {} into {}",
                def.id(),
                query.window,
                query.targets.join(", ")
            );
        }

        tokio::spawn(async move {
            let _permit = tokio::select! {
                permit = limiter.acquire_owned() => permit.map_err(|_| ExecutionError::Cancelled)?,
                _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
            };
            executor.execute(&query, &database, &cancel).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuous::testing::{MockEngine, MINUTE, SECOND};
    use crate::query::engine::QueryResult;
    use crate::query::executor::ExecutionConfig;

    const T0: i64 = 1_577_837_400 * SECOND;

    fn runner(engine: Arc<MockEngine>) -> ContinuousQueryRunner {
        ContinuousQueryRunner::new(
            ContinuousQueryExecutor::new(engine, ExecutionConfig::default()),
            4,
            false,
        )
    }

    fn db() -> DatabaseInfo {
        let mut db = DatabaseInfo::new("db");
        db.default_retention_policy = Some("autogen".to_string());
        db
    }

    fn cq(query: &str) -> ContinuousQueryInfo {
        ContinuousQueryInfo {
            name: "cq".to_string(),
            query: query.to_string(),
        }
    }

    #[tokio::test]
    async fn test_runs_due_windows_and_advances_watermark() {
        let engine = Arc::new(MockEngine::new());
        let runner = runner(engine.clone());
        let cqi = cq("CREATE CONTINUOUS QUERY cq ON db RESAMPLE FOR 3m BEGIN SELECT mean(value) INTO m FROM cpu GROUP BY time(1m) END");
        let mut state = CqState::default();

        let report = runner
            .execute(&db(), &cqi, &mut state, T0, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.dispatched, 3);
        assert_eq!(report.succeeded, 3);
        assert_eq!(state.watermark, Some(T0));
        assert_eq!(state.last_check, Some(T0));
        assert!(engine.calls().iter().all(|q| q.contains("INTO autogen.m")));

        // Repeat at the same instant: gated by cadence
        let report = runner
            .execute(&db(), &cqi, &mut state, T0, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!report.checked);
        assert_eq!(engine.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_failure_keeps_watermark() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_dispatch("expected error");
        let runner = runner(engine.clone());
        let cqi = cq("CREATE CONTINUOUS QUERY cq ON db RESAMPLE FOR 2m BEGIN SELECT count(value) INTO m FROM cpu GROUP BY time(1m) END");
        let mut state = CqState::default();

        let result = runner
            .execute(&db(), &cqi, &mut state, T0, &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(CqError::Execution { source: ExecutionError::Dispatch(_), .. })
        ));
        assert_eq!(state.watermark, None);
        assert_eq!(state.last_check, Some(T0));

        // The next eligible check retries the failed window still inside the horizon
        engine.clear_failure();
        let report = runner
            .execute(&db(), &cqi, &mut state, T0 + MINUTE, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.dispatched, 2);
        assert!(engine.calls()[2..]
            .iter()
            .any(|q| q.contains("time >= '2020-01-01T00:09:00Z'")));
        assert_eq!(state.watermark, Some(T0 + MINUTE));
    }

    #[tokio::test]
    async fn test_result_error_keeps_watermark() {
        let engine = Arc::new(MockEngine::new());
        engine.set_results(vec![QueryResult::failed("write failed")]);
        let runner = runner(engine);
        let cqi = cq("SELECT count(value) INTO m FROM cpu GROUP BY time(1m)");
        let mut state = CqState {
            last_check: None,
            watermark: Some(T0 - MINUTE),
        };

        assert!(runner
            .execute(&db(), &cqi, &mut state, T0, &CancellationToken::new())
            .await
            .is_err());
        assert_eq!(state.watermark, Some(T0 - MINUTE));
    }

    #[tokio::test]
    async fn test_in_progress_window_does_not_move_watermark() {
        let engine = Arc::new(MockEngine::new());
        let runner = runner(engine.clone());
        let cqi = cq("CREATE CONTINUOUS QUERY cq ON db RESAMPLE EVERY 10s FOR 2m BEGIN SELECT mean(value) INTO m FROM cpu GROUP BY time(1m) END");
        let mut state = CqState::default();
        let cancel = CancellationToken::new();

        runner.execute(&db(), &cqi, &mut state, T0, &cancel).await.unwrap();
        assert_eq!(engine.calls().len(), 2);

        // Previous window refreshed, current one refreshed while still open
        let report = runner
            .execute(&db(), &cqi, &mut state, T0 + 10 * SECOND, &cancel)
            .await
            .unwrap();
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.succeeded, 2);
        assert_eq!(state.watermark, Some(T0));
        assert_eq!(state.last_check, Some(T0 + 10 * SECOND));
        let calls = engine.calls();
        assert!(calls[2..].iter().any(|q| q.contains("time >= '2020-01-01T00:09:00Z'")));
        assert!(calls[2..].iter().any(|q| q.contains("time >= '2020-01-01T00:10:00Z'")));
    }

    #[tokio::test]
    async fn test_stale_windows_move_watermark_to_horizon() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_dispatch("expected error");
        let runner = runner(engine);
        let cqi = cq("CREATE CONTINUOUS QUERY cq ON db RESAMPLE FOR 2m BEGIN SELECT mean(value) INTO m FROM cpu GROUP BY time(1m) END");
        let mut state = CqState {
            last_check: None,
            watermark: Some(T0 - 10 * MINUTE),
        };

        let _ = runner
            .execute(&db(), &cqi, &mut state, T0, &CancellationToken::new())
            .await;
        assert_eq!(state.watermark, Some(T0 - 2 * MINUTE));
    }

    #[tokio::test]
    async fn test_invalid_definition() {
        let engine = Arc::new(MockEngine::new());
        let runner = runner(engine.clone());
        let mut state = CqState::default();

        let result = runner
            .execute(&db(), &cq("SELECT * FROM cpu"), &mut state, T0, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(CqError::Definition(_))));
        assert_eq!(state, CqState::default());
        assert!(engine.calls().is_empty());
    }
}
