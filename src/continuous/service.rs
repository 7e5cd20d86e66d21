//! The continuous query service: a single background task that wakes on a ticker or
//! on manual run requests and evaluates every matching continuous query.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::leadership::LeadershipGate;
use crate::cluster::meta::MetaStore;
use crate::config::{Config, ConfigError};
use crate::metrics;
use crate::query::engine::QueryEngine;
use crate::query::executor::{ContinuousQueryExecutor, ExecutionError};

use super::runner::ContinuousQueryRunner;
use super::{CqError, CqId, CqState};

/// Pending requests beyond this are dropped
const REQUEST_QUEUE_DEPTH: usize = 1;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Continuous query service is not running")]
    NotRunning,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A request to evaluate continuous queries as of `now`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// Nanoseconds since the Unix epoch
    pub now: i64,
    /// Restricts the pass to one database
    pub database: Option<String>,
    /// Restricts the pass to continuous queries with this name
    pub name: Option<String>,
    /// Forget the matched queries' state before evaluating them
    pub reset: bool,
}

impl RunRequest {
    /// Periodic request covering every continuous query.
    pub fn tick(now: DateTime<Utc>) -> Self {
        Self {
            now: to_nanos(now),
            database: None,
            name: None,
            reset: false,
        }
    }

    pub fn matches_database(&self, database: &str) -> bool {
        self.database.as_deref().map_or(true, |db| db == database)
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.name.as_deref().map_or(true, |n| n == name)
    }

    fn is_unfiltered(&self) -> bool {
        self.database.is_none() && self.name.is_none()
    }
}

fn to_nanos(time: DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

struct Running {
    requests: mpsc::Sender<RunRequest>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ContinuousQueryService {
    config: Config,
    meta: Arc<dyn MetaStore>,
    gate: Arc<dyn LeadershipGate>,
    runner: ContinuousQueryRunner,
    state: Arc<RwLock<HashMap<CqId, CqState>>>,
    running: Mutex<Option<Running>>,
}

impl ContinuousQueryService {
    pub fn new(
        config: Config,
        meta: Arc<dyn MetaStore>,
        gate: Arc<dyn LeadershipGate>,
        engine: Arc<dyn QueryEngine>,
    ) -> Self {
        let executor = ContinuousQueryExecutor::new(engine, config.execution_config());
        let runner = ContinuousQueryRunner::new(executor, config.max_concurrent_queries, config.log_enabled);
        Self {
            config,
            meta,
            gate,
            runner,
            state: Arc::new(RwLock::new(HashMap::new())),
            running: Mutex::new(None),
        }
    }

    /// Starts the scheduler task. Opening an open service does nothing.
    pub fn open(&self) -> Result<(), ServiceError> {
        self.config.validate()?;

        let mut running = self.lock_running();
        if running.is_some() {
            return Ok(());
        }
        if !self.config.enabled {
            info!("Continuous query service is disabled");
            return Ok(());
        }

        let (requests, receiver) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let shutdown = CancellationToken::new();
        let scheduler = Scheduler {
            meta: self.meta.clone(),
            gate: self.gate.clone(),
            runner: self.runner.clone(),
            state: self.state.clone(),
            shutdown: shutdown.clone(),
        };
        let handle = tokio::spawn(scheduler.run(receiver, self.config.run_interval));

        info!(
            "Starting continuous query service (run interval {:?})",
            self.config.run_interval
        );
        *running = Some(Running {
            requests,
            shutdown,
            handle,
        });
        Ok(())
    }

    /// Stops the scheduler, cancelling in-flight executions, and waits for it to exit.
    /// Closing a closed service does nothing.
    pub async fn close(&self) -> Result<(), ServiceError> {
        let running = self.lock_running().take();
        let Some(running) = running else {
            return Ok(());
        };

        running.shutdown.cancel();
        drop(running.requests);
        if let Err(e) = running.handle.await {
            error!("Continuous query scheduler exited abnormally: {}", e);
        }
        info!("Continuous query service closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Requests an immediate run of the matching continuous queries, re-executing
    /// their windows from scratch. Empty filters match everything.
    pub fn run(&self, database: &str, name: &str, now: DateTime<Utc>) -> Result<(), ServiceError> {
        let request = RunRequest {
            now: to_nanos(now),
            database: non_empty(database),
            name: non_empty(name),
            reset: true,
        };
        self.submit(request).map(|_| ())
    }

    /// Queues a request without blocking. Returns false if it was dropped because
    /// another request is already pending.
    pub fn submit(&self, request: RunRequest) -> Result<bool, ServiceError> {
        let running = self.lock_running();
        let running = running.as_ref().ok_or(ServiceError::NotRunning)?;
        match running.requests.try_send(request) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(request)) => {
                debug!("Dropping continuous query run request for {}", request.now);
                Ok(false)
            }
            Err(TrySendError::Closed(_)) => Err(ServiceError::NotRunning),
        }
    }

    /// Snapshot of every continuous query's scheduling state.
    pub async fn watermarks(&self) -> HashMap<CqId, CqState> {
        self.state.read().await.clone()
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// State owned by the background task
struct Scheduler {
    meta: Arc<dyn MetaStore>,
    gate: Arc<dyn LeadershipGate>,
    runner: ContinuousQueryRunner,
    state: Arc<RwLock<HashMap<CqId, CqState>>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    async fn run(self, mut requests: mpsc::Receiver<RunRequest>, period: std::time::Duration) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let request = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(request) = requests.recv() => request,
                _ = ticker.tick() => RunRequest::tick(Utc::now()),
            };
            self.run_pass(request).await;
        }

        debug!("Continuous query scheduler stopped");
    }

    async fn run_pass(&self, request: RunRequest) {
        let started = Instant::now();

        if !self.gate.is_leader().await {
            debug!("Not the leader, skipping continuous queries");
            metrics::record_pass_skipped("not_leader");
            return;
        }

        let databases = match self.meta.list_databases().await {
            Ok(databases) => databases,
            Err(e) => {
                error!("Failed to list databases for continuous queries: {}", e);
                metrics::record_pass_skipped("meta_unavailable");
                return;
            }
        };

        let mut tasks = JoinSet::new();
        {
            let state = self.state.read().await;
            for db in databases.iter().filter(|db| request.matches_database(&db.name)) {
                for cqi in db.continuous_queries.iter().filter(|cq| request.matches_name(&cq.name)) {
                    let id = CqId::new(&db.name, &cqi.name);
                    let mut cq_state = if request.reset {
                        CqState::default()
                    } else {
                        state.get(&id).copied().unwrap_or_default()
                    };
                    let runner = self.runner.clone();
                    let db = db.clone();
                    let cqi = cqi.clone();
                    let cancel = self.shutdown.child_token();
                    let now = request.now;

                    tasks.spawn(async move {
                        let result = runner.execute(&db, &cqi, &mut cq_state, now, &cancel).await;
                        (id, cq_state, result)
                    });
                }
            }
        }

        let mut updates = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            let (id, cq_state, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Continuous query task failed: {}", e);
                    continue;
                }
            };
            match result {
                Ok(report) if report.checked => debug!(
                    "Continuous query {} ran {} of {} windows",
                    id, report.succeeded, report.dispatched
                ),
                Ok(_) => {}
                Err(CqError::Definition(e)) => {
                    warn!("Skipping invalid continuous query {}: {}", id, e);
                    metrics::record_definition_error();
                }
                Err(CqError::Execution {
                    source: ExecutionError::Cancelled,
                    ..
                }) => debug!("Continuous query {} cancelled", id),
                Err(e) => error!("Error running continuous query {}: {}", id, e),
            }
            updates.push((id, cq_state));
        }

        {
            let mut state = self.state.write().await;
            if request.is_unfiltered() {
                let live: HashSet<CqId> = databases
                    .iter()
                    .flat_map(|db| db.continuous_queries.iter().map(move |cq| CqId::new(&db.name, &cq.name)))
                    .collect();
                state.retain(|id, _| live.contains(id));
            }
            state.extend(updates);
        }

        metrics::record_pass(started.elapsed().as_secs_f64() * 1000.0);
    }
}
