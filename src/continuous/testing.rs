//! Test doubles for the scheduler: a scriptable metadata store, a recording query
//! engine and a switchable leadership gate.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cluster::leadership::LeadershipGate;
use crate::cluster::meta::{ContinuousQueryInfo, DatabaseInfo, Lease, MetaError, MetaStore};
use crate::query::engine::{QueryEngine, QueryResult};
use crate::query::executor::{ExecutionError, ExecutionResult};
use crate::query::parser::ast::SelectStatement;

pub const SECOND: i64 = 1_000_000_000;
pub const MINUTE: i64 = 60 * SECOND;

/// Wall clock rounded down to a ten minute boundary, in nanoseconds
pub fn ten_minute_boundary() -> i64 {
    let now = Utc::now().timestamp_nanos_opt().unwrap();
    now - now.rem_euclid(10 * MINUTE)
}

/// Metadata store whose listing and lease calls can be made to fail
pub struct MockMetaStore {
    databases: Mutex<Vec<DatabaseInfo>>,
    list_error: AtomicBool,
    lease_error: AtomicBool,
}

impl MockMetaStore {
    pub fn new() -> Self {
        Self {
            databases: Mutex::new(Vec::new()),
            list_error: AtomicBool::new(false),
            lease_error: AtomicBool::new(false),
        }
    }

    /// Adds a database carrying the given (name, query) pairs.
    pub fn add_database(&self, name: &str, default_rp: Option<&str>, queries: &[(&str, &str)]) {
        let mut db = DatabaseInfo::new(name);
        db.default_retention_policy = default_rp.map(str::to_string);
        db.continuous_queries = queries
            .iter()
            .map(|(name, query)| ContinuousQueryInfo {
                name: name.to_string(),
                query: query.to_string(),
            })
            .collect();
        self.databases.lock().unwrap().push(db);
    }

    pub fn set_list_error(&self, fail: bool) {
        self.list_error.store(fail, Ordering::SeqCst);
    }

    pub fn set_lease_error(&self, fail: bool) {
        self.lease_error.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetaStore for MockMetaStore {
    async fn list_databases(&self) -> Result<Vec<DatabaseInfo>, MetaError> {
        if self.list_error.load(Ordering::SeqCst) {
            return Err(MetaError::Unavailable("expected error".to_string()));
        }
        Ok(self.databases.lock().unwrap().clone())
    }

    async fn acquire_lease(&self, name: &str, node_id: u64) -> Result<Lease, MetaError> {
        if self.lease_error.load(Ordering::SeqCst) {
            return Err(MetaError::Unavailable("expected error".to_string()));
        }
        Ok(Lease {
            id: Uuid::new_v4(),
            name: name.to_string(),
            owner: node_id,
            expires_at: Utc::now() + chrono::Duration::seconds(60),
        })
    }
}

/// Leadership gate flipped by the test. Optionally parks every check until released.
pub struct StaticGate {
    leader: AtomicBool,
    hold: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl StaticGate {
    pub fn new(leader: bool) -> Self {
        Self {
            leader: AtomicBool::new(leader),
            hold: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    /// Makes the next checks wait for [`StaticGate::release`].
    pub fn hold(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
    }

    /// Resolves once a check is parked in the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }
}

#[async_trait]
impl LeadershipGate for StaticGate {
    async fn is_leader(&self) -> bool {
        if self.hold.load(Ordering::SeqCst) {
            let released = self.release.notified();
            self.entered.notify_one();
            released.await;
        }
        self.leader.load(Ordering::SeqCst)
    }
}

/// Query engine that records every statement and replays scripted results
pub struct MockEngine {
    calls: Mutex<Vec<String>>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<String>>>,
    results: Mutex<Vec<QueryResult>>,
    result_interval: Mutex<Option<Duration>>,
    dispatch_error: Mutex<Option<String>>,
    delivered: Arc<AtomicUsize>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            results: Mutex::new(vec![QueryResult::default()]),
            result_interval: Mutex::new(None),
            dispatch_error: Mutex::new(None),
            delivered: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Receives every executed statement as it is dispatched.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().unwrap().push(tx);
        rx
    }

    pub fn set_results(&self, results: Vec<QueryResult>) {
        *self.results.lock().unwrap() = results;
    }

    /// Delay before each result is sent.
    pub fn set_result_interval(&self, interval: Duration) {
        *self.result_interval.lock().unwrap() = Some(interval);
    }

    pub fn fail_dispatch(&self, message: &str) {
        *self.dispatch_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn clear_failure(&self) {
        *self.dispatch_error.lock().unwrap() = None;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of results accepted by consumers
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryEngine for MockEngine {
    async fn execute(
        &self,
        statement: &SelectStatement,
        _database: &str,
        _chunk_size: usize,
        cancel: CancellationToken,
    ) -> ExecutionResult<mpsc::Receiver<QueryResult>> {
        let text = statement.to_string();
        self.calls.lock().unwrap().push(text.clone());
        self.listeners
            .lock()
            .unwrap()
            .retain(|listener| listener.send(text.clone()).is_ok());

        if let Some(message) = self.dispatch_error.lock().unwrap().clone() {
            return Err(ExecutionError::Dispatch(message));
        }

        let results = self.results.lock().unwrap().clone();
        let interval = *self.result_interval.lock().unwrap();
        let delivered = self.delivered.clone();
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            for result in results {
                if let Some(interval) = interval {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                if tx.send(result).await.is_err() {
                    return;
                }
                delivered.fetch_add(1, Ordering::SeqCst);
            }
        });
        Ok(rx)
    }
}

/// Collects `count` dispatched statements, failing if they do not arrive in time.
pub async fn expect_calls(
    rx: &mut mpsc::UnboundedReceiver<String>,
    count: usize,
    wait: Duration,
) -> Vec<String> {
    let mut calls = Vec::with_capacity(count);
    for _ in 0..count {
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(call)) => calls.push(call),
            Ok(None) => panic!("engine dropped its listener after {} calls", calls.len()),
            Err(_) => panic!("expected {} calls, got {}: {:?}", count, calls.len(), calls),
        }
    }
    calls
}

/// Fails if any statement is dispatched within `wait`.
pub async fn expect_no_calls(rx: &mut mpsc::UnboundedReceiver<String>, wait: Duration) {
    if let Ok(Some(call)) = tokio::time::timeout(wait, rx.recv()).await {
        panic!("unexpected call: {}", call);
    }
}
