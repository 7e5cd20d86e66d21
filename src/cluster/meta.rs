//! Cluster metadata: databases, their continuous queries and leadership leases.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("Metadata store unavailable: {0}")]
    Unavailable(String),
    #[error("Lease {name} is held by node {owner}")]
    LeaseHeld { name: String, owner: u64 },
    #[error("Database not found: {0}")]
    DatabaseNotFound(String),
    #[error("Database already exists: {0}")]
    DatabaseExists(String),
    #[error("Continuous query already exists: {0}")]
    ContinuousQueryExists(String),
    #[error("Continuous query not found: {0}")]
    ContinuousQueryNotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid catalog: {0}")]
    Catalog(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuousQueryInfo {
    pub name: String,
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_retention_policy: Option<String>,
    #[serde(default)]
    pub continuous_queries: Vec<ContinuousQueryInfo>,
}

impl DatabaseInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            default_retention_policy: None,
            continuous_queries: Vec::new(),
        }
    }
}

/// Cluster-wide exclusivity token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: Uuid,
    pub name: String,
    pub owner: u64,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Source of database definitions and leases
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn list_databases(&self) -> Result<Vec<DatabaseInfo>, MetaError>;

    /// Grants or renews the named lease for `node_id`. Fails with
    /// [`MetaError::LeaseHeld`] while another node holds an unexpired lease.
    async fn acquire_lease(&self, name: &str, node_id: u64) -> Result<Lease, MetaError>;
}

/// Single-node metadata store, optionally seeded from a JSON catalog
pub struct LocalMetaStore {
    databases: RwLock<Vec<DatabaseInfo>>,
    leases: RwLock<HashMap<String, Lease>>,
    lease_duration: Duration,
}

impl LocalMetaStore {
    pub fn new(lease_duration: Duration) -> Self {
        Self::with_databases(Vec::new(), lease_duration)
    }

    pub fn with_databases(databases: Vec<DatabaseInfo>, lease_duration: Duration) -> Self {
        Self {
            databases: RwLock::new(databases),
            leases: RwLock::new(HashMap::new()),
            lease_duration,
        }
    }

    /// Loads a catalog: a JSON array of databases with their continuous queries.
    pub fn from_file(path: impl AsRef<Path>, lease_duration: Duration) -> Result<Self, MetaError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let databases: Vec<DatabaseInfo> = serde_json::from_str(&contents)?;
        info!(
            "Loaded {} databases from {}",
            databases.len(),
            path.as_ref().display()
        );
        Ok(Self::with_databases(databases, lease_duration))
    }

    /// Writes the current catalog back out in the format `from_file` reads.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), MetaError> {
        let databases = self.databases.read().await;
        let contents = serde_json::to_string_pretty(&*databases)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub async fn create_database(
        &self,
        name: &str,
        default_retention_policy: Option<&str>,
    ) -> Result<(), MetaError> {
        let mut databases = self.databases.write().await;
        if databases.iter().any(|db| db.name == name) {
            return Err(MetaError::DatabaseExists(name.to_string()));
        }
        let mut db = DatabaseInfo::new(name);
        db.default_retention_policy = default_retention_policy.map(str::to_string);
        databases.push(db);
        Ok(())
    }

    pub async fn create_continuous_query(
        &self,
        database: &str,
        name: &str,
        query: &str,
    ) -> Result<(), MetaError> {
        let mut databases = self.databases.write().await;
        let db = databases
            .iter_mut()
            .find(|db| db.name == database)
            .ok_or_else(|| MetaError::DatabaseNotFound(database.to_string()))?;
        if db.continuous_queries.iter().any(|cq| cq.name == name) {
            return Err(MetaError::ContinuousQueryExists(name.to_string()));
        }
        db.continuous_queries.push(ContinuousQueryInfo {
            name: name.to_string(),
            query: query.to_string(),
        });
        debug!("Created continuous query {} on {}", name, database);
        Ok(())
    }

    pub async fn drop_continuous_query(&self, database: &str, name: &str) -> Result<(), MetaError> {
        let mut databases = self.databases.write().await;
        let db = databases
            .iter_mut()
            .find(|db| db.name == database)
            .ok_or_else(|| MetaError::DatabaseNotFound(database.to_string()))?;
        let before = db.continuous_queries.len();
        db.continuous_queries.retain(|cq| cq.name != name);
        if db.continuous_queries.len() == before {
            return Err(MetaError::ContinuousQueryNotFound(name.to_string()));
        }
        debug!("Dropped continuous query {} on {}", name, database);
        Ok(())
    }

    /// Gives up a lease if `node_id` holds it.
    pub async fn release_lease(&self, name: &str, node_id: u64) {
        let mut leases = self.leases.write().await;
        if leases.get(name).map(|l| l.owner == node_id).unwrap_or(false) {
            leases.remove(name);
        }
    }
}

#[async_trait]
impl MetaStore for LocalMetaStore {
    async fn list_databases(&self) -> Result<Vec<DatabaseInfo>, MetaError> {
        Ok(self.databases.read().await.clone())
    }

    async fn acquire_lease(&self, name: &str, node_id: u64) -> Result<Lease, MetaError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.lease_duration)
            .map_err(|e| MetaError::Unavailable(format!("invalid lease duration: {}", e)))?;
        let mut leases = self.leases.write().await;

        if let Some(lease) = leases.get_mut(name) {
            if lease.owner != node_id && !lease.is_expired(now) {
                return Err(MetaError::LeaseHeld {
                    name: name.to_string(),
                    owner: lease.owner,
                });
            }
            if lease.owner == node_id {
                lease.expires_at = now + ttl;
                return Ok(lease.clone());
            }
        }

        let lease = Lease {
            id: Uuid::new_v4(),
            name: name.to_string(),
            owner: node_id,
            expires_at: now + ttl,
        };
        info!("Node {} acquired lease {}", node_id, name);
        leases.insert(name.to_string(), lease.clone());
        Ok(lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_lease_renewal_and_contention() {
        let store = LocalMetaStore::new(Duration::from_secs(60));

        let first = store.acquire_lease("cq", 1).await.unwrap();
        let renewed = store.acquire_lease("cq", 1).await.unwrap();
        assert_eq!(first.id, renewed.id);
        assert!(renewed.expires_at >= first.expires_at);

        assert!(matches!(
            store.acquire_lease("cq", 2).await,
            Err(MetaError::LeaseHeld { owner: 1, .. })
        ));

        store.release_lease("cq", 1).await;
        let taken = store.acquire_lease("cq", 2).await.unwrap();
        assert_eq!(taken.owner, 2);
        assert_ne!(taken.id, first.id);
    }

    #[tokio::test]
    async fn test_expired_lease_changes_hands() {
        let store = LocalMetaStore::new(Duration::from_millis(20));
        store.acquire_lease("cq", 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let lease = store.acquire_lease("cq", 2).await.unwrap();
        assert_eq!(lease.owner, 2);
    }

    #[tokio::test]
    async fn test_continuous_query_crud() {
        let store = LocalMetaStore::new(Duration::from_secs(60));
        store.create_database("db", Some("autogen")).await.unwrap();
        assert!(matches!(
            store.create_database("db", None).await,
            Err(MetaError::DatabaseExists(_))
        ));

        store
            .create_continuous_query("db", "cq", "SELECT count(value) INTO m FROM cpu GROUP BY time(1m)")
            .await
            .unwrap();
        assert!(matches!(
            store.create_continuous_query("db", "cq", "SELECT 1").await,
            Err(MetaError::ContinuousQueryExists(_))
        ));
        assert!(matches!(
            store.create_continuous_query("missing", "cq", "SELECT 1").await,
            Err(MetaError::DatabaseNotFound(_))
        ));

        let databases = store.list_databases().await.unwrap();
        assert_eq!(databases.len(), 1);
        assert_eq!(databases[0].default_retention_policy.as_deref(), Some("autogen"));
        assert_eq!(databases[0].continuous_queries.len(), 1);

        store.drop_continuous_query("db", "cq").await.unwrap();
        assert!(matches!(
            store.drop_continuous_query("db", "cq").await,
            Err(MetaError::ContinuousQueryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_catalog_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"[
                {"name": "db", "default_retention_policy": "autogen", "continuous_queries": [
                    {"name": "cq", "query": "SELECT count(value) INTO m FROM cpu GROUP BY time(1m)"}
                ]},
                {"name": "empty"}
            ]"#,
        )
        .unwrap();

        let store = LocalMetaStore::from_file(&path, Duration::from_secs(60)).unwrap();
        let databases = store.list_databases().await.unwrap();
        assert_eq!(databases.len(), 2);
        assert_eq!(databases[0].continuous_queries[0].name, "cq");
        assert!(databases[1].continuous_queries.is_empty());

        let copy = dir.path().join("copy.json");
        store.save(&copy).await.unwrap();
        let reloaded = LocalMetaStore::from_file(&copy, Duration::from_secs(60)).unwrap();
        assert_eq!(reloaded.list_databases().await.unwrap(), databases);
    }

    #[test]
    fn test_invalid_catalog() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            LocalMetaStore::from_file(&path, Duration::from_secs(60)),
            Err(MetaError::Catalog(_))
        ));
    }
}
