//! Durable per-agent policy store.
//!
//! Policies are created and mutated only through the admin surface and read
//! on every governance cycle. A missing policy is a valid outcome meaning
//! "no governance configured for this agent"; the engine turns it into
//! `REJECTED / NO_POLICY`. All SQL is parameterized.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashMap;
use thiserror::Error;

use crate::types::{AgentPolicy, PolicyViolation};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error(transparent)]
    Invalid(#[from] PolicyViolation),
    #[error("policy storage error: {0}")]
    Storage(String),
    #[error("corrupt policy row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for PolicyError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Capability interface for policy storage.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get(&self, agent_id: &str) -> Result<Option<AgentPolicy>, PolicyError>;
    /// Insert or replace. Validates and normalizes before writing; upserting
    /// the same policy twice is observationally identical to upserting once.
    async fn upsert(&self, policy: AgentPolicy) -> Result<(), PolicyError>;
    /// Liveness probe for the health surface.
    async fn ping(&self) -> Result<(), PolicyError>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agent_policies (
    agent_id TEXT PRIMARY KEY,
    daily_cap_minor INTEGER NOT NULL,
    per_txn_cap_minor INTEGER,
    approval_threshold_minor INTEGER,
    allowed_domains TEXT NOT NULL,
    blocked_domains TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// SQL-backed policy store.
pub struct SqlPolicyStore {
    pool: SqlitePool,
}

impl SqlPolicyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `agent_policies` table if missing.
    pub async fn migrate(&self) -> Result<(), PolicyError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl PolicyStore for SqlPolicyStore {
    async fn get(&self, agent_id: &str) -> Result<Option<AgentPolicy>, PolicyError> {
        let row = sqlx::query(
            "SELECT agent_id, daily_cap_minor, per_txn_cap_minor, approval_threshold_minor, \
             allowed_domains, blocked_domains, created_at, updated_at \
             FROM agent_policies WHERE agent_id = ?",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let allowed: String = row.try_get("allowed_domains")?;
        let blocked: String = row.try_get("blocked_domains")?;
        let created: String = row.try_get("created_at")?;
        let updated: String = row.try_get("updated_at")?;

        Ok(Some(AgentPolicy {
            agent_id: row.try_get("agent_id")?,
            daily_cap_minor: row.try_get("daily_cap_minor")?,
            per_txn_cap_minor: row.try_get("per_txn_cap_minor")?,
            approval_threshold_minor: row.try_get("approval_threshold_minor")?,
            allowed_domains: parse_domains(&allowed)?,
            blocked_domains: parse_domains(&blocked)?,
            created_at: parse_timestamp(&created)?,
            updated_at: parse_timestamp(&updated)?,
        }))
    }

    async fn upsert(&self, mut policy: AgentPolicy) -> Result<(), PolicyError> {
        policy.validate()?;
        policy.updated_at = Utc::now();

        let allowed = serde_json::to_string(&policy.allowed_domains)
            .map_err(|e| PolicyError::Corrupt(e.to_string()))?;
        let blocked = serde_json::to_string(&policy.blocked_domains)
            .map_err(|e| PolicyError::Corrupt(e.to_string()))?;

        sqlx::query(
            "INSERT INTO agent_policies \
             (agent_id, daily_cap_minor, per_txn_cap_minor, approval_threshold_minor, \
              allowed_domains, blocked_domains, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(agent_id) DO UPDATE SET \
              daily_cap_minor = excluded.daily_cap_minor, \
              per_txn_cap_minor = excluded.per_txn_cap_minor, \
              approval_threshold_minor = excluded.approval_threshold_minor, \
              allowed_domains = excluded.allowed_domains, \
              blocked_domains = excluded.blocked_domains, \
              updated_at = excluded.updated_at",
        )
        .bind(&policy.agent_id)
        .bind(policy.daily_cap_minor)
        .bind(policy.per_txn_cap_minor)
        .bind(policy.approval_threshold_minor)
        .bind(&allowed)
        .bind(&blocked)
        .bind(policy.created_at.to_rfc3339())
        .bind(policy.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::info!(agent_id = %policy.agent_id, daily_cap = policy.daily_cap_minor, "policy upserted");
        Ok(())
    }

    async fn ping(&self) -> Result<(), PolicyError> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

fn parse_domains(raw: &str) -> Result<Vec<String>, PolicyError> {
    serde_json::from_str(raw).map_err(|e| PolicyError::Corrupt(e.to_string()))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, PolicyError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PolicyError::Corrupt(e.to_string()))
}

/// In-memory policy store for tests and single-node development.
#[derive(Default)]
pub struct MemoryPolicyStore {
    policies: Mutex<HashMap<String, AgentPolicy>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn get(&self, agent_id: &str) -> Result<Option<AgentPolicy>, PolicyError> {
        Ok(self.policies.lock().get(agent_id).cloned())
    }

    async fn upsert(&self, mut policy: AgentPolicy) -> Result<(), PolicyError> {
        policy.validate()?;
        policy.updated_at = Utc::now();
        self.policies
            .lock()
            .insert(policy.agent_id.clone(), policy);
        Ok(())
    }

    async fn ping(&self) -> Result<(), PolicyError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One connection: an in-memory sqlite database is per-connection.
    async fn sqlite_store() -> SqlPolicyStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqlPolicyStore::new(pool);
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn missing_policy_is_none() {
        let store = sqlite_store().await;
        assert!(store.get("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = sqlite_store().await;
        let policy = AgentPolicy::new("agent-1", 500_000)
            .with_per_txn_cap(100_000)
            .with_approval_threshold(50_000)
            .with_blocked_domains(vec!["evil.example".into()]);
        store.upsert(policy).await.unwrap();

        let loaded = store.get("agent-1").await.unwrap().unwrap();
        assert_eq!(loaded.daily_cap_minor, 500_000);
        assert_eq!(loaded.per_txn_cap_minor, Some(100_000));
        assert_eq!(loaded.approval_threshold_minor, Some(50_000));
        assert_eq!(loaded.blocked_domains, vec!["evil.example"]);
    }

    #[tokio::test]
    async fn upsert_twice_is_idempotent() {
        let store = sqlite_store().await;
        let policy = AgentPolicy::new("agent-1", 500_000).with_per_txn_cap(100_000);
        store.upsert(policy.clone()).await.unwrap();
        store.upsert(policy).await.unwrap();

        let loaded = store.get("agent-1").await.unwrap().unwrap();
        assert_eq!(loaded.daily_cap_minor, 500_000);
        assert_eq!(loaded.per_txn_cap_minor, Some(100_000));
    }

    #[tokio::test]
    async fn upsert_replaces_fields() {
        let store = sqlite_store().await;
        store
            .upsert(AgentPolicy::new("agent-1", 500_000))
            .await
            .unwrap();
        store
            .upsert(AgentPolicy::new("agent-1", 750_000).with_approval_threshold(60_000))
            .await
            .unwrap();

        let loaded = store.get("agent-1").await.unwrap().unwrap();
        assert_eq!(loaded.daily_cap_minor, 750_000);
        assert_eq!(loaded.approval_threshold_minor, Some(60_000));
    }

    #[tokio::test]
    async fn invalid_policy_is_refused() {
        let store = sqlite_store().await;
        let policy = AgentPolicy::new("agent-1", 100).with_per_txn_cap(200);
        assert!(matches!(
            store.upsert(policy).await,
            Err(PolicyError::Invalid(_))
        ));
        assert!(store.get("agent-1").await.unwrap().is_none());
    }
}
