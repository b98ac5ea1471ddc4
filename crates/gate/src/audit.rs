//! Append-only audit sink with a local fallback path.
//!
//! A successful commit is the terminal act of a decision cycle: no decision
//! is returned to the ingress before the record is durable in the primary
//! store or, when the primary is down, in a local append-only fallback file
//! with a monotonically suffixed name. The sink never swallows: if both
//! paths fail it raises to the caller.

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use uuid::Uuid;

use crate::metrics::METRICS;
use crate::types::{AuditRecord, Decision, ReasonCode};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit commit failed on primary and fallback: {primary}; {fallback}")]
    Unavailable { primary: String, fallback: String },
    #[error("audit storage error: {0}")]
    Storage(String),
    #[error("corrupt audit row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for AuditError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Query filter for the admin surface.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub agent_id: Option<String>,
    pub payout_id: Option<String>,
    pub decision: Option<Decision>,
    pub limit: Option<u32>,
}

impl AuditFilter {
    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(100).min(1000)
    }
}

/// Capability interface for the audit trail.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Durably record one decision. Returns only after the record is written
    /// to the primary store or the local fallback.
    async fn commit(&self, record: &AuditRecord) -> Result<(), AuditError>;
    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError>;
    /// Liveness probe for the health surface; reports on the primary only.
    async fn ping(&self) -> Result<(), AuditError>;
}

// The unique index excludes SKIPPED duplicate observations and INTERNAL_ERROR
// compensating entries, so the one-terminal-record-per-payout invariant is
// enforced where it applies.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS audit_logs (
    id TEXT PRIMARY KEY,
    payout_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    amount_minor INTEGER NOT NULL,
    currency TEXT NOT NULL,
    vendor_name TEXT,
    vendor_url TEXT,
    decision TEXT NOT NULL,
    reason TEXT NOT NULL,
    detail TEXT NOT NULL,
    threat_tags TEXT NOT NULL,
    processing_ms INTEGER NOT NULL,
    committed_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_audit_terminal_payout
    ON audit_logs(payout_id)
    WHERE decision != 'SKIPPED' AND reason != 'INTERNAL_ERROR';
CREATE INDEX IF NOT EXISTS idx_audit_agent ON audit_logs(agent_id);
CREATE INDEX IF NOT EXISTS idx_audit_committed ON audit_logs(committed_at);
"#;

/// SQL-backed audit sink with a local fallback directory.
pub struct SqlAuditSink {
    pool: SqlitePool,
    fallback_dir: PathBuf,
    fallback_seq: AtomicU64,
}

impl SqlAuditSink {
    pub fn new(pool: SqlitePool, fallback_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            fallback_dir: fallback_dir.into(),
            fallback_seq: AtomicU64::new(0),
        }
    }

    /// Create the `audit_logs` table and indexes if missing.
    pub async fn migrate(&self) -> Result<(), AuditError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_primary(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let tags = serde_json::to_string(&record.threat_tags)
            .map_err(|e| AuditError::Corrupt(e.to_string()))?;
        sqlx::query(
            "INSERT INTO audit_logs \
             (id, payout_id, agent_id, amount_minor, currency, vendor_name, vendor_url, \
              decision, reason, detail, threat_tags, processing_ms, committed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(&record.payout_id)
        .bind(&record.agent_id)
        .bind(record.amount_minor)
        .bind(&record.currency)
        .bind(&record.vendor_name)
        .bind(&record.vendor_url)
        .bind(record.decision.as_str())
        .bind(record.reason.as_str())
        .bind(&record.detail)
        .bind(&tags)
        .bind(record.processing_ms as i64)
        .bind(record.committed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn write_fallback(&self, record: &AuditRecord) -> Result<PathBuf, String> {
        let seq = self.fallback_seq.fetch_add(1, Ordering::SeqCst);
        let name = format!(
            "audit-{}-{:06}.json",
            record.committed_at.format("%Y%m%dT%H%M%S%3f"),
            seq
        );
        let path = self.fallback_dir.join(name);
        let body = serde_json::to_vec(record).map_err(|e| e.to_string())?;
        tokio::fs::create_dir_all(&self.fallback_dir)
            .await
            .map_err(|e| e.to_string())?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| e.to_string())?;
        Ok(path)
    }

    pub fn fallback_dir(&self) -> &Path {
        &self.fallback_dir
    }
}

#[async_trait]
impl AuditSink for SqlAuditSink {
    async fn commit(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let primary_err = match self.insert_primary(record).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        tracing::error!(
            payout_id = %record.payout_id,
            error = %primary_err,
            "primary audit store failed, writing local fallback"
        );
        match self.write_fallback(record).await {
            Ok(path) => {
                METRICS.record_audit_fallback();
                tracing::warn!(
                    payout_id = %record.payout_id,
                    path = %path.display(),
                    "audit record committed to fallback file"
                );
                Ok(())
            }
            Err(fallback_err) => Err(AuditError::Unavailable {
                primary: primary_err.to_string(),
                fallback: fallback_err,
            }),
        }
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError> {
        let mut sql = String::from(
            "SELECT id, payout_id, agent_id, amount_minor, currency, vendor_name, vendor_url, \
             decision, reason, detail, threat_tags, processing_ms, committed_at \
             FROM audit_logs WHERE 1=1",
        );
        if filter.agent_id.is_some() {
            sql.push_str(" AND agent_id = ?");
        }
        if filter.payout_id.is_some() {
            sql.push_str(" AND payout_id = ?");
        }
        if filter.decision.is_some() {
            sql.push_str(" AND decision = ?");
        }
        sql.push_str(" ORDER BY committed_at DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(agent_id) = &filter.agent_id {
            query = query.bind(agent_id);
        }
        if let Some(payout_id) = &filter.payout_id {
            query = query.bind(payout_id);
        }
        if let Some(decision) = filter.decision {
            query = query.bind(decision.as_str());
        }
        query = query.bind(filter.limit() as i64);

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn ping(&self) -> Result<(), AuditError> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<AuditRecord, AuditError> {
    let id: String = row.try_get("id")?;
    let decision: String = row.try_get("decision")?;
    let reason: String = row.try_get("reason")?;
    let tags: String = row.try_get("threat_tags")?;
    let committed_at: String = row.try_get("committed_at")?;
    let processing_ms: i64 = row.try_get("processing_ms")?;

    Ok(AuditRecord {
        id: Uuid::parse_str(&id).map_err(|e| AuditError::Corrupt(e.to_string()))?,
        payout_id: row.try_get("payout_id")?,
        agent_id: row.try_get("agent_id")?,
        amount_minor: row.try_get("amount_minor")?,
        currency: row.try_get("currency")?,
        vendor_name: row.try_get("vendor_name")?,
        vendor_url: row.try_get("vendor_url")?,
        decision: Decision::parse(&decision)
            .ok_or_else(|| AuditError::Corrupt(format!("unknown decision {decision:?}")))?,
        reason: ReasonCode::parse(&reason)
            .ok_or_else(|| AuditError::Corrupt(format!("unknown reason {reason:?}")))?,
        detail: row.try_get("detail")?,
        threat_tags: serde_json::from_str(&tags).map_err(|e| AuditError::Corrupt(e.to_string()))?,
        processing_ms: processing_ms as u64,
        committed_at: chrono::DateTime::parse_from_rfc3339(&committed_at)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .map_err(|e| AuditError::Corrupt(e.to_string()))?,
    })
}

/// In-memory audit sink for tests and single-node development.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn commit(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError> {
        let records = self.records.lock();
        Ok(records
            .iter()
            .filter(|r| {
                filter
                    .agent_id
                    .as_ref()
                    .map(|a| &r.agent_id == a)
                    .unwrap_or(true)
                    && filter
                        .payout_id
                        .as_ref()
                        .map(|p| &r.payout_id == p)
                        .unwrap_or(true)
                    && filter.decision.map(|d| r.decision == d).unwrap_or(true)
            })
            .rev()
            .take(filter.limit() as usize)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DecisionOutcome, PayoutIntent};

    fn record(payout_id: &str, decision: Decision, reason: ReasonCode) -> AuditRecord {
        let intent = PayoutIntent::new(payout_id, "agent-1", 25_000, "USD");
        let outcome = DecisionOutcome {
            payout_id: payout_id.to_string(),
            decision,
            reason,
            detail: "test".into(),
            threat_tags: vec![],
            processing_ms: 3,
        };
        AuditRecord::from_outcome(&intent, &outcome)
    }

    // One connection: an in-memory sqlite database is per-connection.
    async fn memory_pool() -> SqlitePool {
        sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    async fn sqlite_sink(dir: &Path) -> SqlAuditSink {
        let sink = SqlAuditSink::new(memory_pool().await, dir);
        sink.migrate().await.unwrap();
        sink
    }

    #[tokio::test]
    async fn commit_then_query() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sqlite_sink(dir.path()).await;

        sink.commit(&record("po_1", Decision::Approved, ReasonCode::PolicyOk))
            .await
            .unwrap();
        sink.commit(&record("po_2", Decision::Rejected, ReasonCode::LimitExceeded))
            .await
            .unwrap();

        let all = sink.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let rejected = sink
            .query(&AuditFilter {
                decision: Some(Decision::Rejected),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].payout_id, "po_2");
        assert_eq!(rejected[0].reason, ReasonCode::LimitExceeded);
    }

    #[tokio::test]
    async fn duplicate_terminal_record_is_refused_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sqlite_sink(dir.path()).await;

        sink.insert_primary(&record("po_1", Decision::Approved, ReasonCode::PolicyOk))
            .await
            .unwrap();
        let dup = sink
            .insert_primary(&record("po_1", Decision::Rejected, ReasonCode::LimitExceeded))
            .await;
        assert!(dup.is_err());

        // SKIPPED duplicates and compensating entries are allowed.
        sink.insert_primary(&record("po_1", Decision::Skipped, ReasonCode::IdempotentSkip))
            .await
            .unwrap();
        sink.insert_primary(&record("po_1", Decision::Rejected, ReasonCode::InternalError))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn primary_outage_falls_back_to_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let pool = memory_pool().await;
        let sink = SqlAuditSink::new(pool.clone(), dir.path());
        sink.migrate().await.unwrap();
        pool.close().await;

        sink.commit(&record("po_9", Decision::Rejected, ReasonCode::InternalError))
            .await
            .unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);
        let body = std::fs::read_to_string(&files[0]).unwrap();
        assert!(body.contains("po_9"));
    }

    #[tokio::test]
    async fn memory_sink_filters() {
        let sink = MemoryAuditSink::new();
        sink.commit(&record("po_1", Decision::Approved, ReasonCode::PolicyOk))
            .await
            .unwrap();
        sink.commit(&record("po_2", Decision::Skipped, ReasonCode::IdempotentSkip))
            .await
            .unwrap();

        let hits = sink
            .query(&AuditFilter {
                payout_id: Some("po_2".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].decision, Decision::Skipped);
    }
}
