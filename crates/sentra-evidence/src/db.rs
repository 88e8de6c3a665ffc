// Database layer: SQLite-backed durable state for investigations, steps,
// evidence, relationships, feedback, the per-run event log, and connector
// definitions. Every table carries tenant_id and every query filters on it.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use sentra_types::{
    Alert, ConnectorDefinition, EntityMap, Evidence, EvidenceRelationship, ExecutionSummary,
    Feedback, Investigation, InvestigationStatus, RelationshipKind, Severity, Step, Verdict,
};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::types::{EventRow, InvestigationFilter, StatsReport, StoreError, StoreResult};

/// Connection manager for the Sentra store.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the store at `db_path`.
    pub async fn new(db_path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(10))?;

        // WAL for concurrent readers; PRAGMA journal_mode returns a row.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS alerts (
                alert_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                title TEXT NOT NULL,
                severity TEXT NOT NULL,
                source TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                raw_payload TEXT NOT NULL,
                entities TEXT NOT NULL,
                PRIMARY KEY (tenant_id, alert_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS investigations (
                investigation_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                alert_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                priority INTEGER NOT NULL,
                severity TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                timeout_ms INTEGER NOT NULL,
                metadata TEXT NOT NULL,
                verdict TEXT,
                summary TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_investigations_tenant_status
             ON investigations(tenant_id, status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_investigations_tenant_created
             ON investigations(tenant_id, created_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS idempotency_keys (
                tenant_id TEXT NOT NULL,
                key_hash TEXT NOT NULL,
                investigation_id TEXT NOT NULL,
                PRIMARY KEY (tenant_id, key_hash)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS steps (
                step_id TEXT NOT NULL,
                investigation_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                plan_id TEXT NOT NULL,
                name TEXT NOT NULL,
                step_type TEXT NOT NULL,
                dependencies TEXT NOT NULL,
                payload TEXT NOT NULL,
                data_sources TEXT NOT NULL,
                timeout_ms INTEGER NOT NULL,
                max_retries INTEGER NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                non_critical INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (investigation_id, step_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_steps_tenant ON steps(tenant_id, investigation_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS evidence (
                evidence_id TEXT PRIMARY KEY,
                investigation_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                evidence_type TEXT NOT NULL,
                source TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                payload TEXT NOT NULL,
                entities TEXT NOT NULL,
                confidence REAL NOT NULL,
                quality_score REAL NOT NULL,
                tags TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_evidence_investigation
             ON evidence(tenant_id, investigation_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_evidence_type
             ON evidence(tenant_id, evidence_type)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_evidence_time
             ON evidence(tenant_id, timestamp)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS evidence_relationships (
                from_evidence_id TEXT NOT NULL,
                to_evidence_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                investigation_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                strength REAL NOT NULL,
                rationale TEXT NOT NULL,
                PRIMARY KEY (from_evidence_id, to_evidence_id, kind)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_relationships_investigation
             ON evidence_relationships(tenant_id, investigation_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS feedback (
                feedback_id TEXT PRIMARY KEY,
                investigation_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                feedback_type TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                consumed INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_feedback_investigation
             ON feedback(tenant_id, investigation_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS event_log (
                run_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                tenant_id TEXT NOT NULL,
                method TEXT NOT NULL,
                payload TEXT NOT NULL,
                ts TEXT NOT NULL,
                PRIMARY KEY (run_id, sequence)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS connector_definitions (
                connector_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                definition TEXT NOT NULL,
                PRIMARY KEY (tenant_id, connector_id)
            )",
            [],
        )?;

        // Migrations: additive columns on evidence.
        // (SQLite lacks IF NOT EXISTS for columns, so inspect table_info.)
        let existing_cols: HashSet<String> = {
            let mut stmt = conn.prepare("PRAGMA table_info(evidence)")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
            rows.collect::<Result<HashSet<_>, _>>()?
        };
        if !existing_cols.contains("mitre_techniques") {
            conn.execute(
                "ALTER TABLE evidence ADD COLUMN mitre_techniques TEXT NOT NULL DEFAULT '[]'",
                [],
            )?;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    pub async fn insert_alert(&self, alert: &Alert) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO alerts
             (alert_id, tenant_id, title, severity, source, timestamp, raw_payload, entities)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                alert.alert_id,
                alert.tenant_id,
                alert.title,
                alert.severity.as_str(),
                alert.source,
                alert.timestamp.to_rfc3339(),
                serde_json::to_string(&alert.raw_payload)?,
                serde_json::to_string(&alert.entities)?,
            ],
        )?;
        Ok(())
    }

    pub async fn get_alert(&self, tenant_id: &str, alert_id: &str) -> StoreResult<Alert> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT alert_id, tenant_id, title, severity, source, timestamp, raw_payload, entities
             FROM alerts WHERE tenant_id = ?1 AND alert_id = ?2",
            params![tenant_id, alert_id],
            alert_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::not_found(format!("alert {alert_id}")))
    }

    // ------------------------------------------------------------------
    // Investigations
    // ------------------------------------------------------------------

    pub async fn insert_investigation(&self, investigation: &Investigation) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO investigations
             (investigation_id, tenant_id, alert_id, user_id, priority, severity, status,
              created_at, started_at, completed_at, timeout_ms, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                investigation.investigation_id,
                investigation.tenant_id,
                investigation.alert_id,
                investigation.user_id,
                investigation.priority,
                investigation.severity.as_str(),
                investigation.status.as_str(),
                investigation.created_at.to_rfc3339(),
                investigation.started_at.map(|t| t.to_rfc3339()),
                investigation.completed_at.map(|t| t.to_rfc3339()),
                investigation.timeout_ms,
                serde_json::to_string(&investigation.metadata)?,
            ],
        )?;
        Ok(())
    }

    pub async fn get_investigation(
        &self,
        tenant_id: &str,
        investigation_id: &str,
    ) -> StoreResult<Investigation> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT investigation_id, tenant_id, alert_id, user_id, priority, severity, status,
                    created_at, started_at, completed_at, timeout_ms, metadata
             FROM investigations WHERE tenant_id = ?1 AND investigation_id = ?2",
            params![tenant_id, investigation_id],
            investigation_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::not_found(format!("investigation {investigation_id}")))
    }

    pub async fn set_investigation_status(
        &self,
        tenant_id: &str,
        investigation_id: &str,
        status: InvestigationStatus,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE investigations SET status = ?3
             WHERE tenant_id = ?1 AND investigation_id = ?2",
            params![tenant_id, investigation_id, status.as_str()],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found(format!(
                "investigation {investigation_id}"
            )));
        }
        Ok(())
    }

    pub async fn mark_investigation_started(
        &self,
        tenant_id: &str,
        investigation_id: &str,
        started_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE investigations SET started_at = ?3
             WHERE tenant_id = ?1 AND investigation_id = ?2 AND started_at IS NULL",
            params![tenant_id, investigation_id, started_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn mark_investigation_completed(
        &self,
        tenant_id: &str,
        investigation_id: &str,
        status: InvestigationStatus,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE investigations SET status = ?3, completed_at = ?4
             WHERE tenant_id = ?1 AND investigation_id = ?2",
            params![
                tenant_id,
                investigation_id,
                status.as_str(),
                completed_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub async fn set_verdict(
        &self,
        tenant_id: &str,
        investigation_id: &str,
        verdict: &Verdict,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE investigations SET verdict = ?3
             WHERE tenant_id = ?1 AND investigation_id = ?2",
            params![
                tenant_id,
                investigation_id,
                serde_json::to_string(verdict)?
            ],
        )?;
        Ok(())
    }

    pub async fn get_verdict(
        &self,
        tenant_id: &str,
        investigation_id: &str,
    ) -> StoreResult<Option<Verdict>> {
        let conn = self.conn.lock().await;
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT verdict FROM investigations
                 WHERE tenant_id = ?1 AND investigation_id = ?2",
                params![tenant_id, investigation_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw.flatten() {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    pub async fn set_summary(
        &self,
        tenant_id: &str,
        investigation_id: &str,
        summary: &ExecutionSummary,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE investigations SET summary = ?3
             WHERE tenant_id = ?1 AND investigation_id = ?2",
            params![
                tenant_id,
                investigation_id,
                serde_json::to_string(summary)?
            ],
        )?;
        Ok(())
    }

    pub async fn get_summary(
        &self,
        tenant_id: &str,
        investigation_id: &str,
    ) -> StoreResult<Option<ExecutionSummary>> {
        let conn = self.conn.lock().await;
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT summary FROM investigations
                 WHERE tenant_id = ?1 AND investigation_id = ?2",
                params![tenant_id, investigation_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw.flatten() {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    pub async fn list_investigations(
        &self,
        tenant_id: &str,
        filter: &InvestigationFilter,
    ) -> StoreResult<Vec<Investigation>> {
        let conn = self.conn.lock().await;
        let mut sql = String::from(
            "SELECT investigation_id, tenant_id, alert_id, user_id, priority, severity, status,
                    created_at, started_at, completed_at, timeout_ms, metadata
             FROM investigations WHERE tenant_id = ?1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(tenant_id.to_string())];

        if let Some(status) = filter.status {
            args.push(Box::new(status.as_str().to_string()));
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(severity) = filter.severity {
            args.push(Box::new(severity.as_str().to_string()));
            sql.push_str(&format!(" AND severity = ?{}", args.len()));
        }
        if let Some(from) = filter.from {
            args.push(Box::new(from.to_rfc3339()));
            sql.push_str(&format!(" AND created_at >= ?{}", args.len()));
        }
        if let Some(to) = filter.to {
            args.push(Box::new(to.to_rfc3339()));
            sql.push_str(&format!(" AND created_at <= ?{}", args.len()));
        }
        sql.push_str(" ORDER BY created_at DESC");
        args.push(Box::new(filter.effective_limit() as i64));
        sql.push_str(&format!(" LIMIT ?{}", args.len()));
        args.push(Box::new(filter.offset as i64));
        sql.push_str(&format!(" OFFSET ?{}", args.len()));

        let mut stmt = conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt.query_map(&params_ref[..], investigation_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Status counts and verdict latency since `since`, for the stats surface.
    pub async fn stats(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
        timeframe: &str,
    ) -> StoreResult<StatsReport> {
        let conn = self.conn.lock().await;
        let mut by_status = Vec::new();
        let mut total = 0_u64;
        {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM investigations
                 WHERE tenant_id = ?1 AND created_at >= ?2
                 GROUP BY status ORDER BY status",
            )?;
            let rows = stmt.query_map(params![tenant_id, since.to_rfc3339()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                total += count as u64;
                by_status.push((status, count as u64));
            }
        }

        let mut by_severity = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT severity, COUNT(*) FROM investigations
                 WHERE tenant_id = ?1 AND created_at >= ?2
                 GROUP BY severity ORDER BY severity",
            )?;
            let rows = stmt.query_map(params![tenant_id, since.to_rfc3339()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (severity, count) = row?;
                by_severity.push((severity, count as u64));
            }
        }

        let mut durations = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT started_at, completed_at FROM investigations
                 WHERE tenant_id = ?1 AND created_at >= ?2
                   AND started_at IS NOT NULL AND completed_at IS NOT NULL",
            )?;
            let rows = stmt.query_map(params![tenant_id, since.to_rfc3339()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (started, completed) = row?;
                if let (Ok(s), Ok(c)) = (parse_ts(&started), parse_ts(&completed)) {
                    durations.push((c - s).num_milliseconds().max(0) as f64);
                }
            }
        }
        let mean_time_to_verdict_ms = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<f64>() / durations.len() as f64)
        };

        Ok(StatsReport {
            timeframe: timeframe.to_string(),
            total,
            by_status,
            by_severity,
            mean_time_to_verdict_ms,
        })
    }

    // ------------------------------------------------------------------
    // Idempotency
    // ------------------------------------------------------------------

    pub async fn lookup_idempotency(
        &self,
        tenant_id: &str,
        key_hash: &str,
    ) -> StoreResult<Option<String>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT investigation_id FROM idempotency_keys
                 WHERE tenant_id = ?1 AND key_hash = ?2",
                params![tenant_id, key_hash],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub async fn insert_idempotency(
        &self,
        tenant_id: &str,
        key_hash: &str,
        investigation_id: &str,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO idempotency_keys (tenant_id, key_hash, investigation_id)
             VALUES (?1, ?2, ?3)",
            params![tenant_id, key_hash, investigation_id],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------

    pub async fn upsert_step(
        &self,
        tenant_id: &str,
        investigation_id: &str,
        plan_id: &str,
        step: &Step,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO steps
             (step_id, investigation_id, tenant_id, plan_id, name, step_type, dependencies,
              payload, data_sources, timeout_ms, max_retries, status, started_at, completed_at,
              retry_count, last_error, non_critical)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                step.step_id,
                investigation_id,
                tenant_id,
                plan_id,
                step.name,
                step.step_type.as_str(),
                serde_json::to_string(&step.dependencies)?,
                serde_json::to_string(&step.payload)?,
                serde_json::to_string(&step.data_sources)?,
                step.timeout_ms,
                step.max_retries,
                step.status.as_str(),
                step.started_at.map(|t| t.to_rfc3339()),
                step.completed_at.map(|t| t.to_rfc3339()),
                step.retry_count,
                step.last_error,
                step.non_critical as i64,
            ],
        )?;
        Ok(())
    }

    pub async fn list_steps(
        &self,
        tenant_id: &str,
        investigation_id: &str,
    ) -> StoreResult<Vec<Step>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT step_id, name, step_type, dependencies, payload, data_sources, timeout_ms,
                    max_retries, status, started_at, completed_at, retry_count, last_error,
                    non_critical
             FROM steps WHERE tenant_id = ?1 AND investigation_id = ?2
             ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![tenant_id, investigation_id], step_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ------------------------------------------------------------------
    // Evidence
    // ------------------------------------------------------------------

    pub async fn insert_evidence(&self, evidence: &Evidence) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO evidence
             (evidence_id, investigation_id, tenant_id, evidence_type, source, timestamp,
              payload, entities, confidence, quality_score, tags, mitre_techniques)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                evidence.evidence_id,
                evidence.investigation_id,
                evidence.tenant_id,
                evidence.evidence_type.as_str(),
                evidence.source,
                evidence.timestamp.to_rfc3339(),
                serde_json::to_string(&evidence.payload)?,
                serde_json::to_string(&evidence.entities)?,
                evidence.confidence,
                evidence.quality_score,
                serde_json::to_string(&evidence.tags)?,
                serde_json::to_string(&evidence.mitre_techniques)?,
            ],
        )?;
        Ok(())
    }

    pub async fn get_evidence(&self, tenant_id: &str, evidence_id: &str) -> StoreResult<Evidence> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("{EVIDENCE_SELECT} WHERE tenant_id = ?1 AND evidence_id = ?2"),
            params![tenant_id, evidence_id],
            evidence_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::not_found(format!("evidence {evidence_id}")))
    }

    pub async fn list_evidence(
        &self,
        tenant_id: &str,
        investigation_id: &str,
    ) -> StoreResult<Vec<Evidence>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{EVIDENCE_SELECT} WHERE tenant_id = ?1 AND investigation_id = ?2 ORDER BY timestamp"
        ))?;
        let rows = stmt.query_map(params![tenant_id, investigation_id], evidence_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn count_evidence(
        &self,
        tenant_id: &str,
        investigation_id: &str,
    ) -> StoreResult<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM evidence WHERE tenant_id = ?1 AND investigation_id = ?2",
            params![tenant_id, investigation_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// All evidence rows for a tenant, bounded; used by the search layer.
    pub async fn evidence_for_tenant(
        &self,
        tenant_id: &str,
        cap: usize,
    ) -> StoreResult<Vec<Evidence>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{EVIDENCE_SELECT} WHERE tenant_id = ?1 ORDER BY timestamp DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![tenant_id, cap as i64], evidence_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ------------------------------------------------------------------
    // Relationships
    // ------------------------------------------------------------------

    pub async fn insert_relationship(
        &self,
        tenant_id: &str,
        investigation_id: &str,
        relationship: &EvidenceRelationship,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO evidence_relationships
             (from_evidence_id, to_evidence_id, tenant_id, investigation_id, kind, strength,
              rationale)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                relationship.from_evidence_id,
                relationship.to_evidence_id,
                tenant_id,
                investigation_id,
                relationship.kind.as_str(),
                relationship.strength,
                relationship.rationale,
            ],
        )?;
        Ok(())
    }

    pub async fn list_relationships(
        &self,
        tenant_id: &str,
        investigation_id: &str,
    ) -> StoreResult<Vec<EvidenceRelationship>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT from_evidence_id, to_evidence_id, kind, strength, rationale
             FROM evidence_relationships
             WHERE tenant_id = ?1 AND investigation_id = ?2
             ORDER BY from_evidence_id, to_evidence_id, kind",
        )?;
        let rows = stmt.query_map(params![tenant_id, investigation_id], |row| {
            let kind_text: String = row.get(2)?;
            Ok(EvidenceRelationship {
                from_evidence_id: row.get(0)?,
                to_evidence_id: row.get(1)?,
                kind: kind_text
                    .parse::<RelationshipKind>()
                    .unwrap_or(RelationshipKind::Entity),
                strength: row.get(3)?,
                rationale: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ------------------------------------------------------------------
    // Feedback
    // ------------------------------------------------------------------

    pub async fn insert_feedback(&self, feedback: &Feedback) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO feedback
             (feedback_id, investigation_id, tenant_id, user_id, feedback_type, content,
              created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                feedback.feedback_id,
                feedback.investigation_id,
                feedback.tenant_id,
                feedback.user_id,
                feedback.feedback_type.as_str(),
                serde_json::to_string(&feedback.content)?,
                feedback.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn list_feedback(
        &self,
        tenant_id: &str,
        investigation_id: &str,
    ) -> StoreResult<Vec<Feedback>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{FEEDBACK_SELECT} WHERE tenant_id = ?1 AND investigation_id = ?2 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(params![tenant_id, investigation_id], feedback_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Pending feedback in arrival order, atomically marked consumed. Rows
    /// themselves are append-only; consumption is bookkeeping.
    pub async fn take_pending_feedback(
        &self,
        tenant_id: &str,
        investigation_id: &str,
    ) -> StoreResult<Vec<Feedback>> {
        let conn = self.conn.lock().await;
        let pending: Vec<Feedback> = {
            let mut stmt = conn.prepare(&format!(
                "{FEEDBACK_SELECT} WHERE tenant_id = ?1 AND investigation_id = ?2
                 AND consumed = 0 ORDER BY created_at"
            ))?;
            let rows = stmt.query_map(params![tenant_id, investigation_id], feedback_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        for feedback in &pending {
            conn.execute(
                "UPDATE feedback SET consumed = 1 WHERE feedback_id = ?1",
                params![feedback.feedback_id],
            )?;
        }
        Ok(pending)
    }

    // ------------------------------------------------------------------
    // Event log
    // ------------------------------------------------------------------

    pub async fn append_event(&self, tenant_id: &str, event: &EventRow) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO event_log (run_id, sequence, tenant_id, method, payload, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.run_id,
                event.sequence,
                tenant_id,
                event.method,
                serde_json::to_string(&event.payload)?,
                event.ts.to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict(format!(
                "event {}#{} already persisted",
                event.run_id, event.sequence
            )));
        }
        Ok(())
    }

    pub async fn last_sequence(&self, run_id: &str) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(sequence) FROM event_log WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }

    pub async fn events_after(
        &self,
        run_id: &str,
        from_sequence: i64,
        limit: usize,
    ) -> StoreResult<Vec<EventRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT run_id, sequence, method, payload, ts FROM event_log
             WHERE run_id = ?1 AND sequence > ?2 ORDER BY sequence LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![run_id, from_sequence, limit as i64], |row| {
            let payload_text: String = row.get(3)?;
            let ts_text: String = row.get(4)?;
            Ok(EventRow {
                run_id: row.get(0)?,
                sequence: row.get(1)?,
                method: row.get(2)?,
                payload: serde_json::from_str(&payload_text).unwrap_or(Value::Null),
                ts: parse_ts(&ts_text).unwrap_or_else(|_| Utc::now()),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn count_events(&self, run_id: &str) -> StoreResult<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM event_log WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ------------------------------------------------------------------
    // Connector definitions
    // ------------------------------------------------------------------

    pub async fn upsert_connector_definition(
        &self,
        definition: &ConnectorDefinition,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO connector_definitions (connector_id, tenant_id, definition)
             VALUES (?1, ?2, ?3)",
            params![
                definition.connector_id,
                definition.tenant_id,
                serde_json::to_string(definition)?,
            ],
        )?;
        Ok(())
    }

    pub async fn list_connector_definitions(
        &self,
        tenant_id: &str,
    ) -> StoreResult<Vec<ConnectorDefinition>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT definition FROM connector_definitions WHERE tenant_id = ?1
             ORDER BY connector_id",
        )?;
        let rows = stmt.query_map(params![tenant_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    pub async fn delete_connector_definition(
        &self,
        tenant_id: &str,
        connector_id: &str,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM connector_definitions WHERE tenant_id = ?1 AND connector_id = ?2",
            params![tenant_id, connector_id],
        )?;
        Ok(deleted > 0)
    }
}

const EVIDENCE_SELECT: &str = "SELECT evidence_id, investigation_id, tenant_id, evidence_type,
        source, timestamp, payload, entities, confidence, quality_score, tags, mitre_techniques
 FROM evidence";

const FEEDBACK_SELECT: &str = "SELECT feedback_id, investigation_id, tenant_id, user_id,
        feedback_type, content, created_at
 FROM feedback";

fn parse_ts(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(text).map(|dt| dt.with_timezone(&Utc))
}

fn text_error(index: usize, err: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        format!("{err}").into(),
    )
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let severity_text: String = row.get(3)?;
    let ts_text: String = row.get(5)?;
    let raw_payload_text: String = row.get(6)?;
    let entities_text: String = row.get(7)?;
    Ok(Alert {
        alert_id: row.get(0)?,
        tenant_id: row.get(1)?,
        title: row.get(2)?,
        severity: severity_text
            .parse::<Severity>()
            .map_err(|e| text_error(3, e))?,
        source: row.get(4)?,
        timestamp: parse_ts(&ts_text).map_err(|e| text_error(5, e))?,
        raw_payload: serde_json::from_str(&raw_payload_text).map_err(|e| text_error(6, e))?,
        entities: serde_json::from_str::<EntityMap>(&entities_text)
            .map_err(|e| text_error(7, e))?,
    })
}

fn investigation_from_row(row: &Row<'_>) -> rusqlite::Result<Investigation> {
    let severity_text: String = row.get(5)?;
    let status_text: String = row.get(6)?;
    let created_text: String = row.get(7)?;
    let started_text: Option<String> = row.get(8)?;
    let completed_text: Option<String> = row.get(9)?;
    let metadata_text: String = row.get(11)?;
    Ok(Investigation {
        investigation_id: row.get(0)?,
        tenant_id: row.get(1)?,
        alert_id: row.get(2)?,
        user_id: row.get(3)?,
        priority: row.get(4)?,
        severity: severity_text
            .parse::<Severity>()
            .map_err(|e| text_error(5, e))?,
        status: status_text
            .parse::<InvestigationStatus>()
            .map_err(|e| text_error(6, e))?,
        created_at: parse_ts(&created_text).map_err(|e| text_error(7, e))?,
        started_at: started_text
            .map(|t| parse_ts(&t).map_err(|e| text_error(8, e)))
            .transpose()?,
        completed_at: completed_text
            .map(|t| parse_ts(&t).map_err(|e| text_error(9, e)))
            .transpose()?,
        timeout_ms: row.get(10)?,
        metadata: serde_json::from_str(&metadata_text).unwrap_or(Value::Null),
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<Step> {
    let step_type_text: String = row.get(2)?;
    let dependencies_text: String = row.get(3)?;
    let payload_text: String = row.get(4)?;
    let data_sources_text: String = row.get(5)?;
    let status_text: String = row.get(8)?;
    let started_text: Option<String> = row.get(9)?;
    let completed_text: Option<String> = row.get(10)?;
    let non_critical: i64 = row.get(13)?;
    Ok(Step {
        step_id: row.get(0)?,
        name: row.get(1)?,
        step_type: step_type_text
            .parse()
            .map_err(|e: String| text_error(2, e))?,
        dependencies: serde_json::from_str(&dependencies_text).map_err(|e| text_error(3, e))?,
        payload: serde_json::from_str(&payload_text).unwrap_or(Value::Null),
        data_sources: serde_json::from_str(&data_sources_text).map_err(|e| text_error(5, e))?,
        timeout_ms: row.get(6)?,
        max_retries: row.get(7)?,
        status: status_text.parse().map_err(|e: String| text_error(8, e))?,
        started_at: started_text
            .map(|t| parse_ts(&t).map_err(|e| text_error(9, e)))
            .transpose()?,
        completed_at: completed_text
            .map(|t| parse_ts(&t).map_err(|e| text_error(10, e)))
            .transpose()?,
        retry_count: row.get(11)?,
        last_error: row.get(12)?,
        non_critical: non_critical != 0,
    })
}

fn evidence_from_row(row: &Row<'_>) -> rusqlite::Result<Evidence> {
    let type_text: String = row.get(3)?;
    let ts_text: String = row.get(5)?;
    let payload_text: String = row.get(6)?;
    let entities_text: String = row.get(7)?;
    let tags_text: String = row.get(10)?;
    let techniques_text: String = row.get(11)?;
    Ok(Evidence {
        evidence_id: row.get(0)?,
        investigation_id: row.get(1)?,
        tenant_id: row.get(2)?,
        evidence_type: type_text.parse().map_err(|e: String| text_error(3, e))?,
        source: row.get(4)?,
        timestamp: parse_ts(&ts_text).map_err(|e| text_error(5, e))?,
        payload: serde_json::from_str(&payload_text).unwrap_or(Value::Null),
        entities: serde_json::from_str::<EntityMap>(&entities_text)
            .map_err(|e| text_error(7, e))?,
        confidence: row.get(8)?,
        quality_score: row.get(9)?,
        tags: serde_json::from_str(&tags_text).unwrap_or_default(),
        mitre_techniques: serde_json::from_str(&techniques_text).unwrap_or_default(),
    })
}

fn feedback_from_row(row: &Row<'_>) -> rusqlite::Result<Feedback> {
    let type_text: String = row.get(4)?;
    let content_text: String = row.get(5)?;
    let created_text: String = row.get(6)?;
    Ok(Feedback {
        feedback_id: row.get(0)?,
        investigation_id: row.get(1)?,
        tenant_id: row.get(2)?,
        user_id: row.get(3)?,
        feedback_type: type_text.parse().map_err(|e: String| text_error(4, e))?,
        content: serde_json::from_str(&content_text).unwrap_or(Value::Null),
        created_at: parse_ts(&created_text).map_err(|e| text_error(6, e))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentra_types::{EvidenceType, FeedbackType, StepStatus, StepType};
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (SqliteStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = SqliteStore::new(&temp.path().join("sentra.db"))
            .await
            .unwrap();
        (store, temp)
    }

    fn investigation(id: &str, tenant: &str) -> Investigation {
        Investigation {
            investigation_id: id.to_string(),
            tenant_id: tenant.to_string(),
            alert_id: "alert-1".to_string(),
            user_id: "user-1".to_string(),
            priority: 4,
            severity: Severity::High,
            status: InvestigationStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeout_ms: 60_000,
            metadata: json!({}),
        }
    }

    fn evidence(id: &str, tenant: &str, investigation_id: &str) -> Evidence {
        let mut entities = EntityMap::new();
        entities
            .entry("ip".to_string())
            .or_default()
            .insert("192.168.1.100".to_string());
        Evidence {
            evidence_id: id.to_string(),
            investigation_id: investigation_id.to_string(),
            tenant_id: tenant.to_string(),
            evidence_type: EvidenceType::Network,
            source: "siem".to_string(),
            timestamp: Utc::now(),
            payload: json!({"src_ip": "192.168.1.100"}),
            entities,
            confidence: 0.8,
            quality_score: 0.7,
            tags: vec!["netflow".to_string()],
            mitre_techniques: vec!["T1071".to_string()],
        }
    }

    #[tokio::test]
    async fn investigation_round_trip() {
        let (store, _tmp) = setup().await;
        let inv = investigation("inv-1", "tenant-a");
        store.insert_investigation(&inv).await.unwrap();

        let loaded = store.get_investigation("tenant-a", "inv-1").await.unwrap();
        assert_eq!(loaded.alert_id, "alert-1");
        assert_eq!(loaded.status, InvestigationStatus::Queued);

        store
            .set_investigation_status("tenant-a", "inv-1", InvestigationStatus::Planning)
            .await
            .unwrap();
        let loaded = store.get_investigation("tenant-a", "inv-1").await.unwrap();
        assert_eq!(loaded.status, InvestigationStatus::Planning);
    }

    #[tokio::test]
    async fn cross_tenant_read_fails() {
        let (store, _tmp) = setup().await;
        store
            .insert_investigation(&investigation("inv-1", "tenant-a"))
            .await
            .unwrap();
        let err = store.get_investigation("tenant-b", "inv-1").await;
        assert!(matches!(err, Err(StoreError::NotFound(_))));

        store
            .insert_evidence(&evidence("ev-1", "tenant-a", "inv-1"))
            .await
            .unwrap();
        assert!(store.get_evidence("tenant-b", "ev-1").await.is_err());
        assert!(store
            .list_evidence("tenant-b", "inv-1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn evidence_round_trip_preserves_entities_and_techniques() {
        let (store, _tmp) = setup().await;
        store
            .insert_evidence(&evidence("ev-1", "tenant-a", "inv-1"))
            .await
            .unwrap();
        let loaded = store.get_evidence("tenant-a", "ev-1").await.unwrap();
        assert!(loaded.entities.get("ip").unwrap().contains("192.168.1.100"));
        assert_eq!(loaded.mitre_techniques, vec!["T1071"]);
        assert_eq!(loaded.evidence_type, EvidenceType::Network);
    }

    #[tokio::test]
    async fn event_log_enforces_sequence_uniqueness() {
        let (store, _tmp) = setup().await;
        let row = EventRow {
            run_id: "run-1".to_string(),
            sequence: 1,
            method: "run/started".to_string(),
            payload: json!({"runId": "run-1"}),
            ts: Utc::now(),
        };
        store.append_event("tenant-a", &row).await.unwrap();
        let dup = store.append_event("tenant-a", &row).await;
        assert!(matches!(dup, Err(StoreError::Conflict(_))));
        assert_eq!(store.last_sequence("run-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn events_after_returns_ordered_tail() {
        let (store, _tmp) = setup().await;
        for seq in 1..=5 {
            store
                .append_event(
                    "tenant-a",
                    &EventRow {
                        run_id: "run-1".to_string(),
                        sequence: seq,
                        method: "item/evidence".to_string(),
                        payload: json!({"seq": seq}),
                        ts: Utc::now(),
                    },
                )
                .await
                .unwrap();
        }
        let tail = store.events_after("run-1", 2, 100).await.unwrap();
        let seqs: Vec<i64> = tail.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn pending_feedback_is_consumed_once() {
        let (store, _tmp) = setup().await;
        let feedback = Feedback {
            feedback_id: "fb-1".to_string(),
            investigation_id: "inv-1".to_string(),
            tenant_id: "tenant-a".to_string(),
            user_id: "user-1".to_string(),
            feedback_type: FeedbackType::VerdictCorrection,
            content: json!({"verdict": "false_positive"}),
            created_at: Utc::now(),
        };
        store.insert_feedback(&feedback).await.unwrap();

        let pending = store
            .take_pending_feedback("tenant-a", "inv-1")
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        let again = store
            .take_pending_feedback("tenant-a", "inv-1")
            .await
            .unwrap();
        assert!(again.is_empty());
        // The row itself is retained.
        assert_eq!(store.list_feedback("tenant-a", "inv-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn steps_round_trip() {
        let (store, _tmp) = setup().await;
        let step = Step {
            step_id: "s1".to_string(),
            name: "query siem".to_string(),
            step_type: StepType::Query,
            dependencies: vec![],
            payload: json!({"query": "auth"}),
            data_sources: vec!["siem".to_string()],
            timeout_ms: 5_000,
            max_retries: 2,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            last_error: None,
            non_critical: false,
        };
        store
            .upsert_step("tenant-a", "inv-1", "plan-1", &step)
            .await
            .unwrap();

        let mut updated = step.clone();
        updated.status = StepStatus::Complete;
        updated.retry_count = 1;
        store
            .upsert_step("tenant-a", "inv-1", "plan-1", &updated)
            .await
            .unwrap();

        let steps = store.list_steps("tenant-a", "inv-1").await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Complete);
        assert_eq!(steps[0].retry_count, 1);
    }

    #[tokio::test]
    async fn list_investigations_honors_filter_and_cap() {
        let (store, _tmp) = setup().await;
        for i in 0..5 {
            let mut inv = investigation(&format!("inv-{i}"), "tenant-a");
            inv.severity = if i % 2 == 0 {
                Severity::High
            } else {
                Severity::Low
            };
            store.insert_investigation(&inv).await.unwrap();
        }

        let filter = InvestigationFilter {
            severity: Some(Severity::High),
            ..Default::default()
        };
        let listed = store
            .list_investigations("tenant-a", &filter)
            .await
            .unwrap();
        assert_eq!(listed.len(), 3);

        let capped = InvestigationFilter {
            limit: Some(100_000),
            ..Default::default()
        };
        assert_eq!(capped.effective_limit(), 200);
    }

    #[tokio::test]
    async fn idempotency_key_maps_to_first_investigation() {
        let (store, _tmp) = setup().await;
        store
            .insert_idempotency("tenant-a", "hash-1", "inv-1")
            .await
            .unwrap();
        // Second insert with the same key is ignored.
        store
            .insert_idempotency("tenant-a", "hash-1", "inv-2")
            .await
            .unwrap();
        assert_eq!(
            store
                .lookup_idempotency("tenant-a", "hash-1")
                .await
                .unwrap()
                .as_deref(),
            Some("inv-1")
        );
        assert!(store
            .lookup_idempotency("tenant-b", "hash-1")
            .await
            .unwrap()
            .is_none());
    }
}
