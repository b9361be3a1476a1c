//! Audit Log Verification
//!
//! Walks a window of the chain, checking every link and recomputing every
//! digest. Violations are reported item by item rather than raised.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::audit::entry::AuditLogEntry;
use crate::audit::hash::HashEngine;
use crate::database::models::{ChainHeadState, VerificationRecord};
use crate::database::queries::{Queries, AUDIT_LOG_COLUMNS};
use crate::database::Database;
use crate::error::AuditError;

pub const DEFAULT_VERIFY_LIMIT: i64 = 100;
pub const MAX_VERIFY_LIMIT: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainErrorKind {
    /// Recomputed digest does not match the stored one
    InvalidEntryHash,
    /// `previous_hash` does not point at the preceding entry
    ChainBroken,
}

impl fmt::Display for ChainErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainErrorKind::InvalidEntryHash => write!(f, "invalid entry hash"),
            ChainErrorKind::ChainBroken => write!(f, "chain broken"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainError {
    pub entry_id: String,
    pub kind: ChainErrorKind,
    pub message: String,
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.entry_id, self.kind, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub errors: Vec<ChainError>,
}

impl ChainVerification {
    pub fn hash_valid(&self) -> bool {
        !self.has(ChainErrorKind::InvalidEntryHash)
    }

    pub fn chain_valid(&self) -> bool {
        !self.has(ChainErrorKind::ChainBroken)
    }

    fn has(&self, kind: ChainErrorKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }
}

/// Verify a chain that starts at genesis. Entries must be in append order.
pub fn verify_chain(engine: &HashEngine, entries: &[AuditLogEntry]) -> ChainVerification {
    verify_chain_from(engine, None, entries)
}

/// Verify a window of the chain whose first entry should link to `anchor`.
///
/// With no anchor the first entry must be a genesis entry. Every entry's
/// digest is recomputed against its own stored `previous_hash`, so a broken
/// link is reported once as such and not again as a bad digest.
pub fn verify_chain_from(
    engine: &HashEngine,
    anchor: Option<&str>,
    entries: &[AuditLogEntry],
) -> ChainVerification {
    let mut errors = Vec::new();

    for (i, entry) in entries.iter().enumerate() {
        let expected = if i == 0 {
            anchor
        } else {
            Some(entries[i - 1].entry_hash.as_str())
        };

        if entry.previous_hash.as_deref() != expected {
            let message = match (i, expected) {
                (0, None) => "first entry should have a null previous hash".to_string(),
                (0, Some(_)) => "previous hash does not match the preceding entry".to_string(),
                _ => format!("previous hash mismatch at position {}", i),
            };
            errors.push(ChainError {
                entry_id: entry.id.clone(),
                kind: ChainErrorKind::ChainBroken,
                message,
            });
        }

        match engine.verify_entry(entry, entry.previous_hash.as_deref()) {
            Ok(true) => {}
            Ok(false) => errors.push(ChainError {
                entry_id: entry.id.clone(),
                kind: ChainErrorKind::InvalidEntryHash,
                message: format!("invalid entry hash at position {}", i),
            }),
            Err(e) => errors.push(ChainError {
                entry_id: entry.id.clone(),
                kind: ChainErrorKind::InvalidEntryHash,
                message: format!("cannot recompute digest: {}", e),
            }),
        }
    }

    for e in &errors {
        warn!("Audit chain violation: {}", e);
    }

    ChainVerification {
        valid: errors.is_empty(),
        errors,
    }
}

/// Outcome of one verification run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub valid: bool,
    pub verified_count: usize,
    pub errors: Vec<ChainError>,
    pub verification_timestamp: DateTime<Utc>,
    pub hash_valid: bool,
    pub chain_valid: bool,
    pub verification_id: String,
}

/// Verifies persisted windows of the chain and records each run
#[derive(Clone)]
pub struct ChainVerifier {
    db: Database,
    engine: Arc<HashEngine>,
}

impl ChainVerifier {
    pub fn new(db: Database, engine: Arc<HashEngine>) -> Self {
        Self { db, engine }
    }

    /// Verify up to `limit` active entries in append order, from the start of
    /// the active log or from `start_id`, and persist a verification record.
    pub async fn verify(
        &self,
        start_id: Option<&str>,
        limit: i64,
    ) -> Result<VerificationReport, AuditError> {
        let limit = limit.clamp(1, MAX_VERIFY_LIMIT);

        let result = self
            .db
            .traced("verify_chain", self.verify_window(start_id, limit))
            .await;
        if let Err(e) = &result {
            error!("Audit chain verification failed: {}", e);
        }
        let (entries, verification) = result?;

        let report = self.record(start_id, entries.len(), verification).await?;

        if report.valid {
            info!("Audit chain verified: {} entries", report.verified_count);
        } else {
            warn!(
                "Audit chain verification found {} violations in {} entries",
                report.errors.len(),
                report.verified_count
            );
        }

        Ok(report)
    }

    /// Verify the whole active log in windows of `window` entries, carrying
    /// the link across window boundaries, then check the chain head record
    /// against the newest entry in history. Produces a single record.
    pub async fn verify_all(&self, window: i64) -> Result<VerificationReport, AuditError> {
        let window = window.clamp(1, MAX_VERIFY_LIMIT);
        let mut verified = 0usize;
        let mut errors = Vec::new();
        let mut after_seq = 0i64;
        let mut carry: Option<AuditLogEntry> = None;

        loop {
            let entries = self.load_after(after_seq, window).await?;
            let Some(last) = entries.last().cloned() else {
                break;
            };

            let mut batch = verification_for_window(&self.db, &self.engine, carry.as_ref(), &entries).await?;
            errors.append(&mut batch.errors);
            verified += entries.len();
            after_seq = last.seq;
            carry = Some(last);
        }

        let head = self
            .db
            .traced("chain_head_state", Queries::chain_head_state(self.db.pool()))
            .await?;
        errors.extend(head_errors(&head));

        let verification = ChainVerification {
            valid: errors.is_empty(),
            errors,
        };
        let report = self.record(None, verified, verification).await?;

        info!(
            "Full audit chain verification: {} entries, valid = {}",
            report.verified_count, report.valid
        );
        Ok(report)
    }

    /// Most recent verification records, newest first
    pub async fn recent_verifications(&self, limit: i64) -> Result<Vec<VerificationRecord>, AuditError> {
        self.db
            .traced(
                "list_verification_records",
                Queries::list_verification_records(self.db.pool(), limit.max(1)),
            )
            .await
    }

    async fn verify_window(
        &self,
        start_id: Option<&str>,
        limit: i64,
    ) -> Result<(Vec<AuditLogEntry>, ChainVerification), AuditError> {
        let start_seq = match start_id {
            Some(id) => {
                let entry = self
                    .db
                    .traced("get_entry", Queries::get_entry(self.db.pool(), id))
                    .await?
                    .ok_or_else(|| AuditError::NotFound(format!("Audit entry not found: {}", id)))?;
                if entry.archived {
                    return Err(AuditError::ValidationError(format!(
                        "Audit entry {} is archived",
                        id
                    )));
                }
                entry.seq - 1
            }
            None => 0,
        };

        let entries = self.load_after(start_seq, limit).await?;
        let verification = verification_for_window(&self.db, &self.engine, None, &entries).await?;
        Ok((entries, verification))
    }

    async fn load_after(&self, after_seq: i64, limit: i64) -> Result<Vec<AuditLogEntry>, AuditError> {
        let sql = format!(
            "SELECT {} FROM audit_logs WHERE archived = 0 AND seq > ? ORDER BY seq ASC LIMIT ?",
            AUDIT_LOG_COLUMNS
        );
        let rows = self
            .db
            .traced(
                "load_window",
                sqlx::query(&sql).bind(after_seq).bind(limit).fetch_all(self.db.pool()),
            )
            .await?;

        rows.iter().map(AuditLogEntry::from_row).collect()
    }

    async fn record(
        &self,
        start_id: Option<&str>,
        verified_count: usize,
        verification: ChainVerification,
    ) -> Result<VerificationReport, AuditError> {
        let report = VerificationReport {
            valid: verification.valid,
            verified_count,
            hash_valid: verification.hash_valid(),
            chain_valid: verification.chain_valid(),
            errors: verification.errors,
            verification_timestamp: self.db.now(),
            verification_id: uuid::Uuid::new_v4().to_string(),
        };

        let record = VerificationRecord {
            id: report.verification_id.clone(),
            verified_entry_id: start_id.map(str::to_string),
            verification_timestamp: report.verification_timestamp,
            hash_valid: report.hash_valid,
            chain_valid: report.chain_valid,
            verification_details: json!({
                "verified_entries": report.verified_count,
                "errors": report.errors,
            }),
        };
        self.db
            .traced(
                "insert_verification_record",
                Queries::insert_verification_record(self.db.pool(), &record),
            )
            .await?;

        Ok(report)
    }
}

/// Check a window, resolving what its first entry should link to.
///
/// `carry` is the last entry of the previous window when verifying in
/// batches. Otherwise the predecessor is looked up in full history, which
/// includes archived entries and tombstones of purged ones. A first entry
/// with a null previous hash starts a new chain and needs no predecessor.
async fn verification_for_window(
    db: &Database,
    engine: &HashEngine,
    carry: Option<&AuditLogEntry>,
    entries: &[AuditLogEntry],
) -> Result<ChainVerification, AuditError> {
    let Some(first) = entries.first() else {
        return Ok(ChainVerification {
            valid: true,
            errors: Vec::new(),
        });
    };

    if let Some(prev) = carry {
        return Ok(verify_chain_from(engine, Some(&prev.entry_hash), entries));
    }

    let Some(claimed) = first.previous_hash.as_deref() else {
        return Ok(verify_chain_from(engine, None, entries));
    };

    let predecessor = db
        .traced("predecessor_hash", Queries::predecessor_hash(db.pool(), first.seq))
        .await?;
    if predecessor.as_deref() == Some(claimed) {
        return Ok(verify_chain_from(engine, Some(claimed), entries));
    }

    let mut verification = verify_chain_from(engine, Some(claimed), entries);
    let message = match predecessor {
        Some(_) => "previous hash does not match the preceding entry in history",
        None => "predecessor not found in history",
    };
    warn!("Audit chain violation: {} ({})", first.id, message);
    verification.errors.insert(
        0,
        ChainError {
            entry_id: first.id.clone(),
            kind: ChainErrorKind::ChainBroken,
            message: message.to_string(),
        },
    );
    verification.valid = false;
    Ok(verification)
}

/// Entry id used for violations found in the chain head record
pub const CHAIN_HEAD_ID: &str = "audit_chain_head";

/// The head record must name the newest entry in history and count every
/// entry ever appended, so removing the newest entries or an archived entry
/// without a tombstone is detected.
fn head_errors(head: &ChainHeadState) -> Vec<ChainError> {
    let mut errors = Vec::new();

    if head.head_hash != head.latest_hash {
        let message = match &head.head_hash {
            Some(hash) => format!("chain head not found: {} is not the newest entry in history", hash),
            None => "chain head is empty but history holds entries".to_string(),
        };
        errors.push(ChainError {
            entry_id: CHAIN_HEAD_ID.to_string(),
            kind: ChainErrorKind::ChainBroken,
            message,
        });
    }

    if head.entry_count != head.recorded_count {
        errors.push(ChainError {
            entry_id: CHAIN_HEAD_ID.to_string(),
            kind: ChainErrorKind::ChainBroken,
            message: format!(
                "entry count mismatch: {} appended, {} in history",
                head.entry_count, head.recorded_count
            ),
        });
    }

    for e in &errors {
        warn!("Audit chain violation: {}", e);
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::{AuditAction, ResourceType};
    use crate::audit::hash::StaticKeyring;
    use chrono::{Duration, TimeZone};
    use serde_json::{Map, Value};

    fn engine() -> HashEngine {
        HashEngine::new(Arc::new(StaticKeyring::new(1).with_key(1, "verify-test")))
    }

    fn chain(engine: &HashEngine, n: usize) -> Vec<AuditLogEntry> {
        let base = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let mut entries: Vec<AuditLogEntry> = Vec::new();

        for i in 0..n {
            let timestamp = base + Duration::seconds(i as i64);
            let previous_hash = entries.last().map(|e| e.entry_hash.clone());
            let mut entry = AuditLogEntry {
                seq: i as i64 + 1,
                id: format!("entry-{}", i),
                timestamp,
                actor: "user-1".to_string(),
                action: AuditAction::Execute,
                resource_type: ResourceType::Workflow,
                resource_id: format!("wf-{}", i),
                context: Map::new(),
                entry_hash: String::new(),
                previous_hash,
                nonce: HashEngine::nonce(),
                key_version: 1,
                created_at: timestamp,
                archived: false,
                archived_at: None,
            };
            entry.entry_hash = engine
                .digest(&entry.fields(), entry.previous_hash.as_deref(), &entry.nonce, 1)
                .unwrap();
            entries.push(entry);
        }

        entries
    }

    #[test]
    fn test_empty_chain_is_valid() {
        let result = verify_chain(&engine(), &[]);
        assert!(result.valid);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_intact_chain_is_valid() {
        let engine = engine();
        let result = verify_chain(&engine, &chain(&engine, 10));
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn test_tampered_content_flags_that_entry_only() {
        let engine = engine();
        let mut entries = chain(&engine, 6);
        let mut context = Map::new();
        context.insert("forged".to_string(), Value::Bool(true));
        entries[3].context = context;

        let result = verify_chain(&engine, &entries);
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].entry_id, "entry-3");
        assert_eq!(result.errors[0].kind, ChainErrorKind::InvalidEntryHash);
        assert!(result.chain_valid());
        assert!(!result.hash_valid());
    }

    #[test]
    fn test_broken_link_reports_chain_broken() {
        let engine = engine();
        let mut entries = chain(&engine, 5);
        entries[2].previous_hash = Some("deadbeef".to_string());

        let result = verify_chain(&engine, &entries);
        let broken: Vec<_> = result
            .errors
            .iter()
            .filter(|e| e.kind == ChainErrorKind::ChainBroken)
            .collect();
        assert_eq!(broken.len(), 1);
        assert_eq!(broken[0].entry_id, "entry-2");
        assert!(broken[0].message.contains("position 2"));
    }

    #[test]
    fn test_non_null_genesis_is_rejected() {
        let engine = engine();
        let entries = chain(&engine, 3);

        let result = verify_chain(&engine, &entries[1..]);
        assert!(!result.valid);
        assert_eq!(result.errors[0].entry_id, "entry-1");
        assert_eq!(result.errors[0].kind, ChainErrorKind::ChainBroken);
    }

    #[test]
    fn test_anchored_window_verifies() {
        let engine = engine();
        let entries = chain(&engine, 4);
        let anchor = entries[1].entry_hash.clone();

        let result = verify_chain_from(&engine, Some(&anchor), &entries[2..]);
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn test_head_record_must_match_history() {
        let state = |head: Option<&str>, count, latest: Option<&str>, recorded| ChainHeadState {
            head_hash: head.map(str::to_string),
            entry_count: count,
            latest_hash: latest.map(str::to_string),
            recorded_count: recorded,
        };

        assert!(head_errors(&state(None, 0, None, 0)).is_empty());
        assert!(head_errors(&state(Some("aa"), 3, Some("aa"), 3)).is_empty());

        let truncated = head_errors(&state(Some("ee"), 5, Some("cc"), 3));
        assert_eq!(truncated.len(), 2);
        assert!(truncated.iter().all(|e| e.kind == ChainErrorKind::ChainBroken));
        assert!(truncated[0].message.contains("chain head not found"));

        let dropped_archived = head_errors(&state(Some("ee"), 5, Some("ee"), 4));
        assert_eq!(dropped_archived.len(), 1);
        assert!(dropped_archived[0].message.contains("entry count mismatch"));
    }

    #[test]
    fn test_unknown_key_version_is_reported_not_raised() {
        let engine = engine();
        let mut entries = chain(&engine, 2);
        entries[1].key_version = 9;

        let result = verify_chain(&engine, &entries);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind, ChainErrorKind::InvalidEntryHash);
        assert!(result.errors[0].message.contains("9"));
    }
}
