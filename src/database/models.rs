use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Governs when entries move from active to archived to purged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub retention_days: i64,
    #[serde(default)]
    pub auto_archive_enabled: bool,
    #[serde(default)]
    pub auto_delete_enabled: bool,
    #[serde(default)]
    pub archive_retention_days: Option<i64>,
    #[serde(default)]
    pub gdpr_purge_enabled: bool,
}

/// Trace of one integrity check run; not itself chained
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub id: String,
    pub verified_entry_id: Option<String>,
    pub verification_timestamp: DateTime<Utc>,
    pub hash_valid: bool,
    pub chain_valid: bool,
    pub verification_details: serde_json::Value,
}

/// Minimal remains of a purged entry, kept so successors can still be linked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tombstone {
    pub entry_id: String,
    pub seq: i64,
    pub entry_hash: String,
    pub previous_hash: Option<String>,
    pub key_version: u32,
    pub created_at: DateTime<Utc>,
    pub purged_at: DateTime<Utc>,
}

/// Chain head record read together with what history actually holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHeadState {
    pub head_hash: Option<String>,
    pub entry_count: i64,
    /// Hash of the highest-seq entry across active, archived and tombstoned rows
    pub latest_hash: Option<String>,
    /// Rows in `audit_logs` plus tombstones
    pub recorded_count: i64,
}
