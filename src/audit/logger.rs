//! Audit Logger
//!
//! Appends entries to the hash chain. Every append reads the chain tail,
//! digests the new entry against it and inserts it inside one chain write, so
//! concurrent appends can never claim the same predecessor.

use std::sync::Arc;
use tracing::{debug, error};

use crate::audit::entry::{
    canonical_context, format_timestamp, truncate_to_millis, AuditLogEntry, NewAuditEntry,
};
use crate::audit::hash::HashEngine;
use crate::database::queries::Queries;
use crate::database::{ChainWrite, Database};
use crate::error::AuditError;

/// Append service for the audit chain
#[derive(Clone)]
pub struct AuditLogger {
    db: Database,
    engine: Arc<HashEngine>,
}

impl AuditLogger {
    pub fn new(db: Database, engine: Arc<HashEngine>) -> Self {
        Self { db, engine }
    }

    /// Record a privileged action and return the persisted entry
    pub async fn append(&self, input: NewAuditEntry) -> Result<AuditLogEntry, AuditError> {
        input.validate()?;

        match self.db.traced("append_entry", self.append_in_chain(input)).await {
            Ok(entry) => {
                debug!("Appended audit entry: {}", entry.summary());
                Ok(entry)
            }
            Err(e) => {
                error!("Failed to append audit entry: {}", e);
                Err(e)
            }
        }
    }

    async fn append_in_chain(&self, input: NewAuditEntry) -> Result<AuditLogEntry, AuditError> {
        let mut chain = self.db.begin_chain_write().await?;

        let previous_hash = Self::tail_hash(&mut chain).await?;

        let created_at = self.db.now();
        let mut entry = AuditLogEntry {
            seq: 0,
            id: input.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            timestamp: truncate_to_millis(input.timestamp.unwrap_or(created_at)),
            actor: input.actor,
            action: input.action,
            resource_type: input.resource_type,
            resource_id: input.resource_id,
            context: input.context,
            entry_hash: String::new(),
            previous_hash,
            nonce: HashEngine::nonce(),
            key_version: self.engine.current_key_version(),
            created_at,
            archived: false,
            archived_at: None,
        };

        entry.entry_hash = self.engine.digest(
            &entry.fields(),
            entry.previous_hash.as_deref(),
            &entry.nonce,
            entry.key_version,
        )?;

        let result = sqlx::query(
            r#"
            INSERT INTO audit_logs
            (id, timestamp, actor, action, resource_type, resource_id, context,
             entry_hash, previous_hash, nonce, key_version, created_at, archived)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&entry.id)
        .bind(format_timestamp(&entry.timestamp))
        .bind(&entry.actor)
        .bind(entry.action.as_str())
        .bind(entry.resource_type.as_str())
        .bind(&entry.resource_id)
        .bind(canonical_context(&entry.context))
        .bind(&entry.entry_hash)
        .bind(entry.previous_hash.as_deref())
        .bind(&entry.nonce)
        .bind(i64::from(entry.key_version))
        .bind(format_timestamp(&entry.created_at))
        .execute(chain.conn())
        .await
        .map_err(|e| AuditError::DatabaseError(format!("Failed to insert audit entry: {}", e)))?;

        if result.rows_affected() != 1 {
            return Err(AuditError::DatabaseError(
                "Failed to insert audit log entry".to_string(),
            ));
        }
        entry.seq = result.last_insert_rowid();

        sqlx::query(
            "UPDATE audit_chain_head SET head_hash = ?, entry_count = entry_count + 1 WHERE id = 1",
        )
        .bind(&entry.entry_hash)
        .execute(chain.conn())
        .await?;

        chain.commit().await?;

        Ok(entry)
    }

    /// Hash of the most recently created active entry
    async fn tail_hash(chain: &mut ChainWrite) -> Result<Option<String>, AuditError> {
        let hash = sqlx::query_scalar::<_, String>(
            "SELECT entry_hash FROM audit_logs WHERE archived = 0 ORDER BY seq DESC LIMIT 1",
        )
        .fetch_optional(chain.conn())
        .await?;
        Ok(hash)
    }

    /// Hash of the last entry ever appended, from the chain head record
    pub async fn head_hash(&self) -> Result<Option<String>, AuditError> {
        let head = self
            .db
            .traced(
                "chain_head_hash",
                sqlx::query_scalar::<_, Option<String>>("SELECT head_hash FROM audit_chain_head WHERE id = 1")
                    .fetch_optional(self.db.pool()),
            )
            .await?;
        Ok(head.flatten())
    }

    /// Number of entries ever appended, including archived and purged ones
    pub async fn entry_count(&self) -> Result<i64, AuditError> {
        let count = self
            .db
            .traced(
                "chain_entry_count",
                sqlx::query_scalar::<_, i64>("SELECT entry_count FROM audit_chain_head WHERE id = 1")
                    .fetch_optional(self.db.pool()),
            )
            .await?;
        Ok(count.unwrap_or(0))
    }

    pub async fn get_entry(&self, id: &str) -> Result<Option<AuditLogEntry>, AuditError> {
        self.db
            .traced("get_entry", Queries::get_entry(self.db.pool(), id))
            .await
    }
}
