//! Retention Manager
//!
//! Moves entries through `active -> archived -> purged`. Both transitions run
//! inside a chain write so they never interleave with an append.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::audit::entry::{check_storable, format_timestamp};
use crate::database::models::RetentionPolicy;
use crate::database::queries::Queries;
use crate::database::{ChainWrite, Database};
use crate::error::AuditError;

/// Longest retention or purge age accepted, in days (about a thousand years)
pub const MAX_RETENTION_DAYS: i64 = 365_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveOutcome {
    pub policy_id: String,
    pub archived_count: u64,
    pub archived_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeOutcome {
    pub deleted_count: u64,
    pub deleted_date: DateTime<Utc>,
}

/// Result of a scheduled retention pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionRunOutcome {
    pub archive: ArchiveOutcome,
    pub purge: Option<PurgeOutcome>,
}

#[derive(Clone)]
pub struct RetentionManager {
    db: Database,
}

impl RetentionManager {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Archive every active entry older than the policy's retention period.
    ///
    /// Uses the named policy, or the first auto-archive policy when none is
    /// named. Fails with `PolicyNotFound` before touching any entry.
    pub async fn archive_expired(&self, policy_id: Option<&str>) -> Result<ArchiveOutcome, AuditError> {
        self.db
            .traced("archive_expired", self.archive_in_chain(policy_id))
            .await
    }

    async fn archive_in_chain(&self, policy_id: Option<&str>) -> Result<ArchiveOutcome, AuditError> {
        let mut chain = self.db.begin_chain_write().await?;

        let policy = Queries::find_archive_policy(chain.conn(), policy_id)
            .await?
            .ok_or_else(|| AuditError::no_active_policy(policy_id))?;

        let now = self.db.now();
        let cutoff = retention_cutoff(now, policy.retention_days)?;

        match Self::archive_before(&mut chain, cutoff, now).await {
            Ok(archived_count) => {
                chain.commit().await?;
                info!(
                    "Archived {} audit entries older than {} days (policy {})",
                    archived_count, policy.retention_days, policy.id
                );
                Ok(ArchiveOutcome {
                    policy_id: policy.id,
                    archived_count,
                    archived_date: now,
                })
            }
            Err(e) => {
                error!("Error archiving audit logs: {}", e);
                chain.rollback().await?;
                Err(e)
            }
        }
    }

    async fn archive_before(
        chain: &mut ChainWrite,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, AuditError> {
        let result = sqlx::query(
            "UPDATE audit_logs SET archived = 1, archived_at = ? WHERE archived = 0 AND created_at < ?",
        )
        .bind(format_timestamp(&now))
        .bind(format_timestamp(&cutoff))
        .execute(chain.conn())
        .await
        .map_err(|e| AuditError::DatabaseError(format!("Failed to archive audit entries: {}", e)))?;

        Ok(result.rows_affected())
    }

    /// Permanently delete archived entries archived more than
    /// `older_than_days` ago. Each deleted entry leaves a tombstone holding
    /// its position and digests so later entries can still be linked.
    pub async fn purge_archived(&self, older_than_days: i64) -> Result<PurgeOutcome, AuditError> {
        retention_cutoff(self.db.now(), older_than_days)?;

        self.db
            .traced("purge_archived", self.purge_in_chain(older_than_days))
            .await
    }

    async fn purge_in_chain(&self, older_than_days: i64) -> Result<PurgeOutcome, AuditError> {
        let mut chain = self.db.begin_chain_write().await?;
        let now = self.db.now();
        let cutoff = retention_cutoff(now, older_than_days)?;

        match Self::purge_before(&mut chain, cutoff, now).await {
            Ok(deleted_count) => {
                chain.commit().await?;
                info!(
                    "GDPR purge deleted {} archived audit entries older than {} days",
                    deleted_count, older_than_days
                );
                Ok(PurgeOutcome {
                    deleted_count,
                    deleted_date: now,
                })
            }
            Err(e) => {
                error!("Error purging archived audit logs: {}", e);
                chain.rollback().await?;
                Err(e)
            }
        }
    }

    async fn purge_before(
        chain: &mut ChainWrite,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, AuditError> {
        let cutoff = format_timestamp(&cutoff);

        sqlx::query(
            r#"
            INSERT INTO audit_log_tombstones
            (entry_id, seq, entry_hash, previous_hash, key_version, created_at, purged_at)
            SELECT id, seq, entry_hash, previous_hash, key_version, created_at, ?
            FROM audit_logs
            WHERE archived = 1 AND archived_at < ?
            "#,
        )
        .bind(format_timestamp(&now))
        .bind(&cutoff)
        .execute(chain.conn())
        .await
        .map_err(|e| AuditError::DatabaseError(format!("Failed to write tombstones: {}", e)))?;

        let result = sqlx::query("DELETE FROM audit_logs WHERE archived = 1 AND archived_at < ?")
            .bind(&cutoff)
            .execute(chain.conn())
            .await
            .map_err(|e| AuditError::DatabaseError(format!("Failed to purge audit entries: {}", e)))?;

        Ok(result.rows_affected())
    }

    /// Purge using the age configured on a GDPR-enabled policy
    pub async fn purge_expired(&self, policy_id: Option<&str>) -> Result<PurgeOutcome, AuditError> {
        let policy = self
            .db
            .traced("find_purge_policy", Queries::find_purge_policy(self.db.pool(), policy_id))
            .await?
            .ok_or_else(|| AuditError::no_active_policy(policy_id))?;

        self.purge_archived(archive_retention_days(&policy)?).await
    }

    /// One scheduled pass: archive, then purge if the policy allows deletion
    pub async fn run(&self, policy_id: Option<&str>) -> Result<RetentionRunOutcome, AuditError> {
        let archive = self.archive_expired(policy_id).await?;

        let policy = self
            .db
            .traced(
                "get_retention_policy",
                Queries::get_retention_policy(self.db.pool(), &archive.policy_id),
            )
            .await?
            .ok_or_else(|| AuditError::PolicyNotFound(archive.policy_id.clone()))?;

        let purge = if policy.auto_delete_enabled && policy.gdpr_purge_enabled {
            Some(self.purge_archived(archive_retention_days(&policy)?).await?)
        } else {
            None
        };

        Ok(RetentionRunOutcome { archive, purge })
    }

    pub async fn store_policy(&self, policy: &RetentionPolicy) -> Result<(), AuditError> {
        self.db
            .traced(
                "upsert_retention_policy",
                Queries::upsert_retention_policy(self.db.pool(), policy, self.db.now()),
            )
            .await?;
        info!("Stored retention policy {} ({})", policy.id, policy.name);
        Ok(())
    }

    pub async fn policies(&self) -> Result<Vec<RetentionPolicy>, AuditError> {
        self.db
            .traced("list_retention_policies", Queries::list_retention_policies(self.db.pool()))
            .await
    }
}

/// `now` minus `days`, rejecting ages that are negative, beyond
/// `MAX_RETENTION_DAYS` or before the earliest storable timestamp
fn retention_cutoff(now: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>, AuditError> {
    if !(0..=MAX_RETENTION_DAYS).contains(&days) {
        return Err(AuditError::ValidationError(format!(
            "Retention age must be between 0 and {} days, got {}",
            MAX_RETENTION_DAYS, days
        )));
    }

    let cutoff = Duration::try_days(days)
        .and_then(|age| now.checked_sub_signed(age))
        .ok_or_else(|| AuditError::ValidationError(format!("Retention age out of range: {} days", days)))?;
    check_storable(&cutoff)?;
    Ok(cutoff)
}

fn archive_retention_days(policy: &RetentionPolicy) -> Result<i64, AuditError> {
    policy.archive_retention_days.ok_or_else(|| {
        AuditError::ValidationError(format!(
            "Policy {} enables GDPR purge without archive_retention_days",
            policy.id
        ))
    })
}
