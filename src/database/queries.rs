use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqlitePool};

use crate::audit::entry::{format_timestamp, parse_timestamp, AuditLogEntry};
use crate::database::models::*;
use crate::error::AuditError;

pub const AUDIT_LOG_COLUMNS: &str = "seq, id, timestamp, actor, action, resource_type, resource_id, \
     context, entry_hash, previous_hash, nonce, key_version, created_at, archived, archived_at";

const POLICY_COLUMNS: &str = "id, name, description, retention_days, auto_archive_enabled, \
     auto_delete_enabled, archive_retention_days, gdpr_purge_enabled";

pub struct Queries;

impl Queries {
    pub async fn get_entry<'e, E>(executor: E, id: &str) -> Result<Option<AuditLogEntry>, AuditError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query(&format!(
            "SELECT {} FROM audit_logs WHERE id = ?",
            AUDIT_LOG_COLUMNS
        ))
        .bind(id)
        .fetch_optional(executor)
        .await?;

        row.as_ref().map(AuditLogEntry::from_row).transpose()
    }

    /// Hash of the entry immediately before `seq` in full history, whether it
    /// is active, archived or survives only as a tombstone
    pub async fn predecessor_hash<'e, E>(executor: E, seq: i64) -> Result<Option<String>, AuditError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let hash = sqlx::query_scalar::<_, String>(
            r#"
            SELECT entry_hash FROM (
                SELECT seq, entry_hash FROM audit_logs WHERE seq < ?
                UNION ALL
                SELECT seq, entry_hash FROM audit_log_tombstones WHERE seq < ?
            )
            ORDER BY seq DESC
            LIMIT 1
            "#,
        )
        .bind(seq)
        .bind(seq)
        .fetch_optional(executor)
        .await?;

        Ok(hash)
    }

    /// Read the sentinel head and the newest recorded entry in one statement
    pub async fn chain_head_state<'e, E>(executor: E) -> Result<ChainHeadState, AuditError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query(
            r#"
            SELECT
                h.head_hash,
                h.entry_count,
                (SELECT entry_hash FROM (
                    SELECT seq, entry_hash FROM audit_logs
                    UNION ALL
                    SELECT seq, entry_hash FROM audit_log_tombstones
                 ) ORDER BY seq DESC LIMIT 1) AS latest_hash,
                (SELECT COUNT(*) FROM audit_logs)
                    + (SELECT COUNT(*) FROM audit_log_tombstones) AS recorded_count
            FROM audit_chain_head h
            WHERE h.id = 1
            "#,
        )
        .fetch_one(executor)
        .await?;

        Ok(ChainHeadState {
            head_hash: row.try_get("head_hash")?,
            entry_count: row.try_get("entry_count")?,
            latest_hash: row.try_get("latest_hash")?,
            recorded_count: row.try_get("recorded_count")?,
        })
    }

    pub async fn upsert_retention_policy(
        pool: &SqlitePool,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<(), AuditError> {
        let now = format_timestamp(&now);
        sqlx::query(
            r#"
            INSERT INTO retention_policies
            (id, name, description, retention_days, auto_archive_enabled, auto_delete_enabled,
             archive_retention_days, gdpr_purge_enabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                retention_days = excluded.retention_days,
                auto_archive_enabled = excluded.auto_archive_enabled,
                auto_delete_enabled = excluded.auto_delete_enabled,
                archive_retention_days = excluded.archive_retention_days,
                gdpr_purge_enabled = excluded.gdpr_purge_enabled,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&policy.id)
        .bind(&policy.name)
        .bind(&policy.description)
        .bind(policy.retention_days)
        .bind(policy.auto_archive_enabled)
        .bind(policy.auto_delete_enabled)
        .bind(policy.archive_retention_days)
        .bind(policy.gdpr_purge_enabled)
        .bind(&now)
        .bind(&now)
        .execute(pool)
        .await
        .map_err(|e| AuditError::DatabaseError(format!("Failed to store retention policy: {}", e)))?;

        Ok(())
    }

    pub async fn get_retention_policy<'e, E>(
        executor: E,
        id: &str,
    ) -> Result<Option<RetentionPolicy>, AuditError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query(&format!(
            "SELECT {} FROM retention_policies WHERE id = ?",
            POLICY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(executor)
        .await?;

        Ok(row.as_ref().map(policy_from_row).transpose()?)
    }

    pub async fn list_retention_policies(pool: &SqlitePool) -> Result<Vec<RetentionPolicy>, AuditError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM retention_policies ORDER BY id",
            POLICY_COLUMNS
        ))
        .fetch_all(pool)
        .await?;

        Ok(rows.iter().map(policy_from_row).collect::<Result<_, _>>()?)
    }

    /// The named archive-enabled policy, or the first one when no id is given
    pub async fn find_archive_policy<'e, E>(
        executor: E,
        policy_id: Option<&str>,
    ) -> Result<Option<RetentionPolicy>, AuditError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        Self::find_enabled_policy(executor, "auto_archive_enabled = 1", policy_id).await
    }

    /// The named purge-enabled policy, or the first one when no id is given
    pub async fn find_purge_policy<'e, E>(
        executor: E,
        policy_id: Option<&str>,
    ) -> Result<Option<RetentionPolicy>, AuditError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        Self::find_enabled_policy(
            executor,
            "gdpr_purge_enabled = 1 AND archive_retention_days IS NOT NULL",
            policy_id,
        )
        .await
    }

    async fn find_enabled_policy<'e, E>(
        executor: E,
        condition: &str,
        policy_id: Option<&str>,
    ) -> Result<Option<RetentionPolicy>, AuditError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = match policy_id {
            Some(_) => format!(
                "SELECT {} FROM retention_policies WHERE {} AND id = ?",
                POLICY_COLUMNS, condition
            ),
            None => format!(
                "SELECT {} FROM retention_policies WHERE {} ORDER BY created_at, id LIMIT 1",
                POLICY_COLUMNS, condition
            ),
        };

        let mut query = sqlx::query(&sql);
        if let Some(id) = policy_id {
            query = query.bind(id);
        }

        let row = query.fetch_optional(executor).await?;
        Ok(row.as_ref().map(policy_from_row).transpose()?)
    }

    pub async fn insert_verification_record(
        pool: &SqlitePool,
        record: &VerificationRecord,
    ) -> Result<(), AuditError> {
        sqlx::query(
            r#"
            INSERT INTO audit_log_verification
            (id, verified_entry_id, verification_timestamp, hash_valid, chain_valid, verification_details)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(record.verified_entry_id.as_deref())
        .bind(format_timestamp(&record.verification_timestamp))
        .bind(record.hash_valid)
        .bind(record.chain_valid)
        .bind(serde_json::to_string(&record.verification_details)?)
        .execute(pool)
        .await
        .map_err(|e| AuditError::DatabaseError(format!("Failed to store verification record: {}", e)))?;

        Ok(())
    }

    pub async fn list_verification_records(
        pool: &SqlitePool,
        limit: i64,
    ) -> Result<Vec<VerificationRecord>, AuditError> {
        let rows = sqlx::query(
            r#"
            SELECT id, verified_entry_id, verification_timestamp, hash_valid, chain_valid,
                   verification_details
            FROM audit_log_verification
            ORDER BY verification_timestamp DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<VerificationRecord, AuditError> {
                let details: String = row.try_get("verification_details")?;
                Ok(VerificationRecord {
                    id: row.try_get("id")?,
                    verified_entry_id: row.try_get("verified_entry_id")?,
                    verification_timestamp: parse_timestamp(
                        &row.try_get::<String, _>("verification_timestamp")?,
                    )?,
                    hash_valid: row.try_get("hash_valid")?,
                    chain_valid: row.try_get("chain_valid")?,
                    verification_details: serde_json::from_str(&details)?,
                })
            })
            .collect()
    }

    pub async fn list_tombstones(pool: &SqlitePool) -> Result<Vec<Tombstone>, AuditError> {
        let rows = sqlx::query(
            r#"
            SELECT entry_id, seq, entry_hash, previous_hash, key_version, created_at, purged_at
            FROM audit_log_tombstones
            ORDER BY seq
            "#,
        )
        .fetch_all(pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Tombstone, AuditError> {
                let key_version: i64 = row.try_get("key_version")?;
                Ok(Tombstone {
                    entry_id: row.try_get("entry_id")?,
                    seq: row.try_get("seq")?,
                    entry_hash: row.try_get("entry_hash")?,
                    previous_hash: row.try_get("previous_hash")?,
                    key_version: u32::try_from(key_version).map_err(|_| {
                        AuditError::ValidationError(format!("Stored key version out of range: {}", key_version))
                    })?,
                    created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
                    purged_at: parse_timestamp(&row.try_get::<String, _>("purged_at")?)?,
                })
            })
            .collect()
    }
}

fn policy_from_row(row: &SqliteRow) -> Result<RetentionPolicy, sqlx::Error> {
    Ok(RetentionPolicy {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        retention_days: row.try_get("retention_days")?,
        auto_archive_enabled: row.try_get("auto_archive_enabled")?,
        auto_delete_enabled: row.try_get("auto_delete_enabled")?,
        archive_retention_days: row.try_get("archive_retention_days")?,
        gdpr_purge_enabled: row.try_get("gdpr_purge_enabled")?,
    })
}
