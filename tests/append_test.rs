//! Append Service Tests
//!
//! Chain linkage, nonce freshness and serialization of concurrent appends.

mod common;

use audit_trail::audit::{verify_chain, AuditAction, NewAuditEntry, ResourceType};
use audit_trail::AuditError;
use audit_trail::audit::AuditFilter;
use chrono::{DateTime, TimeZone, Utc};
use common::{sample_entry, TestAudit};
use std::collections::HashSet;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_sequential_appends_form_valid_chain() -> Result<(), Box<dyn std::error::Error>> {
    let audit = TestAudit::new().await;

    let mut entries = Vec::new();
    for i in 0..25 {
        entries.push(audit.logger.append(sample_entry("user-1", &format!("wf-{}", i))).await?);
    }

    assert_eq!(entries[0].previous_hash, None);
    for pair in entries.windows(2) {
        assert_eq!(pair[1].previous_hash.as_deref(), Some(pair[0].entry_hash.as_str()));
    }

    let result = verify_chain(&audit.engine, &entries);
    assert!(result.valid, "{:?}", result.errors);

    let report = audit.verifier.verify(None, 100).await?;
    assert!(report.valid);
    assert_eq!(report.verified_count, 25);
    assert_eq!(audit.logger.entry_count().await?, 25);
    assert_eq!(audit.logger.head_hash().await?, Some(entries[24].entry_hash.clone()));

    Ok(())
}

#[tokio::test]
async fn test_identical_content_yields_distinct_hashes() -> Result<(), Box<dyn std::error::Error>> {
    let audit = TestAudit::new().await;
    let at = audit.clock.now();

    let input = NewAuditEntry::new("user-1", AuditAction::Delete, ResourceType::Plugin, "plugin-1")
        .timestamp(at)
        .with_context("reason", "cleanup");

    let first = audit.logger.append(input.clone()).await?;
    let second = audit.logger.append(input).await?;

    assert_ne!(first.nonce, second.nonce);
    assert_ne!(first.entry_hash, second.entry_hash);
    assert_eq!(first.timestamp, second.timestamp);

    Ok(())
}

#[tokio::test]
async fn test_concurrent_appends_do_not_fork_chain() -> Result<(), Box<dyn std::error::Error>> {
    let audit = TestAudit::new().await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let logger = audit.logger.clone();
        handles.push(tokio::spawn(async move {
            logger
                .append(sample_entry(&format!("user-{}", i % 4), &format!("task-{}", i)))
                .await
        }));
    }

    for handle in handles {
        assert_ok!(handle.await?);
    }

    let report = audit.verifier.verify(None, 100).await?;
    assert!(report.valid, "{:?}", report.errors);
    assert_eq!(report.verified_count, 20);

    let all = audit.reader.query(&Default::default()).await?;
    let predecessors: HashSet<_> = all.entries.iter().map(|e| e.previous_hash.clone()).collect();
    assert_eq!(predecessors.len(), 20);

    Ok(())
}

#[tokio::test]
async fn test_caller_timestamp_and_context_are_preserved() -> Result<(), Box<dyn std::error::Error>> {
    let audit = TestAudit::new().await;
    let occurred: DateTime<Utc> = "2024-11-05T10:15:30.250Z".parse()?;

    let entry = audit
        .logger
        .append(
            NewAuditEntry::new("admin", AuditAction::Override, ResourceType::Agent, "agent-9")
                .id("override-1")
                .timestamp(occurred)
                .with_context("previous", serde_json::json!({"model": "a", "budget": 3}))
                .with_context("approved", true),
        )
        .await?;

    let stored = audit.logger.get_entry("override-1").await?.expect("entry stored");
    assert_eq!(stored, entry);
    assert_eq!(stored.timestamp, occurred);
    assert_eq!(stored.context["previous"]["budget"], 3);
    assert!(audit.engine.verify_entry(&stored, None)?);

    Ok(())
}

#[tokio::test]
async fn test_unstorable_timestamp_is_rejected_and_log_stays_readable() -> Result<(), Box<dyn std::error::Error>> {
    let audit = TestAudit::new().await;
    audit.logger.append(sample_entry("user-1", "wf-1")).await?;

    let year_10000 = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();
    let err = assert_err!(audit.logger.append(sample_entry("user-1", "wf-2").timestamp(year_10000)).await);
    assert!(matches!(err, AuditError::ValidationError(_)));
    assert_eq!(audit.logger.entry_count().await?, 1);

    let result = audit.reader.query(&AuditFilter::default()).await?;
    assert_eq!(result.total_count, 1);
    assert!(audit.verifier.verify(None, 100).await?.valid);

    Ok(())
}

#[tokio::test]
async fn test_duplicate_id_fails_without_advancing_chain() -> Result<(), Box<dyn std::error::Error>> {
    let audit = TestAudit::new().await;

    let first = audit.logger.append(sample_entry("user-1", "wf-1").id("dup")).await?;
    let err = assert_err!(audit.logger.append(sample_entry("user-1", "wf-2").id("dup")).await);
    assert!(matches!(err, AuditError::DatabaseError(_)));

    assert_eq!(audit.logger.entry_count().await?, 1);
    let next = audit.logger.append(sample_entry("user-1", "wf-3")).await?;
    assert_eq!(next.previous_hash, Some(first.entry_hash));

    Ok(())
}

#[tokio::test]
async fn test_stored_entries_are_immutable() -> Result<(), Box<dyn std::error::Error>> {
    let audit = TestAudit::new().await;
    let entry = audit.logger.append(sample_entry("user-1", "wf-1")).await?;

    let update = sqlx::query("UPDATE audit_logs SET actor = 'mallory' WHERE id = ?")
        .bind(&entry.id)
        .execute(audit.db.pool())
        .await;
    assert!(update.is_err());

    let delete = sqlx::query("DELETE FROM audit_logs WHERE id = ?")
        .bind(&entry.id)
        .execute(audit.db.pool())
        .await;
    assert!(delete.is_err());

    Ok(())
}
