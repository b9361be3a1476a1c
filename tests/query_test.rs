//! Query and Export Tests

mod common;

use audit_trail::audit::query::{render_csv, CSV_HEADER};
use audit_trail::audit::{
    AuditAction, AuditFilter, AuditLogEntry, AuditReader, ExportFormat, NewAuditEntry, ResourceType,
    SortOrder,
};
use audit_trail::AuditError;
use chrono::Duration;
use common::{archive_policy, sample_entry, TestAudit};

async fn seed(audit: &TestAudit) -> Result<(), AuditError> {
    let start = audit.clock.now() - Duration::hours(10);
    for i in 0..5 {
        audit
            .logger
            .append(
                NewAuditEntry::new("user-1", AuditAction::Execute, ResourceType::Workflow, format!("wf-{}", i))
                    .timestamp(start + Duration::hours(i))
                    .with_context("run", i),
            )
            .await?;
    }
    for i in 0..2 {
        audit
            .logger
            .append(
                NewAuditEntry::new("user-2", AuditAction::Assign, ResourceType::Task, format!("task-{}", i))
                    .timestamp(start + Duration::hours(5 + i)),
            )
            .await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_pagination_reports_total_and_has_more() -> Result<(), Box<dyn std::error::Error>> {
    let audit = TestAudit::new().await;
    seed(&audit).await?;

    let page = audit.reader.query(&AuditFilter::actor("user-1").page(2, 0)).await?;
    assert_eq!(page.entries.len(), 2);
    assert_eq!(page.total_count, 5);
    assert_eq!(page.limit, 2);
    assert_eq!(page.offset, 0);
    assert!(page.has_more);

    let last = audit.reader.query(&AuditFilter::actor("user-1").page(2, 4)).await?;
    assert_eq!(last.entries.len(), 1);
    assert!(!last.has_more);

    Ok(())
}

#[tokio::test]
async fn test_limit_is_clamped() -> Result<(), Box<dyn std::error::Error>> {
    let audit = TestAudit::new().await;
    seed(&audit).await?;

    let result = audit.reader.query(&AuditFilter::default().page(50_000, -3)).await?;
    assert_eq!(result.limit, 1000);
    assert_eq!(result.offset, 0);
    assert_eq!(result.entries.len(), 7);

    let result = audit.reader.query(&AuditFilter::default()).await?;
    assert_eq!(result.limit, 100);

    Ok(())
}

#[tokio::test]
async fn test_huge_offset_returns_empty_page() -> Result<(), Box<dyn std::error::Error>> {
    let audit = TestAudit::new().await;
    seed(&audit).await?;

    let result = audit.reader.query(&AuditFilter::default().page(10, i64::MAX)).await?;
    assert!(result.entries.is_empty());
    assert_eq!(result.offset, i64::MAX);
    assert!(!result.has_more);

    Ok(())
}

#[tokio::test]
async fn test_sort_by_timestamp() -> Result<(), Box<dyn std::error::Error>> {
    let audit = TestAudit::new().await;
    seed(&audit).await?;

    let desc = audit.reader.query(&AuditFilter::actor("user-1")).await?;
    let ids: Vec<_> = desc.entries.iter().map(|e| e.resource_id.as_str()).collect();
    assert_eq!(ids, ["wf-4", "wf-3", "wf-2", "wf-1", "wf-0"]);

    let asc = audit
        .reader
        .query(&AuditFilter::actor("user-1").sorted(SortOrder::Asc))
        .await?;
    assert!(asc.entries.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert_eq!(asc.entries[0].resource_id, "wf-0");

    Ok(())
}

#[tokio::test]
async fn test_combined_filters() -> Result<(), Box<dyn std::error::Error>> {
    let audit = TestAudit::new().await;
    seed(&audit).await?;
    let start = audit.clock.now() - Duration::hours(10);

    let filter = AuditFilter {
        action: Some(AuditAction::Assign),
        resource_type: Some(ResourceType::Task),
        ..Default::default()
    };
    let result = audit.reader.query(&filter).await?;
    assert_eq!(result.total_count, 2);
    assert!(result.entries.iter().all(|e| e.actor == "user-2"));

    let filter = AuditFilter {
        resource_id: Some("wf-3".to_string()),
        ..Default::default()
    };
    assert_eq!(audit.reader.query(&filter).await?.total_count, 1);

    let filter = AuditFilter {
        start_date: Some(start + Duration::hours(1)),
        end_date: Some(start + Duration::hours(3)),
        ..Default::default()
    };
    let result = audit.reader.query(&filter).await?;
    let mut ids: Vec<_> = result.entries.iter().map(|e| e.resource_id.clone()).collect();
    ids.sort();
    assert_eq!(ids, ["wf-1", "wf-2", "wf-3"]);

    Ok(())
}

#[tokio::test]
async fn test_archived_entries_are_excluded() -> Result<(), Box<dyn std::error::Error>> {
    let audit = TestAudit::new().await;
    audit.append_days_ago(45, "old").await;
    audit.append_days_ago(1, "new").await;

    audit.retention.store_policy(&archive_policy("default", 30)).await?;
    audit.retention.archive_expired(None).await?;

    let result = audit.reader.query(&AuditFilter::actor("user-1")).await?;
    assert_eq!(result.total_count, 1);
    assert_eq!(result.entries[0].resource_id, "new");

    let export = audit.reader.export(&AuditFilter::default(), ExportFormat::Json).await?;
    assert!(!export.contains("\"old\""));

    Ok(())
}

#[tokio::test]
async fn test_json_export_round_trips_query() -> Result<(), Box<dyn std::error::Error>> {
    let audit = TestAudit::new().await;
    seed(&audit).await?;

    let filter = AuditFilter::actor("user-1").page(3, 1);
    let queried = audit.reader.query(&filter).await?;
    let exported = audit.reader.export(&filter, ExportFormat::Json).await?;
    let parsed: Vec<AuditLogEntry> = serde_json::from_str(&exported)?;

    let queried_ids: Vec<_> = queried.entries.iter().map(|e| e.id.clone()).collect();
    let exported_ids: Vec<_> = parsed.iter().map(|e| e.id.clone()).collect();
    assert_eq!(queried_ids, exported_ids);
    assert_eq!(parsed[0].entry_hash, queried.entries[0].entry_hash);

    Ok(())
}

#[tokio::test]
async fn test_export_clamps_explicit_limit_like_query() -> Result<(), Box<dyn std::error::Error>> {
    let audit = TestAudit::new().await;
    seed(&audit).await?;
    let reader = AuditReader::new(audit.db.clone()).with_limits(3, 50);

    let filter = AuditFilter::default().page(20, 0);
    let queried = reader.query(&filter).await?;
    let exported: Vec<AuditLogEntry> = serde_json::from_str(&reader.export(&filter, ExportFormat::Json).await?)?;

    assert_eq!(queried.entries.len(), 3);
    let queried_ids: Vec<_> = queried.entries.iter().map(|e| e.id.clone()).collect();
    let exported_ids: Vec<_> = exported.iter().map(|e| e.id.clone()).collect();
    assert_eq!(queried_ids, exported_ids);

    let everything: Vec<AuditLogEntry> =
        serde_json::from_str(&reader.export(&AuditFilter::default(), ExportFormat::Json).await?)?;
    assert_eq!(everything.len(), 7);

    Ok(())
}

#[tokio::test]
async fn test_export_without_limit_takes_everything() -> Result<(), Box<dyn std::error::Error>> {
    let audit = TestAudit::new().await;
    for i in 0..120 {
        audit.logger.append(sample_entry("bulk", &format!("r-{}", i))).await?;
    }

    let json = audit.reader.export(&AuditFilter::actor("bulk"), ExportFormat::Json).await?;
    let parsed: Vec<AuditLogEntry> = serde_json::from_str(&json)?;
    assert_eq!(parsed.len(), 120);

    Ok(())
}

#[tokio::test]
async fn test_csv_export() -> Result<(), Box<dyn std::error::Error>> {
    let audit = TestAudit::new().await;
    audit
        .logger
        .append(
            NewAuditEntry::new("ops \"lead\"", AuditAction::Export, ResourceType::Report, "q3")
                .with_context("note", "contains, comma"),
        )
        .await?;

    let csv = audit.reader.export_as(&AuditFilter::default(), "csv").await?;
    let lines: Vec<&str> = csv.split('\n').collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], render_csv(&[]));
    assert_eq!(lines[0].matches(',').count(), CSV_HEADER.len() - 1);
    assert!(lines[1].contains(r#""ops ""lead""""#));
    assert!(lines[1].contains(r#""{""note"":""contains, comma""}""#));

    Ok(())
}

#[tokio::test]
async fn test_unknown_export_format_is_rejected() {
    let audit = TestAudit::new().await;
    audit.db.pool().close().await;

    // The pool is closed, so reaching storage would surface a database error.
    let result = audit.reader.export_as(&AuditFilter::default(), "xml").await;
    assert!(matches!(result, Err(AuditError::UnsupportedExportFormat(f)) if f == "xml"));
}
