//! Audit Log Query and Export
//!
//! Filtered, paginated reads over active entries and JSON/CSV export.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};
use std::fmt;
use std::str::FromStr;
use tracing::{error, info};

use crate::audit::entry::{canonical_context, format_timestamp, AuditAction, AuditLogEntry, ResourceType};
use crate::database::queries::AUDIT_LOG_COLUMNS;
use crate::database::Database;
use crate::error::AuditError;

/// Page size when the filter does not name one
pub const DEFAULT_QUERY_LIMIT: i64 = 100;

/// Hard cap on a single query page
pub const MAX_QUERY_LIMIT: i64 = 1000;

/// Hard cap on a single export
pub const MAX_EXPORT_LIMIT: i64 = 10_000;

pub const CSV_HEADER: [&str; 7] = [
    "ID",
    "Timestamp",
    "Actor",
    "Action",
    "Resource Type",
    "Resource ID",
    "Context",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortOrder {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(AuditError::ValidationError(format!("Invalid sort order: {}", other))),
        }
    }
}

/// Search criteria; every field is optional and they combine with AND
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditFilter {
    pub actor: Option<String>,
    pub action: Option<AuditAction>,
    pub resource_type: Option<ResourceType>,
    pub resource_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    #[serde(default)]
    pub sort: SortOrder,
}

impl AuditFilter {
    pub fn actor(actor: impl Into<String>) -> Self {
        Self {
            actor: Some(actor.into()),
            ..Self::default()
        }
    }

    pub fn page(mut self, limit: i64, offset: i64) -> Self {
        self.limit = Some(limit);
        self.offset = Some(offset);
        self
    }

    pub fn sorted(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    fn push_conditions(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        builder.push(" WHERE archived = 0");

        if let Some(actor) = &self.actor {
            builder.push(" AND actor = ").push_bind(actor.clone());
        }
        if let Some(action) = self.action {
            builder.push(" AND action = ").push_bind(action.as_str());
        }
        if let Some(resource_type) = self.resource_type {
            builder
                .push(" AND resource_type = ")
                .push_bind(resource_type.as_str());
        }
        if let Some(resource_id) = &self.resource_id {
            builder.push(" AND resource_id = ").push_bind(resource_id.clone());
        }
        if let Some(start) = &self.start_date {
            builder.push(" AND timestamp >= ").push_bind(format_timestamp(start));
        }
        if let Some(end) = &self.end_date {
            builder.push(" AND timestamp <= ").push_bind(format_timestamp(end));
        }
    }
}

/// One page of results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditQueryResult {
    pub entries: Vec<AuditLogEntry>,
    pub total_count: i64,
    pub limit: i64,
    pub offset: i64,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Csv => "text/csv",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            _ => Err(AuditError::UnsupportedExportFormat(s.to_string())),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Read-only access to the active log
#[derive(Clone)]
pub struct AuditReader {
    db: Database,
    max_query_limit: i64,
    max_export_limit: i64,
}

impl AuditReader {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            max_query_limit: MAX_QUERY_LIMIT,
            max_export_limit: MAX_EXPORT_LIMIT,
        }
    }

    pub fn with_limits(mut self, max_query_limit: i64, max_export_limit: i64) -> Self {
        self.max_query_limit = max_query_limit.max(1);
        self.max_export_limit = max_export_limit.max(self.max_query_limit);
        self
    }

    pub async fn query(&self, filter: &AuditFilter) -> Result<AuditQueryResult, AuditError> {
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, self.max_query_limit);
        self.db
            .traced("query_entries", self.query_page(filter, limit))
            .await
            .map_err(|e| {
                error!("Error querying audit logs: {}", e);
                e
            })
    }

    /// Render matching entries. An explicit limit is clamped exactly as
    /// `query` clamps it, so both return the same page; without one the
    /// export takes everything up to the export cap.
    pub async fn export(&self, filter: &AuditFilter, format: ExportFormat) -> Result<String, AuditError> {
        let limit = match filter.limit {
            Some(limit) => limit.clamp(1, self.max_query_limit),
            None => self.max_export_limit,
        };
        let result = self
            .db
            .traced("export_entries", self.query_page(filter, limit))
            .await
            .map_err(|e| {
                error!("Error exporting audit logs: {}", e);
                e
            })?;

        info!(
            "Exporting {} of {} audit entries as {}",
            result.entries.len(),
            result.total_count,
            format
        );

        match format {
            ExportFormat::Json => render_json(&result.entries),
            ExportFormat::Csv => Ok(render_csv(&result.entries)),
        }
    }

    /// Export with a format name; unknown formats fail before touching storage
    pub async fn export_as(&self, filter: &AuditFilter, format: &str) -> Result<String, AuditError> {
        let format = format.parse::<ExportFormat>()?;
        self.export(filter, format).await
    }

    async fn query_page(&self, filter: &AuditFilter, limit: i64) -> Result<AuditQueryResult, AuditError> {
        let offset = filter.offset.unwrap_or(0).max(0);

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM audit_logs");
        filter.push_conditions(&mut count);
        let total_count: i64 = count
            .build_query_scalar()
            .fetch_one(self.db.pool())
            .await?;

        let mut select = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM audit_logs", AUDIT_LOG_COLUMNS));
        filter.push_conditions(&mut select);
        select.push(match filter.sort {
            SortOrder::Asc => " ORDER BY timestamp ASC, seq ASC",
            SortOrder::Desc => " ORDER BY timestamp DESC, seq DESC",
        });
        select.push(" LIMIT ").push_bind(limit);
        select.push(" OFFSET ").push_bind(offset);

        let rows = select.build().fetch_all(self.db.pool()).await?;
        let entries = rows
            .iter()
            .map(AuditLogEntry::from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AuditQueryResult {
            entries,
            total_count,
            limit,
            offset,
            has_more: offset.saturating_add(limit) < total_count,
        })
    }
}

pub fn render_json(entries: &[AuditLogEntry]) -> Result<String, AuditError> {
    Ok(serde_json::to_string_pretty(entries)?)
}

/// Header row plus one row per entry; every cell quoted, quotes doubled
pub fn render_csv(entries: &[AuditLogEntry]) -> String {
    let mut lines = Vec::with_capacity(entries.len() + 1);
    lines.push(csv_row(CSV_HEADER.iter().map(|h| h.to_string())));

    for entry in entries {
        lines.push(csv_row(
            [
                entry.id.clone(),
                format_timestamp(&entry.timestamp),
                entry.actor.clone(),
                entry.action.to_string(),
                entry.resource_type.to_string(),
                entry.resource_id.clone(),
                canonical_context(&entry.context),
            ]
            .into_iter(),
        ));
    }

    lines.join("\n")
}

fn csv_row(cells: impl Iterator<Item = String>) -> String {
    cells
        .map(|cell| format!("\"{}\"", cell.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(",")
}
