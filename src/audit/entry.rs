//! Audit Log Entry
//!
//! Defines the structure for tamper-evident audit log entries and the
//! canonical form their digest is computed over.

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::fmt;
use std::str::FromStr;

use crate::error::AuditError;

/// Privileged actions that are recorded. The string forms are part of the
/// digest input and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Execute,
    Assign,
    Override,
    Pause,
    Resume,
    Delete,
    Create,
    Update,
    Export,
    Access,
}

impl AuditAction {
    pub const ALL: [AuditAction; 10] = [
        AuditAction::Execute,
        AuditAction::Assign,
        AuditAction::Override,
        AuditAction::Pause,
        AuditAction::Resume,
        AuditAction::Delete,
        AuditAction::Create,
        AuditAction::Update,
        AuditAction::Export,
        AuditAction::Access,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Execute => "execute",
            AuditAction::Assign => "assign",
            AuditAction::Override => "override",
            AuditAction::Pause => "pause",
            AuditAction::Resume => "resume",
            AuditAction::Delete => "delete",
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Export => "export",
            AuditAction::Access => "access",
        }
    }
}

impl FromStr for AuditAction {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuditAction::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| AuditError::ValidationError(format!("Unknown audit action: {}", s)))
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of resources an action can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Workflow,
    Task,
    Agent,
    Plugin,
    PluginExecution,
    User,
    Role,
    Permission,
    Config,
    Report,
}

impl ResourceType {
    pub const ALL: [ResourceType; 10] = [
        ResourceType::Workflow,
        ResourceType::Task,
        ResourceType::Agent,
        ResourceType::Plugin,
        ResourceType::PluginExecution,
        ResourceType::User,
        ResourceType::Role,
        ResourceType::Permission,
        ResourceType::Config,
        ResourceType::Report,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Workflow => "workflow",
            ResourceType::Task => "task",
            ResourceType::Agent => "agent",
            ResourceType::Plugin => "plugin",
            ResourceType::PluginExecution => "plugin_execution",
            ResourceType::User => "user",
            ResourceType::Role => "role",
            ResourceType::Permission => "permission",
            ResourceType::Config => "config",
            ResourceType::Report => "report",
        }
    }
}

impl FromStr for ResourceType {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| AuditError::ValidationError(format!("Unknown resource type: {}", s)))
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one privileged action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Insertion ordinal; chain order
    #[serde(skip)]
    pub seq: i64,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: AuditAction,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub context: Map<String, Value>,
    pub entry_hash: String,
    pub previous_hash: Option<String>,
    pub nonce: String,
    pub key_version: u32,
    pub created_at: DateTime<Utc>,
    pub archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
}

/// The hash-relevant content of an entry, minus chain linkage
#[derive(Debug, Clone, Copy)]
pub struct EntryFields<'a> {
    pub timestamp: &'a DateTime<Utc>,
    pub actor: &'a str,
    pub action: AuditAction,
    pub resource_type: ResourceType,
    pub resource_id: &'a str,
    pub context: &'a Map<String, Value>,
}

impl EntryFields<'_> {
    /// Digest input: `timestamp|actor|action|resource_type|resource_id|context|previous_hash|nonce`.
    ///
    /// Field order and rendering are a storage format; changing either
    /// invalidates every historical digest.
    pub fn canonical_string(&self, previous_hash: Option<&str>, nonce: &str) -> String {
        [
            format_timestamp(self.timestamp).as_str(),
            self.actor,
            self.action.as_str(),
            self.resource_type.as_str(),
            self.resource_id,
            canonical_context(self.context).as_str(),
            previous_hash.unwrap_or(""),
            nonce,
        ]
        .join("|")
    }
}

impl AuditLogEntry {
    pub fn fields(&self) -> EntryFields<'_> {
        EntryFields {
            timestamp: &self.timestamp,
            actor: &self.actor,
            action: self.action,
            resource_type: self.resource_type,
            resource_id: &self.resource_id,
            context: &self.context,
        }
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "{} {} {}:{} ({})",
            self.actor, self.action, self.resource_type, self.resource_id, self.entry_hash
        )
    }

    pub fn from_row(row: &SqliteRow) -> Result<Self, AuditError> {
        let context: String = row.try_get("context")?;
        let context = match serde_json::from_str::<Value>(&context)? {
            Value::Object(map) => map,
            other => {
                return Err(AuditError::ValidationError(format!(
                    "Stored context is not an object: {}",
                    other
                )))
            }
        };

        let key_version: i64 = row.try_get("key_version")?;
        let key_version = u32::try_from(key_version).map_err(|_| {
            AuditError::ValidationError(format!("Stored key version out of range: {}", key_version))
        })?;

        let archived_at: Option<String> = row.try_get("archived_at")?;

        Ok(Self {
            seq: row.try_get("seq")?,
            id: row.try_get("id")?,
            timestamp: parse_timestamp(&row.try_get::<String, _>("timestamp")?)?,
            actor: row.try_get("actor")?,
            action: row.try_get::<String, _>("action")?.parse()?,
            resource_type: row.try_get::<String, _>("resource_type")?.parse()?,
            resource_id: row.try_get("resource_id")?,
            context,
            entry_hash: row.try_get("entry_hash")?,
            previous_hash: row.try_get("previous_hash")?,
            nonce: row.try_get("nonce")?,
            key_version,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
            archived: row.try_get("archived")?,
            archived_at: archived_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

/// Input for a new entry; the chain fields are filled in on append
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub actor: String,
    pub action: AuditAction,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub context: Map<String, Value>,
}

impl NewAuditEntry {
    pub fn new(
        actor: impl Into<String>,
        action: AuditAction,
        resource_type: ResourceType,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            timestamp: None,
            actor: actor.into(),
            action,
            resource_type,
            resource_id: resource_id.into(),
            context: Map::new(),
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// When the action occurred, if not now
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<(), AuditError> {
        if self.actor.trim().is_empty() {
            return Err(AuditError::empty_field("actor"));
        }
        if self.resource_id.trim().is_empty() {
            return Err(AuditError::empty_field("resource_id"));
        }
        if let Some(id) = &self.id {
            if id.trim().is_empty() {
                return Err(AuditError::empty_field("id"));
            }
        }
        if let Some(timestamp) = &self.timestamp {
            check_storable(timestamp)?;
        }
        Ok(())
    }
}

/// Timestamps are stored as four-digit-year RFC 3339 text; anything outside
/// years 0000..=9999 could not be read back.
pub fn check_storable(timestamp: &DateTime<Utc>) -> Result<(), AuditError> {
    if (0..=9999).contains(&timestamp.year()) {
        Ok(())
    } else {
        Err(AuditError::ValidationError(format!(
            "Timestamp out of range (years 0000-9999): {}",
            timestamp
        )))
    }
}

/// RFC 3339 UTC with exactly three fractional digits; fixed width so lexical
/// order matches chronological order in storage.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, AuditError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AuditError::ValidationError(format!("Invalid timestamp {:?}: {}", value, e)))
}

pub fn truncate_to_millis(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(timestamp.timestamp_millis()).unwrap_or(timestamp)
}

/// Compact JSON with object keys sorted at every level
pub fn canonical_context(context: &Map<String, Value>) -> String {
    let mut out = String::new();
    write_canonical_object(context, &mut out);
    out
}

fn write_canonical_object(map: &Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical_value(&map[key], out);
    }
    out.push('}');
}

fn write_canonical_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_canonical_object(map, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical_value(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
