// Database schema definitions
// The audit log schema is idempotent and applied on every startup

pub const AUDIT_LOG_SCHEMA: &str = include_str!("../../migrations/001_audit_log.sql");
