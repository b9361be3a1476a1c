use thiserror::Error;

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        Self::CryptoError(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for AuditError {
    fn from(err: sqlx::Error) -> Self {
        Self::DatabaseError(format!("Database error: {}", err))
    }
}

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    #[error("No applicable retention policy: {0}")]
    PolicyNotFound(String),

    #[error("Unsupported export format: {0}")]
    UnsupportedExportFormat(String),

    #[error("Unknown key version: {0}")]
    UnknownKeyVersion(u32),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl AuditError {
    pub fn empty_field(field: &str) -> Self {
        Self::ValidationError(format!("{} cannot be empty", field))
    }

    pub fn no_active_policy(policy_id: Option<&str>) -> Self {
        match policy_id {
            Some(id) => Self::PolicyNotFound(format!("no enabled retention policy with id {}", id)),
            None => Self::PolicyNotFound("no active retention policy found".to_string()),
        }
    }
}
