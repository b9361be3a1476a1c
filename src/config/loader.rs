//! Retention policy file loader
//! Loads administrator-maintained YAML policy files for seeding the policy table

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::audit::retention::MAX_RETENTION_DAYS;
use crate::database::models::RetentionPolicy;
use crate::error::AuditError;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionPolicyFile {
    pub policies: Vec<RetentionPolicy>,
}

impl RetentionPolicyFile {
    /// Load and validate a policy file
    pub fn load(path: &Path) -> Result<Self, AuditError> {
        info!("Loading retention policies from: {:?}", path);

        if !path.exists() {
            return Err(AuditError::ConfigError(format!(
                "Policy file not found: {:?}",
                path
            )));
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| AuditError::ConfigError(format!("Failed to read {:?}: {}", path, e)))?;

        let file = Self::parse(&contents)
            .map_err(|e| AuditError::ConfigError(format!("{:?}: {}", path, e)))?;

        info!("Loaded {} retention policies", file.policies.len());
        Ok(file)
    }

    pub fn parse(contents: &str) -> Result<Self, AuditError> {
        let file: Self = serde_yaml::from_str(contents)
            .map_err(|e| AuditError::ConfigError(format!("Failed to parse policy file: {}", e)))?;
        file.validate()?;
        Ok(file)
    }

    pub fn validate(&self) -> Result<(), AuditError> {
        if self.policies.is_empty() {
            return Err(AuditError::ConfigError(
                "No retention policies defined".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for policy in &self.policies {
            if !seen.insert(policy.id.as_str()) {
                return Err(AuditError::ConfigError(format!(
                    "Duplicate retention policy id: {}",
                    policy.id
                )));
            }
            validate_policy(policy)?;
        }

        Ok(())
    }
}

fn validate_policy(policy: &RetentionPolicy) -> Result<(), AuditError> {
    if policy.id.trim().is_empty() || policy.name.trim().is_empty() {
        return Err(AuditError::ConfigError(
            "Retention policy id and name are required".to_string(),
        ));
    }

    if policy.retention_days <= 0 || policy.retention_days > MAX_RETENTION_DAYS {
        return Err(AuditError::ConfigError(format!(
            "Policy {}: retention_days must be between 1 and {}, got {}",
            policy.id, MAX_RETENTION_DAYS, policy.retention_days
        )));
    }

    if let Some(days) = policy.archive_retention_days {
        if !(0..=MAX_RETENTION_DAYS).contains(&days) {
            return Err(AuditError::ConfigError(format!(
                "Policy {}: archive_retention_days must be between 0 and {}, got {}",
                policy.id, MAX_RETENTION_DAYS, days
            )));
        }
    }

    // Entries are only purged once archived.
    if policy.gdpr_purge_enabled && !policy.auto_archive_enabled {
        return Err(AuditError::ConfigError(format!(
            "Policy {}: gdpr_purge_enabled requires auto_archive_enabled",
            policy.id
        )));
    }

    if policy.gdpr_purge_enabled && policy.archive_retention_days.is_none() {
        return Err(AuditError::ConfigError(format!(
            "Policy {}: gdpr_purge_enabled requires archive_retention_days",
            policy.id
        )));
    }

    Ok(())
}
