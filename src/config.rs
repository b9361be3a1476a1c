pub mod loader;

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

use crate::audit::hash::StaticKeyring;
use crate::error::AuditError;

/// Secret material prefixed with this marker is base64-decoded.
const BASE64_PREFIX: &str = "base64:";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub database_url: String,
    pub current_key_version: u32,
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
    #[serde(default)]
    pub log_queries: bool,
    #[serde(default = "default_max_query_limit")]
    pub max_query_limit: i64,
    #[serde(default = "default_max_export_limit")]
    pub max_export_limit: i64,
    #[serde(default = "default_verify_limit")]
    pub default_verify_limit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyConfig {
    pub version: u32,
    pub secret: String,
}

fn default_max_query_limit() -> i64 {
    1000
}

fn default_max_export_limit() -> i64 {
    10_000
}

fn default_verify_limit() -> i64 {
    100
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://audit.db".to_string(),
            current_key_version: 1,
            keys: Vec::new(),
            log_queries: false,
            max_query_limit: default_max_query_limit(),
            max_export_limit: default_max_export_limit(),
            default_verify_limit: default_verify_limit(),
        }
    }
}

impl AuditConfig {
    /// Load configuration from the process environment
    pub fn load() -> Result<Self, AuditError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AuditError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("DATABASE_URL") {
            config.database_url = url;
        }

        if let Some(version) = lookup("AUDIT_LOG_KEY_VERSION") {
            config.current_key_version = version.trim().parse().map_err(|e| {
                AuditError::ConfigError(format!("Invalid AUDIT_LOG_KEY_VERSION {:?}: {}", version, e))
            })?;
        }

        if let Some(list) = lookup("AUDIT_LOG_KEYS") {
            config.keys = parse_key_list(&list)?;
        }

        // The current secret wins over a retired entry carrying the same version.
        if let Some(secret) = lookup("AUDIT_LOG_SECRET") {
            config.keys.retain(|k| k.version != config.current_key_version);
            config.keys.push(KeyConfig {
                version: config.current_key_version,
                secret,
            });
        }

        if let Some(flag) = lookup("AUDIT_LOG_QUERIES") {
            config.log_queries = parse_flag(&flag)?;
        }

        if let Some(limit) = lookup("AUDIT_MAX_QUERY_LIMIT") {
            config.max_query_limit = parse_limit("AUDIT_MAX_QUERY_LIMIT", &limit)?;
        }

        if let Some(limit) = lookup("AUDIT_MAX_EXPORT_LIMIT") {
            config.max_export_limit = parse_limit("AUDIT_MAX_EXPORT_LIMIT", &limit)?;
        }

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, AuditError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AuditError::ConfigError(format!("Failed to read {:?}: {}", path, e))
        })?;

        toml::from_str(&contents)
            .map_err(|e| AuditError::ConfigError(format!("Failed to parse {:?}: {}", path, e)))
    }

    pub fn validate(&self) -> Result<(), AuditError> {
        if self.database_url.trim().is_empty() {
            return Err(AuditError::ConfigError("database_url is empty".to_string()));
        }

        if !self.keys.iter().any(|k| k.version == self.current_key_version) {
            return Err(AuditError::ConfigError(format!(
                "No secret configured for current key version {} (set AUDIT_LOG_SECRET)",
                self.current_key_version
            )));
        }

        if self.keys.iter().any(|k| k.secret.is_empty()) {
            return Err(AuditError::ConfigError("Empty audit log secret".to_string()));
        }

        if self.max_query_limit <= 0 || self.max_export_limit < self.max_query_limit {
            return Err(AuditError::ConfigError(format!(
                "Invalid limits: query {} export {}",
                self.max_query_limit, self.max_export_limit
            )));
        }

        Ok(())
    }

    /// Build the versioned keyring used by the hash engine
    pub fn keyring(&self) -> Result<StaticKeyring, AuditError> {
        self.validate()?;

        let mut keyring = StaticKeyring::new(self.current_key_version);
        for key in &self.keys {
            keyring.insert(key.version, decode_secret(&key.secret)?);
        }
        Ok(keyring)
    }
}

/// Parse `version:secret` pairs separated by commas
fn parse_key_list(list: &str) -> Result<Vec<KeyConfig>, AuditError> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (version, secret) = item.split_once(':').ok_or_else(|| {
                AuditError::ConfigError(format!("Malformed key entry (expected version:secret): {}", item))
            })?;
            let version = version.trim().parse().map_err(|e| {
                AuditError::ConfigError(format!("Invalid key version {:?}: {}", version, e))
            })?;
            Ok(KeyConfig {
                version,
                secret: secret.to_string(),
            })
        })
        .collect()
}

fn decode_secret(secret: &str) -> Result<Vec<u8>, AuditError> {
    match secret.strip_prefix(BASE64_PREFIX) {
        Some(encoded) => base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| AuditError::ConfigError(format!("Invalid base64 secret: {}", e))),
        None => Ok(secret.as_bytes().to_vec()),
    }
}

fn parse_flag(value: &str) -> Result<bool, AuditError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(AuditError::ConfigError(format!("Invalid boolean flag: {}", other))),
    }
}

fn parse_limit(name: &str, value: &str) -> Result<i64, AuditError> {
    value
        .trim()
        .parse()
        .map_err(|e| AuditError::ConfigError(format!("Invalid {} {:?}: {}", name, value, e)))
}
