#![allow(dead_code)]

use audit_trail::audit::{
    AuditAction, AuditLogEntry, AuditLogger, AuditReader, ChainVerifier, HashEngine, NewAuditEntry,
    ResourceType, RetentionManager, StaticKeyring,
};
use audit_trail::database::models::RetentionPolicy;
use audit_trail::database::Database;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

pub const TEST_SECRET: &str = "integration-test-secret";

/// Manually driven clock shared with the database under test
#[derive(Clone)]
pub struct TestClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap() = at;
    }

    pub fn days_ago(&self, base: DateTime<Utc>, days: i64) {
        self.set(base - Duration::days(days));
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Every service wired to one in-memory database
pub struct TestAudit {
    pub db: Database,
    pub clock: TestClock,
    pub base: DateTime<Utc>,
    pub engine: Arc<HashEngine>,
    pub logger: AuditLogger,
    pub reader: AuditReader,
    pub verifier: ChainVerifier,
    pub retention: RetentionManager,
}

impl TestAudit {
    pub async fn new() -> Self {
        Self::with_engine(test_engine()).await
    }

    pub async fn with_engine(engine: Arc<HashEngine>) -> Self {
        let base = Utc::now();
        let clock = TestClock::new(base);
        let handle = clock.clone();
        let db = setup_test_db()
            .await
            .with_clock(Arc::new(move || handle.now()));

        Self {
            logger: AuditLogger::new(db.clone(), engine.clone()),
            reader: AuditReader::new(db.clone()),
            verifier: ChainVerifier::new(db.clone(), engine.clone()),
            retention: RetentionManager::new(db.clone()),
            db,
            clock,
            base,
            engine,
        }
    }

    /// Append as if `days` days before the test's start
    pub async fn append_days_ago(&self, days: i64, resource_id: &str) -> AuditLogEntry {
        self.clock.days_ago(self.base, days);
        let entry = self
            .logger
            .append(sample_entry("user-1", resource_id))
            .await
            .expect("append failed");
        self.clock.set(self.base);
        entry
    }

    pub async fn tamper(&self, sql: &str, id: &str) {
        sqlx::query("DROP TRIGGER IF EXISTS audit_logs_immutable")
            .execute(self.db.pool())
            .await
            .expect("Failed to drop trigger");
        sqlx::query(sql)
            .bind(id)
            .execute(self.db.pool())
            .await
            .expect("Failed to tamper with entry");
    }
}

/// Setup an in-memory SQLite database for testing
pub async fn setup_test_db() -> Database {
    Database::new_in_memory().await.expect("Failed to create test database")
}

pub fn test_engine() -> Arc<HashEngine> {
    keyed_engine(StaticKeyring::new(1).with_key(1, TEST_SECRET))
}

pub fn keyed_engine(keys: StaticKeyring) -> Arc<HashEngine> {
    Arc::new(HashEngine::new(Arc::new(keys)))
}

pub fn sample_entry(actor: &str, resource_id: &str) -> NewAuditEntry {
    NewAuditEntry::new(actor, AuditAction::Execute, ResourceType::Workflow, resource_id)
        .with_context("source", "integration-test")
}

pub fn archive_policy(id: &str, retention_days: i64) -> RetentionPolicy {
    RetentionPolicy {
        id: id.to_string(),
        name: format!("{} retention", id),
        description: String::new(),
        retention_days,
        auto_archive_enabled: true,
        auto_delete_enabled: false,
        archive_retention_days: None,
        gdpr_purge_enabled: false,
    }
}

pub fn gdpr_policy(id: &str, retention_days: i64, archive_retention_days: i64) -> RetentionPolicy {
    RetentionPolicy {
        auto_delete_enabled: true,
        gdpr_purge_enabled: true,
        archive_retention_days: Some(archive_retention_days),
        ..archive_policy(id, retention_days)
    }
}
