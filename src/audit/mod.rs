//! Audit Log System
//!
//! Tamper-evident, append-only record of privileged actions. Every entry is
//! chained to its predecessor by a keyed digest.

pub mod entry;
pub mod hash;
pub mod logger;
pub mod query;
pub mod retention;
pub mod verify;

pub use entry::{AuditAction, AuditLogEntry, NewAuditEntry, ResourceType};
pub use hash::{HashEngine, KeyProvider, StaticKeyring};
pub use logger::AuditLogger;
pub use query::{AuditFilter, AuditQueryResult, AuditReader, ExportFormat, SortOrder};
pub use retention::{ArchiveOutcome, PurgeOutcome, RetentionManager, RetentionRunOutcome};
pub use verify::{
    verify_chain, verify_chain_from, ChainError, ChainErrorKind, ChainVerification,
    ChainVerifier, VerificationReport,
};
