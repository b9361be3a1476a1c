pub mod models;
pub mod queries;
pub mod schema;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::audit::entry::{format_timestamp, truncate_to_millis};

/// Source of the storage layer's notion of "current timestamp"
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Storage collaborator for the audit log.
///
/// Clones share the pool and the chain write lock, so every clone handed to a
/// logger, verifier or retention manager serializes against the same chain.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    chain_lock: Arc<Mutex<()>>,
    log_queries: bool,
    clock: Clock,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Ok(Self::from_pool(pool))
    }

    /// Single-connection in-memory database with the schema applied
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        // An in-memory SQLite database lives exactly as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let db = Self::from_pool(pool);
        db.run_migrations().await?;
        Ok(db)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            chain_lock: Arc::new(Mutex::new(())),
            log_queries: false,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_query_logging(mut self, enabled: bool) -> Self {
        self.log_queries = enabled;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(schema::AUDIT_LOG_SCHEMA)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Current time at the precision entries are stored with
    pub fn now(&self) -> DateTime<Utc> {
        truncate_to_millis((self.clock)())
    }

    /// Run one storage operation, logging its label, duration and outcome
    /// when query logging is enabled
    pub async fn traced<T, E, F>(&self, label: &str, operation: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let started = Instant::now();
        let result = operation.await;

        if self.log_queries {
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            match &result {
                Ok(_) => debug!(query = label, elapsed_ms, "executed audit query"),
                Err(e) => debug!(query = label, elapsed_ms, error = %e, "audit query failed"),
            }
        }

        result
    }

    /// Open a transaction that owns the chain.
    ///
    /// Holds the in-process chain lock for the lifetime of the returned guard and
    /// claims the sentinel head row before anything else is read, which takes the
    /// database write lock and so serializes chain writers across processes too.
    pub async fn begin_chain_write(&self) -> Result<ChainWrite, sqlx::Error> {
        let guard = self.chain_lock.clone().lock_owned().await;

        let tx = self
            .traced("claim_chain_head", async {
                let mut tx = self.pool.begin().await?;
                sqlx::query("UPDATE audit_chain_head SET claimed_at = ? WHERE id = 1")
                    .bind(format_timestamp(&self.now()))
                    .execute(&mut *tx)
                    .await?;
                Ok::<_, sqlx::Error>(tx)
            })
            .await?;

        Ok(ChainWrite { tx, _guard: guard })
    }
}

/// Exclusive chain transaction. Dropping it without `commit` rolls back.
pub struct ChainWrite {
    tx: Transaction<'static, Sqlite>,
    _guard: OwnedMutexGuard<()>,
}

impl ChainWrite {
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    pub async fn commit(self) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }

    pub async fn rollback(self) -> Result<(), sqlx::Error> {
        self.tx.rollback().await
    }
}
