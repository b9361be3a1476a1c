//! Audit Trail CLI
//!
//! Command-line front end for appending to, querying, verifying and
//! maintaining the tamper-evident audit log.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use audit_trail::audit::{
    AuditAction, AuditFilter, AuditLogger, AuditReader, ChainVerifier, ExportFormat, HashEngine,
    NewAuditEntry, ResourceType, RetentionManager, SortOrder,
};
use audit_trail::config::loader::RetentionPolicyFile;
use audit_trail::config::AuditConfig;
use audit_trail::database::queries::Queries;
use audit_trail::database::Database;

#[derive(Parser)]
#[command(name = "audit-trail")]
#[command(about = "Tamper-evident audit log for privileged actions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file (defaults to environment variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database URL, overriding the configuration
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the audit tables if they do not exist
    Migrate,

    /// Record a privileged action
    Append {
        #[arg(long)]
        actor: String,

        /// execute, assign, override, pause, resume, delete, create, update, export, access
        #[arg(long)]
        action: AuditAction,

        #[arg(long)]
        resource_type: ResourceType,

        #[arg(long)]
        resource_id: String,

        /// Context as a JSON object
        #[arg(long)]
        context: Option<String>,

        /// When the action happened (RFC 3339), if not now
        #[arg(long)]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Query active entries
    Query {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Export active entries as JSON or CSV
    Export {
        #[command(flatten)]
        filter: FilterArgs,

        #[arg(long, default_value = "json")]
        format: String,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Verify a window of the chain
    Verify {
        /// Entry to start from (defaults to the oldest active entry)
        #[arg(long)]
        start_id: Option<String>,

        #[arg(long)]
        limit: Option<i64>,
    },

    /// Show recent verification runs
    History {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },

    /// Archive entries older than the policy's retention period
    Archive {
        #[arg(long)]
        policy_id: Option<String>,
    },

    /// Permanently delete archived entries (GDPR)
    Purge {
        /// Age in days since archival
        #[arg(long, conflicts_with = "policy_id")]
        older_than_days: Option<i64>,

        /// Take the age from a GDPR-enabled policy
        #[arg(long)]
        policy_id: Option<String>,
    },

    /// Archive, then purge when the policy allows it
    RetentionRun {
        #[arg(long)]
        policy_id: Option<String>,
    },

    /// Manage retention policies
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },
}

#[derive(Subcommand)]
enum PolicyCommands {
    /// Load policies from a YAML file
    Load { file: PathBuf },

    /// List stored policies
    List,
}

#[derive(Args)]
struct FilterArgs {
    #[arg(long)]
    actor: Option<String>,

    #[arg(long)]
    action: Option<AuditAction>,

    #[arg(long)]
    resource_type: Option<ResourceType>,

    #[arg(long)]
    resource_id: Option<String>,

    #[arg(long)]
    start_date: Option<DateTime<Utc>>,

    #[arg(long)]
    end_date: Option<DateTime<Utc>>,

    #[arg(long)]
    limit: Option<i64>,

    #[arg(long)]
    offset: Option<i64>,

    /// asc or desc
    #[arg(long, default_value = "desc")]
    sort: SortOrder,
}

impl From<FilterArgs> for AuditFilter {
    fn from(args: FilterArgs) -> Self {
        AuditFilter {
            actor: args.actor,
            action: args.action,
            resource_type: args.resource_type,
            resource_id: args.resource_id,
            start_date: args.start_date,
            end_date: args.end_date,
            limit: args.limit,
            offset: args.offset,
            sort: args.sort,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let mut config = match &cli.config {
        Some(path) => AuditConfig::from_file(path)?,
        None => AuditConfig::load()?,
    };
    if let Some(url) = &cli.database_url {
        config.database_url = url.clone();
    }

    let db = Database::new(&config.database_url)
        .await
        .with_context(|| format!("Failed to open {}", config.database_url))?
        .with_query_logging(config.log_queries);
    db.run_migrations().await.context("Failed to apply audit schema")?;

    match cli.command {
        Commands::Migrate => {
            info!("Audit schema ready at {}", config.database_url);
        }

        Commands::Append {
            actor,
            action,
            resource_type,
            resource_id,
            context,
            timestamp,
        } => {
            let logger = AuditLogger::new(db, hash_engine(&config)?);
            let mut entry = NewAuditEntry::new(actor, action, resource_type, resource_id)
                .context(parse_context(context.as_deref())?);
            if let Some(ts) = timestamp {
                entry = entry.timestamp(ts);
            }

            let entry = logger.append(entry).await?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }

        Commands::Query { filter } => {
            let reader = AuditReader::new(db).with_limits(config.max_query_limit, config.max_export_limit);
            let result = reader.query(&filter.into()).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Commands::Export {
            filter,
            format,
            output,
        } => {
            let format: ExportFormat = format.parse()?;
            let reader = AuditReader::new(db).with_limits(config.max_query_limit, config.max_export_limit);
            let rendered = reader.export(&filter.into(), format).await?;

            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("Failed to write {:?}", path))?;
                    info!("Wrote {} export to {:?}", format, path);
                }
                None => println!("{}", rendered),
            }
        }

        Commands::Verify { start_id, limit } => {
            let verifier = ChainVerifier::new(db, hash_engine(&config)?);
            let report = verifier
                .verify(start_id.as_deref(), limit.unwrap_or(config.default_verify_limit))
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            if !report.valid {
                std::process::exit(1);
            }
        }

        Commands::History { limit } => {
            for record in Queries::list_verification_records(db.pool(), limit.max(1)).await? {
                println!(
                    "{}  {}  hash_valid={} chain_valid={}  {}",
                    record.verification_timestamp.to_rfc3339(),
                    record.id,
                    record.hash_valid,
                    record.chain_valid,
                    record.verification_details
                );
            }
        }

        Commands::Archive { policy_id } => {
            let outcome = RetentionManager::new(db)
                .archive_expired(policy_id.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }

        Commands::Purge {
            older_than_days,
            policy_id,
        } => {
            let manager = RetentionManager::new(db);
            let outcome = match older_than_days {
                Some(days) => manager.purge_archived(days).await?,
                None => manager.purge_expired(policy_id.as_deref()).await?,
            };
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }

        Commands::RetentionRun { policy_id } => {
            let outcome = RetentionManager::new(db).run(policy_id.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }

        Commands::Policy { command } => {
            let manager = RetentionManager::new(db);
            match command {
                PolicyCommands::Load { file } => {
                    let policies = RetentionPolicyFile::load(&file)?;
                    for policy in &policies.policies {
                        manager.store_policy(policy).await?;
                    }
                    println!("Loaded {} retention policies", policies.policies.len());
                }
                PolicyCommands::List => {
                    for policy in manager.policies().await? {
                        println!(
                            "{}  {}  retention={}d archive={} delete={} gdpr={} archive_retention={}",
                            policy.id,
                            policy.name,
                            policy.retention_days,
                            policy.auto_archive_enabled,
                            policy.auto_delete_enabled,
                            policy.gdpr_purge_enabled,
                            policy
                                .archive_retention_days
                                .map(|d| format!("{}d", d))
                                .unwrap_or_else(|| "-".to_string())
                        );
                    }
                }
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default = if quiet {
        "error"
    } else if verbose {
        "audit_trail=debug"
    } else {
        "audit_trail=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

fn hash_engine(config: &AuditConfig) -> Result<Arc<HashEngine>> {
    let keyring = config.keyring()?;
    Ok(Arc::new(HashEngine::new(Arc::new(keyring))))
}

fn parse_context(raw: Option<&str>) -> Result<Map<String, Value>> {
    match raw {
        None => Ok(Map::new()),
        Some(raw) => match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => Ok(map),
            other => Err(anyhow!("Context must be a JSON object, got {}", other)),
        },
    }
}
