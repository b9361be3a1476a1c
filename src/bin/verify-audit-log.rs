use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, Command};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use audit_trail::audit::{ChainErrorKind, ChainVerifier, HashEngine, VerificationReport};
use audit_trail::config::AuditConfig;
use audit_trail::database::Database;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("verify-audit-log")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Verify audit log hash chain integrity")
        .arg(
            Arg::new("database-url")
                .short('d')
                .long("database-url")
                .value_name("URL")
                .help("Database URL (defaults to DATABASE_URL)"),
        )
        .arg(
            Arg::new("window")
                .short('w')
                .long("window")
                .value_name("N")
                .value_parser(clap::value_parser!(i64))
                .default_value("500")
                .help("Entries loaded per verification batch"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose output"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Suppress output except errors"),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");
    let window = matches.get_one::<i64>("window").copied().unwrap_or(500);

    let level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .with_writer(std::io::stderr)
        .init();

    let mut config = AuditConfig::load()?;
    if let Some(url) = matches.get_one::<String>("database-url") {
        config.database_url = url.clone();
    }

    let report = match verify_database(&config, window).await {
        Ok(report) => report,
        Err(e) => {
            error!("Audit log verification failed: {}", e);
            std::process::exit(2);
        }
    };

    print_report(&report, verbose, quiet);

    if !report.valid {
        std::process::exit(1);
    }
    Ok(())
}

async fn verify_database(config: &AuditConfig, window: i64) -> Result<VerificationReport> {
    info!("Verifying audit log: {}", config.database_url);

    let db = Database::new(&config.database_url)
        .await
        .map_err(|e| anyhow!("Failed to open {}: {}", config.database_url, e))?
        .with_query_logging(config.log_queries);
    db.run_migrations().await?;

    let engine = Arc::new(HashEngine::new(Arc::new(config.keyring()?)));
    let verifier = ChainVerifier::new(db, engine);

    Ok(verifier.verify_all(window).await?)
}

fn print_report(report: &VerificationReport, verbose: bool, quiet: bool) {
    for e in &report.errors {
        let marker = match e.kind {
            ChainErrorKind::InvalidEntryHash => "HASH",
            ChainErrorKind::ChainBroken => "LINK",
        };
        eprintln!("✗ [{}] {}: {}", marker, e.entry_id, e.message);
    }

    if quiet {
        return;
    }

    if verbose {
        println!("\nAudit Log Summary:");
        println!("  Verified entries: {}", report.verified_count);
        println!("  Hash valid: {}", report.hash_valid);
        println!("  Chain valid: {}", report.chain_valid);
        println!("  Verification ID: {}", report.verification_id);
        println!("  Verified at: {}", report.verification_timestamp.to_rfc3339());
    }

    if report.valid {
        println!("✓ Audit log verification completed successfully ({} entries)", report.verified_count);
    } else {
        println!("✗ Audit log verification found {} violations", report.errors.len());
    }
}
