//! Operator CLI for the stock ledger.
//!
//! ```text
//! stockshift-admin migrate
//! stockshift-admin verify-balances
//! stockshift-admin rebuild-balances
//! stockshift-admin purge-idempotency
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use stockshift_events::InMemoryEventBus;
use stockshift_infra::service::{ChangeFeed, FeedMessage, StockLedgerService};
use stockshift_infra::{LedgerConfig, PostgresCatalog, PostgresLedgerStore, ServiceSettings};
use stockshift_observability::TracingOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Migrate,
    VerifyBalances,
    RebuildBalances,
    PurgeIdempotency,
}

impl Command {
    fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw {
            "migrate" => Ok(Command::Migrate),
            "verify-balances" => Ok(Command::VerifyBalances),
            "rebuild-balances" => Ok(Command::RebuildBalances),
            "purge-idempotency" => Ok(Command::PurgeIdempotency),
            other => bail!(
                "unknown command {other:?}; expected one of: migrate, verify-balances, \
                 rebuild-balances, purge-idempotency"
            ),
        }
    }
}

type Ledger = StockLedgerService<PostgresLedgerStore, PostgresCatalog, InMemoryEventBus<FeedMessage>>;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let command = match std::env::args().nth(1) {
        Some(raw) => Command::parse(&raw)?,
        None => bail!("usage: stockshift-admin <migrate|verify-balances|rebuild-balances|purge-idempotency>"),
    };

    let config = LedgerConfig::load().context("loading configuration")?;
    stockshift_observability::init_with(&TracingOptions {
        json: config.logging.json,
        default_directive: config.logging.level.clone(),
    });

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .context("connecting to the database")?;
    let store = Arc::new(PostgresLedgerStore::with_lock_timeout(
        pool.clone(),
        config.lock_timeout(),
    ));
    let ledger: Ledger = StockLedgerService::new(
        store.clone(),
        Arc::new(PostgresCatalog::new(pool)),
        Arc::new(ChangeFeed::new(InMemoryEventBus::new())),
        ServiceSettings::from_config(&config),
    );

    match command {
        Command::Migrate => {
            store.migrate().await.context("applying migrations")?;
            info!("schema is up to date");
            Ok(ExitCode::SUCCESS)
        }
        Command::VerifyBalances => {
            let drift = ledger.verify_balances().await?;
            if drift.is_empty() {
                info!("all balances match the ledger");
                return Ok(ExitCode::SUCCESS);
            }
            for entry in &drift {
                println!(
                    "{}\trecorded={}\texpected={}",
                    entry.key, entry.recorded, entry.expected
                );
            }
            warn!(drifted = drift.len(), "balance drift detected");
            Ok(ExitCode::FAILURE)
        }
        Command::RebuildBalances => {
            let written = ledger.rebuild_balances().await?;
            println!("rebuilt {written} balance(s)");
            Ok(ExitCode::SUCCESS)
        }
        Command::PurgeIdempotency => {
            let removed = ledger.purge_idempotency(Utc::now()).await?;
            println!("purged {removed} expired idempotency record(s)");
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_by_name() {
        assert_eq!(Command::parse("verify-balances").unwrap(), Command::VerifyBalances);
        assert_eq!(Command::parse("purge-idempotency").unwrap(), Command::PurgeIdempotency);
        assert!(Command::parse("drop-everything").is_err());
    }
}
