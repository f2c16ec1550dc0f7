//! `tmhub migrate` — run database migrations and exit.
//!
//! Opening the store installs the schema, deduplicates group memberships
//! before the uniqueness index, and collapses a legacy administrators
//! table into group memberships.

use tmhub_config::AppConfig;
use tmhub_store::SqliteStore;

pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::load().map_err(|e| anyhow::anyhow!("config: {e}"))?;
    SqliteStore::new(&config.database.path)
        .await
        .map_err(|e| anyhow::anyhow!("migration: {e}"))?;
    println!("Migrations applied to {}", config.database.path);
    Ok(())
}
