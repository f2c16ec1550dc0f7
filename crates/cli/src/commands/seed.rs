//! `tmhub seed` — install built-in groups and the SSRF deny seed.

use uuid::Uuid;

use tmhub_core::access::{ADMINISTRATORS_GROUP, WILDCARD_PROVIDER};
use tmhub_core::store::Store;
use tmhub_config::AppConfig;
use tmhub_store::SqliteStore;

pub async fn run(admin: Option<Uuid>) -> anyhow::Result<()> {
    let config = AppConfig::load().map_err(|e| anyhow::anyhow!("config: {e}"))?;
    let store = SqliteStore::new(&config.database.path)
        .await
        .map_err(|e| anyhow::anyhow!("store: {e}"))?;

    // Everyone and Administrators are installed by the migrations; the
    // deny list is seeded explicitly so operators can re-run it after
    // trimming entries.
    let installed = store
        .seed_deny_list()
        .await
        .map_err(|e| anyhow::anyhow!("deny seed: {e}"))?;
    println!("Deny list: {installed} new entries");

    if let Some(user) = admin {
        let admins = store
            .ensure_group(WILDCARD_PROVIDER, ADMINISTRATORS_GROUP)
            .await
            .map_err(|e| anyhow::anyhow!("groups: {e}"))?;
        store
            .add_membership(admins.id, user)
            .await
            .map_err(|e| anyhow::anyhow!("membership: {e}"))?;
        println!("Administrator capability granted to {user}");
    }

    Ok(())
}
