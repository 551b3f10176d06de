//! Shared state for one CLI invocation.

use anyhow::Context;
use command_outbox::OutboxStore;
use dispatch_config_and_utils::{Config, Paths};
use dispatch_database::AsyncDatabase;
use tracing::debug;

/// Loaded configuration plus an open database.
pub struct AppContext {
    pub config: Config,
    pub paths: Paths,
    pub db: AsyncDatabase,
}

impl AppContext {
    pub async fn open(config: Config, paths: Paths) -> anyhow::Result<Self> {
        paths.ensure_dirs()?;

        let db_path = config.database_file(&paths);
        let db = AsyncDatabase::open(&db_path)
            .await
            .with_context(|| format!("failed to open database at {}", db_path.display()))?;
        debug!(path = %db_path.display(), "Database opened");

        Ok(Self { config, paths, db })
    }

    pub fn store(&self) -> OutboxStore {
        OutboxStore::new(self.db.clone())
    }
}
