//! On-disk schema migrations.
//!
//! Migrations run before a store is opened and upgrade legacy cache
//! layouts to the current one. Each migration is idempotent: when the
//! on-disk state already matches the current layout it reports `Skip`.
//! A failing migration fails the whole `create`/`open` call.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use redb::{Database, ReadableTable, TableError};
use tracing::{debug, info};

use crate::address::Address;
use crate::cache::{CacheStore, CACHE_FILE_NAME, CACHE_TABLE};
use crate::error::Result;

enum MigrateOutcome {
    Skip,
    Execute(usize),
}

/// Run all migrations for `address` under `directory`.
///
/// `cache` is the already-open shared cache for `directory`; migrations
/// write upgraded data through it.
pub(crate) async fn run(
    cache: &Arc<dyn CacheStore>,
    directory: &Path,
    address: &Address,
) -> Result<()> {
    run_migration(
        "001_fold_per_database_cache",
        migration_001_fold_per_database_cache(cache, directory, address),
    )
    .await?;
    Ok(())
}

async fn run_migration(
    name: &str,
    fut: impl std::future::Future<Output = Result<MigrateOutcome>>,
) -> Result<()> {
    debug!("start migration {name}");
    match fut.await? {
        MigrateOutcome::Execute(len) => {
            info!("executed migration {name} ({len} keys moved)");
        }
        MigrateOutcome::Skip => debug!("skip migration {name}: not needed"),
    }
    Ok(())
}

/// Migration 001: fold the legacy per-database cache into the shared
/// per-directory cache.
///
/// Early layouts kept one cache store per database under
/// `<directory>/<root>/<path>`. The current layout uses a single store per
/// directory with keys prefixed by the address string. Every key of the
/// legacy store is copied to `<address>/<key>`, then the legacy file is
/// renamed out of the way so reruns skip.
async fn migration_001_fold_per_database_cache(
    cache: &Arc<dyn CacheStore>,
    directory: &Path,
    address: &Address,
) -> Result<MigrateOutcome> {
    let legacy_file = address.to_fs_path(directory).join(CACHE_FILE_NAME);
    if !legacy_file.exists() {
        return Ok(MigrateOutcome::Skip);
    }

    let rows = {
        let db = Database::open(&legacy_file)
            .with_context(|| format!("failed to open legacy cache {}", legacy_file.display()))?;
        let tx = db.begin_read().map_err(anyhow::Error::from)?;
        match tx.open_table(CACHE_TABLE) {
            Ok(table) => {
                let mut rows = Vec::new();
                for row in table.iter().map_err(anyhow::Error::from)? {
                    let (key, value) = row.map_err(anyhow::Error::from)?;
                    rows.push((key.value().to_string(), value.value().to_string()));
                }
                rows
            }
            // An empty legacy store has nothing to move.
            Err(TableError::TableDoesNotExist(_)) => Vec::new(),
            Err(err) => return Err(anyhow::Error::from(err).into()),
        }
    };

    let len = rows.len();
    for (key, value) in rows {
        cache.set(&format!("{address}/{key}"), &value).await?;
    }

    let migrated = legacy_file.with_extension("db.migrated");
    tokio::fs::rename(&legacy_file, &migrated)
        .await
        .with_context(|| format!("failed to retire legacy cache {}", legacy_file.display()))?;

    Ok(MigrateOutcome::Execute(len))
}
