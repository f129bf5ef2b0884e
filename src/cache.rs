//! Local cache stores.
//!
//! The controller keeps one key-value cache per directory. The cache holds
//! the local database index (`<address>/_manifest` entries) and per-store
//! state such as heads and snapshots, all keyed under the address string.
//! Storage is pluggable through [`LocalStorage`]; the default backend is a
//! single redb database file per directory.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use redb::{Database, TableDefinition};
use tracing::debug;

use crate::error::Result;

pub(crate) const CACHE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("cache");

/// File name of the cache database inside its directory.
pub(crate) const CACHE_FILE_NAME: &str = "cache.db";

/// Adapter that creates key-value stores scoped to a directory.
#[async_trait]
pub trait LocalStorage: Send + Sync + 'static {
    /// Open (creating if needed) the store for `path`.
    async fn create_store(&self, path: &Path) -> Result<Arc<dyn CacheStore>>;
}

/// A key-value store backing one cache directory.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Value for `key`, or `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set `key` to `value`.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Re-open the store after a `close`.
    async fn open(&self) -> Result<()>;

    /// Close the store; reads and writes fail until re-opened.
    async fn close(&self) -> Result<()>;
}

/// Default storage adapter: one redb database file per directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedbStorage;

#[async_trait]
impl LocalStorage for RedbStorage {
    async fn create_store(&self, path: &Path) -> Result<Arc<dyn CacheStore>> {
        let store = RedbCacheStore::create(path)?;
        Ok(Arc::new(store))
    }
}

/// redb-backed cache store.
#[derive(Debug)]
pub struct RedbCacheStore {
    file: PathBuf,
    db: Mutex<Option<Database>>,
}

impl RedbCacheStore {
    /// Open (creating if needed) the cache database under `directory`.
    pub fn create(directory: &Path) -> Result<Self> {
        std::fs::create_dir_all(directory)
            .with_context(|| format!("failed to create cache directory {}", directory.display()))?;
        let file = directory.join(CACHE_FILE_NAME);
        let db = open_database(&file)?;
        debug!(file = %file.display(), "cache store opened");
        Ok(Self {
            file,
            db: Mutex::new(Some(db)),
        })
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let guard = self.db.lock();
        let db = guard
            .as_ref()
            .ok_or_else(|| anyhow!("cache store '{}' is closed", self.file.display()))?;
        f(db)
    }
}

fn open_database(file: &Path) -> Result<Database> {
    let db = Database::builder()
        .create(file)
        .with_context(|| format!("failed to open cache database {}", file.display()))?;
    // Create the table up front so reads never race table creation.
    let tx = db.begin_write().map_err(anyhow::Error::from)?;
    tx.open_table(CACHE_TABLE).map_err(anyhow::Error::from)?;
    tx.commit().map_err(anyhow::Error::from)?;
    Ok(db)
}

#[async_trait]
impl CacheStore for RedbCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_db(|db| {
            let tx = db.begin_read().map_err(anyhow::Error::from)?;
            let table = tx.open_table(CACHE_TABLE).map_err(anyhow::Error::from)?;
            let value = table
                .get(key)
                .map_err(anyhow::Error::from)?
                .map(|guard| guard.value().to_string());
            Ok(value)
        })
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.with_db(|db| {
            let tx = db.begin_write().map_err(anyhow::Error::from)?;
            {
                let mut table = tx.open_table(CACHE_TABLE).map_err(anyhow::Error::from)?;
                table.insert(key, value).map_err(anyhow::Error::from)?;
            }
            tx.commit().map_err(anyhow::Error::from)?;
            Ok(())
        })
    }

    async fn open(&self) -> Result<()> {
        let mut guard = self.db.lock();
        if guard.is_none() {
            *guard = Some(open_database(&self.file)?);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.db.lock().take();
        Ok(())
    }
}

/// In-memory storage adapter. Stores survive re-`create_store` calls on the
/// same adapter, mirroring files on disk.
#[derive(Debug, Clone, Default)]
pub struct MemStorage {
    stores: Arc<Mutex<HashMap<PathBuf, Arc<MemCacheStore>>>>,
}

#[async_trait]
impl LocalStorage for MemStorage {
    async fn create_store(&self, path: &Path) -> Result<Arc<dyn CacheStore>> {
        let store = self
            .stores
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone();
        Ok(store)
    }
}

/// In-memory cache store.
#[derive(Debug, Default)]
pub struct MemCacheStore {
    map: RwLock<BTreeMap<String, String>>,
}

#[async_trait]
impl CacheStore for MemCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.map.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
