//! Append-only event stores (`eventlog` and `feed`).

use std::any::Any;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;

use crate::address::Address;
use crate::error::Result;
use crate::registry::StoreType;

use super::{Entry, OpLog, Store, StoreContext, StoreEvents, StoreOptions};

/// Marker prefix of a feed tombstone payload.
const TOMBSTONE_PREFIX: &[u8] = b"\x00feed.del\x00";

/// Options for [`EventStore::iterator`].
#[derive(Debug, Clone, Copy)]
pub struct IteratorOptions {
    /// Maximum number of entries, newest kept; negative means all.
    pub limit: i64,
}

impl Default for IteratorOptions {
    fn default() -> Self {
        Self { limit: 1 }
    }
}

/// Append-only log of opaque payloads.
///
/// Registered under the tags `eventlog` and `feed`; a feed additionally
/// supports [`remove`](EventStore::remove), which appends a tombstone that
/// hides the removed entry from iteration.
#[derive(Debug, Clone)]
pub struct EventStore {
    log: Arc<OpLog>,
}

impl EventStore {
    /// Append `payload` to the log.
    pub async fn add(&self, payload: impl Into<Vec<u8>>) -> Result<Entry> {
        self.log.append(payload.into()).await
    }

    /// Remove the entry `hash` from iteration by appending a tombstone.
    ///
    /// Only feeds support removal; an event log is append-only.
    pub async fn remove(&self, hash: &str) -> Result<Entry> {
        if self.log.db_type() != "feed" {
            return Err(anyhow!(
                "'{}' is append-only, only a feed supports remove",
                self.log.db_type()
            )
            .into());
        }
        let mut payload = TOMBSTONE_PREFIX.to_vec();
        payload.extend_from_slice(hash.as_bytes());
        self.log.append(payload).await
    }

    /// The entry with the given hash, if present.
    pub fn get(&self, hash: &str) -> Option<Entry> {
        self.log
            .sorted_entries()
            .into_iter()
            .find(|e| e.hash == hash)
    }

    /// Entries in insertion order, tombstones applied.
    pub fn iterator(&self, options: IteratorOptions) -> Vec<Entry> {
        let entries = self.log.sorted_entries();
        let removed: Vec<&[u8]> = entries
            .iter()
            .filter_map(|e| e.payload.strip_prefix(TOMBSTONE_PREFIX))
            .collect();
        let mut visible: Vec<Entry> = entries
            .iter()
            .filter(|e| !e.payload.starts_with(TOMBSTONE_PREFIX))
            .filter(|e| !removed.contains(&e.hash.as_bytes()))
            .cloned()
            .collect();
        if options.limit >= 0 {
            let keep = options.limit as usize;
            if visible.len() > keep {
                visible.drain(..visible.len() - keep);
            }
        }
        visible
    }
}

#[async_trait]
impl Store for EventStore {
    fn address(&self) -> &Address {
        self.log.address()
    }

    fn db_type(&self) -> &str {
        self.log.db_type()
    }

    fn events(&self) -> &StoreEvents {
        self.log.events()
    }

    fn heads(&self) -> Vec<Entry> {
        self.log.head_entries()
    }

    fn options(&self) -> &StoreOptions {
        self.log.options()
    }

    async fn load(&self) -> Result<()> {
        self.log.load().await
    }

    async fn sync(&self, heads: Vec<Entry>) -> Result<()> {
        self.log.merge(heads).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.log.close().await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) struct EventStoreType {
    tag: &'static str,
}

impl EventStoreType {
    pub(crate) fn new(tag: &'static str) -> Self {
        Self { tag }
    }
}

#[async_trait]
impl StoreType for EventStoreType {
    async fn open(&self, ctx: StoreContext) -> Result<Arc<dyn Store>> {
        debug_assert_eq!(ctx.db_type, self.tag);
        Ok(Arc::new(EventStore {
            log: Arc::new(OpLog::new(ctx)),
        }))
    }
}
