//! Store instances and the shared operation log.
//!
//! Every database is backed by a log of content-addressed, signed,
//! lamport-clocked entries. Entries link to the previous heads through
//! `next`, so concurrent replicas merge into a DAG whose tips are the head
//! set exchanged between peers. The per-type stores (event log, key-value,
//! counter, documents) are thin indexes replayed over the same log.

use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use cid::Cid;
use ed25519_dalek::Signature;
use futures::future::BoxFuture;
use libipld::{Ipld, IpldCodec};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::access::AccessController;
use crate::address::Address;
use crate::cache::CacheStore;
use crate::content::{ContentStore, PeerId, WriteOptions};
use crate::error::Result;
use crate::identity::{Identity, Keystore};

mod counter;
mod docstore;
mod eventlog;
mod keyvalue;

pub use self::counter::CounterStore;
pub use self::docstore::DocStore;
pub use self::eventlog::{EventStore, IteratorOptions};
pub use self::keyvalue::KvStore;

pub(crate) const OPLOG_CACHE_SUFFIX: &str = "_oplog";
pub(crate) const LOCAL_HEADS_CACHE_SUFFIX: &str = "_localHeads";

/// How long a merge waits for one missing ancestor before giving up.
const ANCESTOR_FETCH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Logical timestamp carried by every entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LamportClock {
    /// Identity id of the writer.
    pub id: String,
    /// Monotonic per-log time.
    pub time: u64,
}

impl PartialOrd for LamportClock {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LamportClock {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time.cmp(&other.time).then_with(|| self.id.cmp(&other.id))
    }
}

/// One signed, content-addressed log entry.
///
/// `hash` is the CID of the entry's dag-cbor encoding in the object store;
/// it is derived, never part of the encoding itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Content hash of this entry.
    pub hash: String,
    /// Address string of the database the entry belongs to.
    pub id: String,
    /// Opaque operation payload.
    pub payload: Vec<u8>,
    /// Hashes of the heads this entry supersedes.
    pub next: Vec<String>,
    /// Logical timestamp.
    pub clock: LamportClock,
    /// Identity id (hex verifying key) of the writer.
    pub identity: String,
    /// Hex signature over the entry body.
    pub sig: String,
}

impl Entry {
    fn signing_bytes(
        id: &str,
        payload: &[u8],
        next: &[String],
        clock: &LamportClock,
    ) -> Vec<u8> {
        postcard::to_stdvec(&(id, payload, next, &clock.id, clock.time))
            .expect("entry body serializes")
    }

    /// Verify the entry signature against its identity id.
    pub fn verify(&self) -> Result<()> {
        let body = Self::signing_bytes(&self.id, &self.payload, &self.next, &self.clock);
        let sig_bytes = hex::decode(&self.sig).context("entry signature is not hex")?;
        let sig = Signature::from_slice(&sig_bytes).context("malformed entry signature")?;
        Identity::verify(&self.identity, &body, &sig)
    }

    pub(crate) fn to_ipld(&self) -> Ipld {
        let mut clock = BTreeMap::new();
        clock.insert("id".to_string(), Ipld::String(self.clock.id.clone()));
        clock.insert("time".to_string(), Ipld::Integer(self.clock.time as i128));
        let mut map = BTreeMap::new();
        map.insert("id".to_string(), Ipld::String(self.id.clone()));
        map.insert("payload".to_string(), Ipld::Bytes(self.payload.clone()));
        map.insert(
            "next".to_string(),
            Ipld::List(self.next.iter().cloned().map(Ipld::String).collect()),
        );
        map.insert("clock".to_string(), Ipld::Map(clock));
        map.insert("identity".to_string(), Ipld::String(self.identity.clone()));
        map.insert("sig".to_string(), Ipld::String(self.sig.clone()));
        Ipld::Map(map)
    }

    pub(crate) fn from_ipld(hash: &str, value: &Ipld) -> Result<Self> {
        let Ipld::Map(map) = value else {
            return Err(anyhow!("entry is not a map").into());
        };
        let string = |key: &str| -> Result<String> {
            match map.get(key) {
                Some(Ipld::String(s)) => Ok(s.clone()),
                _ => Err(anyhow!("entry field '{key}' missing or not a string").into()),
            }
        };
        let payload = match map.get("payload") {
            Some(Ipld::Bytes(bytes)) => bytes.clone(),
            _ => return Err(anyhow!("entry field 'payload' missing or not bytes").into()),
        };
        let next = match map.get("next") {
            Some(Ipld::List(items)) => items
                .iter()
                .map(|item| match item {
                    Ipld::String(s) => Ok(s.clone()),
                    other => Err(anyhow!("entry link is not a string: {other:?}")),
                })
                .collect::<std::result::Result<Vec<_>, _>>()?,
            _ => return Err(anyhow!("entry field 'next' missing or not a list").into()),
        };
        let clock = match map.get("clock") {
            Some(Ipld::Map(clock)) => {
                let id = match clock.get("id") {
                    Some(Ipld::String(s)) => s.clone(),
                    _ => return Err(anyhow!("entry clock has no id").into()),
                };
                let time = match clock.get("time") {
                    Some(Ipld::Integer(t)) => u64::try_from(*t)
                        .map_err(|_| anyhow!("entry clock time out of range"))?,
                    _ => return Err(anyhow!("entry clock has no time").into()),
                };
                LamportClock { id, time }
            }
            _ => return Err(anyhow!("entry field 'clock' missing or not a map").into()),
        };
        Ok(Self {
            hash: hash.to_string(),
            id: string("id")?,
            payload,
            next,
            clock,
            identity: string("identity")?,
            sig: string("sig")?,
        })
    }

    #[cfg(test)]
    pub(crate) fn sample(payload: &str) -> Self {
        Self {
            hash: "bafysample".to_string(),
            id: "/orbitdb/bafyroot/sample".to_string(),
            payload: payload.as_bytes().to_vec(),
            next: Vec::new(),
            clock: LamportClock {
                id: "writer".to_string(),
                time: 1,
            },
            identity: "writer".to_string(),
            sig: String::new(),
        }
    }
}

/// Events emitted by a store.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A local append happened; `heads` is the head set after the write.
    Write {
        /// Address of the store.
        address: Address,
        /// The appended entry.
        entry: Entry,
        /// Head set after the write.
        heads: Vec<Entry>,
    },
    /// Remote entries were merged into the log.
    Replicated {
        /// Address of the store.
        address: Address,
        /// Number of new entries.
        count: usize,
    },
    /// A head exchange with a peer completed.
    Peer {
        /// Address of the store.
        address: Address,
        /// The peer we exchanged heads with.
        peer: PeerId,
    },
    /// The store finished loading local state.
    Ready {
        /// Address of the store.
        address: Address,
    },
    /// The store was closed.
    Closed {
        /// Address of the store.
        address: Address,
    },
}

/// Broadcast handle for store events.
#[derive(Debug, Clone)]
pub struct StoreEvents {
    tx: broadcast::Sender<StoreEvent>,
}

impl StoreEvents {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Subscribe to this store's events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: StoreEvent) {
        self.tx.send(event).ok();
    }
}

/// Callback fired on each local append, with the entry and the head set.
pub type OnWriteCallback = Arc<dyn Fn(&Address, &Entry, &[Entry]) + Send + Sync>;

/// Callback fired when the store closes.
pub type OnCloseCallback = Arc<dyn Fn(Address) -> BoxFuture<'static, ()> + Send + Sync>;

/// Options a store is constructed with.
#[derive(Clone)]
pub struct StoreOptions {
    /// Whether the store participates in pubsub replication.
    pub replicate: bool,
    /// Open only what exists locally.
    pub local_only: bool,
    /// Resolved access controller, if any.
    pub access_controller: Option<Arc<dyn AccessController>>,
    /// Keystore of the owning controller.
    pub keystore: Option<Keystore>,
    /// Cache for this store's directory.
    pub cache: Option<Arc<dyn CacheStore>>,
    /// Fired on each local append.
    pub on_write: Option<OnWriteCallback>,
    /// Fired when the store closes.
    pub on_close: Option<OnCloseCallback>,
    /// Store-type-specific knobs (merged manifest defaults land here).
    pub extra: BTreeMap<String, Ipld>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            replicate: true,
            local_only: false,
            access_controller: None,
            keystore: None,
            cache: None,
            on_write: None,
            on_close: None,
            extra: BTreeMap::new(),
        }
    }
}

impl fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOptions")
            .field("replicate", &self.replicate)
            .field("local_only", &self.local_only)
            .field("access_controller", &self.access_controller.is_some())
            .field("extra", &self.extra)
            .finish_non_exhaustive()
    }
}

/// Everything a store constructor receives.
#[derive(Debug, Clone)]
pub struct StoreContext {
    /// Object store client.
    pub object_store: Arc<dyn ContentStore>,
    /// Identity entries are signed with.
    pub identity: Identity,
    /// Address of the database.
    pub address: Address,
    /// Type tag the store was opened as.
    pub db_type: String,
    /// Construction options.
    pub options: StoreOptions,
}

/// Capability set every store instance exposes.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Address of the database.
    fn address(&self) -> &Address;

    /// Type tag the store was opened as.
    fn db_type(&self) -> &str;

    /// Event stream handle.
    fn events(&self) -> &StoreEvents;

    /// Current head entries of the log.
    fn heads(&self) -> Vec<Entry>;

    /// Options the store was constructed with.
    fn options(&self) -> &StoreOptions;

    /// Load local state from the cache.
    async fn load(&self) -> Result<()>;

    /// Merge remote head entries into the log.
    async fn sync(&self, heads: Vec<Entry>) -> Result<()>;

    /// Close the store; fires the injected close callback once.
    async fn close(&self) -> Result<()>;

    /// Downcast support for the typed wrappers.
    fn as_any(&self) -> &dyn Any;
}

impl fmt::Debug for dyn Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Store")
    }
}

#[derive(Default)]
struct LogState {
    entries: BTreeMap<String, Entry>,
    heads: Vec<String>,
    time: u64,
}

/// The shared log machinery under every store type.
pub(crate) struct OpLog {
    address: Address,
    db_type: String,
    identity: Identity,
    object_store: Arc<dyn ContentStore>,
    options: StoreOptions,
    events: StoreEvents,
    state: RwLock<LogState>,
    closed: AtomicBool,
}

impl OpLog {
    pub(crate) fn new(ctx: StoreContext) -> Self {
        Self {
            address: ctx.address,
            db_type: ctx.db_type,
            identity: ctx.identity,
            object_store: ctx.object_store,
            options: ctx.options,
            events: StoreEvents::new(),
            state: RwLock::new(LogState::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    pub(crate) fn db_type(&self) -> &str {
        &self.db_type
    }

    pub(crate) fn events(&self) -> &StoreEvents {
        &self.events
    }

    pub(crate) fn options(&self) -> &StoreOptions {
        &self.options
    }

    fn cache_key(&self, suffix: &str) -> String {
        format!("{}/{}", self.address, suffix)
    }

    pub(crate) fn head_entries(&self) -> Vec<Entry> {
        let state = self.state.read();
        state
            .heads
            .iter()
            .filter_map(|hash| state.entries.get(hash).cloned())
            .collect()
    }

    /// All entries in deterministic log order.
    pub(crate) fn sorted_entries(&self) -> Vec<Entry> {
        let state = self.state.read();
        let mut entries: Vec<Entry> = state.entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.clock
                .cmp(&b.clock)
                .then_with(|| a.hash.cmp(&b.hash))
        });
        entries
    }

    pub(crate) fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Append a local operation.
    pub(crate) async fn append(&self, payload: Vec<u8>) -> Result<Entry> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow!("store '{}' is closed", self.address).into());
        }
        if let Some(ac) = &self.options.access_controller {
            if !ac.can_append(self.identity.id()) {
                return Err(anyhow!(
                    "identity '{}' may not write to '{}'",
                    self.identity.id(),
                    self.address
                )
                .into());
            }
        }

        let (next, time) = {
            let state = self.state.read();
            (state.heads.clone(), state.time + 1)
        };
        let clock = LamportClock {
            id: self.identity.id().to_string(),
            time,
        };
        let id = self.address.to_string();
        let body = Entry::signing_bytes(&id, &payload, &next, &clock);
        let sig = hex::encode(self.identity.sign(&body).to_bytes());
        let mut entry = Entry {
            hash: String::new(),
            id,
            payload,
            next,
            clock,
            identity: self.identity.id().to_string(),
            sig,
        };
        let cid = self
            .object_store
            .write(IpldCodec::DagCbor, &entry.to_ipld(), WriteOptions::default())
            .await?;
        entry.hash = cid.to_string();

        {
            let mut state = self.state.write();
            state.entries.insert(entry.hash.clone(), entry.clone());
            state.heads = vec![entry.hash.clone()];
            state.time = time;
        }
        self.persist().await?;

        let heads = self.head_entries();
        self.events.emit(StoreEvent::Write {
            address: self.address.clone(),
            entry: entry.clone(),
            heads: heads.clone(),
        });
        if let Some(on_write) = &self.options.on_write {
            on_write(&self.address, &entry, &heads);
        }
        Ok(entry)
    }

    /// Merge remote entries; returns how many were new.
    ///
    /// Entries that fail verification, access control, or content-hash
    /// validation are skipped with a warning; a bad replica must not be
    /// able to wedge the log. Ancestors a head links to that are missing
    /// locally are fetched from the object store.
    pub(crate) async fn merge(&self, remote: Vec<Entry>) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let mut added = 0;
        let mut missing: Vec<String> = Vec::new();
        for entry in remote {
            if self.admit(entry, &mut missing).await? {
                added += 1;
            }
        }
        // Backfill missing ancestors. The object store waits for content
        // that has not arrived yet, so cap each fetch.
        while let Some(hash) = missing.pop() {
            if self.state.read().entries.contains_key(&hash) {
                continue;
            }
            let Ok(cid) = Cid::try_from(hash.as_str()) else {
                warn!(address = %self.address, hash, "skipping ancestor with malformed hash");
                continue;
            };
            let value =
                match tokio::time::timeout(ANCESTOR_FETCH_TIMEOUT, self.object_store.read(&cid))
                    .await
                {
                    Ok(Ok(value)) => value,
                    Ok(Err(err)) => {
                        warn!(address = %self.address, %hash, %err, "failed to fetch ancestor");
                        continue;
                    }
                    Err(_) => {
                        warn!(address = %self.address, %hash, "timed out fetching ancestor");
                        continue;
                    }
                };
            match Entry::from_ipld(&hash, &value) {
                Ok(entry) => {
                    if self.admit(entry, &mut missing).await? {
                        added += 1;
                    }
                }
                Err(err) => {
                    warn!(address = %self.address, %hash, %err, "skipping undecodable ancestor");
                }
            }
        }
        if added > 0 {
            self.recompute_heads();
            self.persist().await?;
            self.events.emit(StoreEvent::Replicated {
                address: self.address.clone(),
                count: added,
            });
        }
        Ok(added)
    }

    /// Validate one remote entry and insert it, queueing unknown parents.
    async fn admit(&self, entry: Entry, missing: &mut Vec<String>) -> Result<bool> {
        if entry.id != self.address.to_string() {
            warn!(address = %self.address, entry = %entry.hash, "skipping entry for foreign log");
            return Ok(false);
        }
        if self.state.read().entries.contains_key(&entry.hash) {
            return Ok(false);
        }
        if let Err(err) = entry.verify() {
            warn!(address = %self.address, entry = %entry.hash, %err, "skipping entry with bad signature");
            return Ok(false);
        }
        if let Some(ac) = &self.options.access_controller {
            if !ac.can_append(&entry.identity) {
                warn!(address = %self.address, identity = %entry.identity, "skipping entry from unauthorized writer");
                return Ok(false);
            }
        }
        // Persist locally and cross-check the announced hash.
        let cid = self
            .object_store
            .write(IpldCodec::DagCbor, &entry.to_ipld(), WriteOptions::default())
            .await?;
        if cid.to_string() != entry.hash {
            warn!(address = %self.address, announced = %entry.hash, actual = %cid, "skipping entry with wrong hash");
            return Ok(false);
        }
        let mut state = self.state.write();
        state.time = state.time.max(entry.clock.time);
        for parent in &entry.next {
            if !state.entries.contains_key(parent) {
                missing.push(parent.clone());
            }
        }
        state.entries.insert(entry.hash.clone(), entry);
        Ok(true)
    }

    fn recompute_heads(&self) {
        let mut state = self.state.write();
        let referenced: HashSet<String> = state
            .entries
            .values()
            .flat_map(|e| e.next.iter().cloned())
            .collect();
        let mut heads: Vec<(LamportClock, String)> = state
            .entries
            .values()
            .filter(|e| !referenced.contains(&e.hash))
            .map(|e| (e.clock.clone(), e.hash.clone()))
            .collect();
        heads.sort();
        state.heads = heads.into_iter().map(|(_, hash)| hash).collect();
    }

    async fn persist(&self) -> Result<()> {
        let Some(cache) = &self.options.cache else {
            return Ok(());
        };
        let (log_json, heads_json) = {
            let entries = self.sorted_entries();
            let heads = self.head_entries();
            (
                serde_json::to_string(&entries).context("failed to encode log")?,
                serde_json::to_string(&heads).context("failed to encode heads")?,
            )
        };
        cache
            .set(&self.cache_key(OPLOG_CACHE_SUFFIX), &log_json)
            .await?;
        cache
            .set(&self.cache_key(LOCAL_HEADS_CACHE_SUFFIX), &heads_json)
            .await?;
        Ok(())
    }

    /// Load entries persisted by an earlier session.
    pub(crate) async fn load(&self) -> Result<()> {
        let Some(cache) = &self.options.cache else {
            return Ok(());
        };
        if let Some(log_json) = cache.get(&self.cache_key(OPLOG_CACHE_SUFFIX)).await? {
            let entries: Vec<Entry> =
                serde_json::from_str(&log_json).context("corrupt log snapshot in cache")?;
            let mut state = self.state.write();
            for entry in entries {
                state.time = state.time.max(entry.clock.time);
                state.entries.insert(entry.hash.clone(), entry);
            }
            drop(state);
            self.recompute_heads();
        }
        debug!(address = %self.address, entries = self.len(), "store loaded");
        self.events.emit(StoreEvent::Ready {
            address: self.address.clone(),
        });
        Ok(())
    }

    /// Close the log; idempotent.
    pub(crate) async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.events.emit(StoreEvent::Closed {
            address: self.address.clone(),
        });
        if let Some(on_close) = &self.options.on_close {
            on_close(self.address.clone()).await;
        }
        Ok(())
    }

    /// Read a store-type knob from the merged option bag.
    pub(crate) fn extra_str(&self, key: &str) -> Option<&str> {
        match self.options.extra.get(key) {
            Some(Ipld::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl fmt::Debug for OpLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpLog")
            .field("address", &self.address)
            .field("db_type", &self.db_type)
            .field("entries", &self.len())
            .finish()
    }
}

/// Register the built-in store types in `registry`.
pub(crate) fn register_builtin_types(registry: &crate::registry::TypeRegistry) -> Result<()> {
    registry.register("eventlog", Arc::new(eventlog::EventStoreType::new("eventlog")))?;
    registry.register("feed", Arc::new(eventlog::EventStoreType::new("feed")))?;
    registry.register("keyvalue", Arc::new(keyvalue::KvStoreType))?;
    registry.register("docstore", Arc::new(docstore::DocStoreType))?;
    registry.register("counter", Arc::new(counter::CounterStoreType))?;
    Ok(())
}

/// Parse a JSON operation payload.
pub(crate) fn decode_op(payload: &[u8]) -> Option<serde_json::Value> {
    serde_json::from_slice(payload).ok()
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::path::Path;

    use libipld::IpldCodec;

    use super::*;
    use crate::cache::{LocalStorage, MemStorage};
    use crate::content::MemContentStore;
    use crate::identity::{DefaultIdentityProvider, IdentityProvider, Keystore};

    pub(crate) struct TestEnv {
        pub objects: MemContentStore,
        pub storage: MemStorage,
        pub identity: Identity,
        pub address: Address,
    }

    pub(crate) async fn identity(label: &str) -> Identity {
        let dir = tempfile::tempdir().unwrap();
        let keystore = Keystore::open(dir.path()).await.unwrap();
        DefaultIdentityProvider
            .create_identity(label, &keystore)
            .await
            .unwrap()
    }

    pub(crate) async fn env(name: &str) -> TestEnv {
        let objects = MemContentStore::new("test-peer");
        let root = objects
            .write(
                IpldCodec::DagCbor,
                &Ipld::String(name.to_string()),
                WriteOptions::default(),
            )
            .await
            .unwrap();
        TestEnv {
            address: Address::new(root, name),
            identity: identity("test-peer").await,
            objects,
            storage: MemStorage::default(),
        }
    }

    pub(crate) async fn context(env: &TestEnv, db_type: &str) -> StoreContext {
        let cache = env
            .storage
            .create_store(Path::new("/test-cache"))
            .await
            .unwrap();
        StoreContext {
            object_store: Arc::new(env.objects.clone()),
            identity: env.identity.clone(),
            address: env.address.clone(),
            db_type: db_type.to_string(),
            options: StoreOptions {
                cache: Some(cache),
                ..Default::default()
            },
        }
    }
}
