//! The controller.
//!
//! [`OrbitDb`] coordinates the lifecycle of named, typed, replicated
//! databases: it resolves names to addresses backed by manifests in the
//! object store, instantiates the right store type, binds live stores to
//! the pubsub overlay, and keeps the local cache index consistent.
//!
//! A controller guarantees at most one live registration per address; the
//! cache index entry for an address exists before the store is ever
//! returned to a caller; and pubsub subscription happens strictly after
//! registration, so message dispatch always finds the store.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use libipld::Ipld;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use crate::access::{AccessControllerFactory, AccessControllerSpec, DefaultAccessControllerFactory};
use crate::address::{Address, ADDRESS_PREFIX};
use crate::cache::{CacheStore, LocalStorage, RedbStorage};
use crate::content::{ContentStore, PeerId};
use crate::error::{Error, Result};
use crate::exchange;
use crate::identity::{DefaultIdentityProvider, Identity, IdentityProvider, Keystore};
use crate::manifest::{create_db_manifest, read_db_manifest, ManifestOptions};
use crate::migrations;
use crate::pubsub::{ChannelMessageCallback, DirectChannel, MessageCallback, PeerCallback, PubSub};
use crate::registry::{default_registry, TypeRegistry};
use crate::store::{
    CounterStore, DocStore, Entry, EventStore, KvStore, OnCloseCallback, OnWriteCallback, Store,
    StoreContext, StoreEvent, StoreOptions,
};

pub(crate) const MANIFEST_CACHE_SUFFIX: &str = "_manifest";

pub(crate) fn manifest_cache_key(address: &Address) -> String {
    format!("{address}/{MANIFEST_CACHE_SUFFIX}")
}

/// Options for [`OrbitDb::create_instance`].
#[derive(Default)]
pub struct OrbitDbOptions {
    /// Directory all local state lives under; `./orbitdb` when absent.
    pub directory: Option<PathBuf>,
    /// Identity override; a default identity is created when absent.
    pub identity: Option<Identity>,
    /// Keystore override; opened under the directory when absent.
    pub keystore: Option<Keystore>,
    /// Local storage adapter; redb-backed when absent.
    pub storage: Option<Arc<dyn LocalStorage>>,
    /// Default cache override.
    pub cache: Option<Arc<dyn CacheStore>>,
    /// Type registry; the process-wide default when absent.
    pub registry: Option<TypeRegistry>,
    /// Access-controller factory; the built-in `ipfs` factory when absent.
    pub access_controllers: Option<Arc<dyn AccessControllerFactory>>,
    /// Pubsub overlay client; replication is disabled when absent.
    pub pubsub: Option<Arc<dyn PubSub>>,
    /// Identity provider used when no identity is given.
    pub identity_provider: Option<Arc<dyn IdentityProvider>>,
}

impl fmt::Debug for OrbitDbOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrbitDbOptions")
            .field("directory", &self.directory)
            .field("pubsub", &self.pubsub.is_some())
            .finish_non_exhaustive()
    }
}

/// Options for [`OrbitDb::create`] and [`OrbitDb::open`].
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Directory for this database's cache; the controller default when absent.
    pub directory: Option<PathBuf>,
    /// Allow `open` to create the database when given a plain name.
    pub create: bool,
    /// Replace an existing local database on `create`. Defaults to false
    /// for `create` and to true when `open` forwards to `create`.
    pub overwrite: Option<bool>,
    /// Replicate over pubsub; defaults to true.
    pub replicate: Option<bool>,
    /// Only open what exists locally.
    pub local_only: bool,
    /// Expected store type; checked against the manifest.
    pub db_type: Option<String>,
    /// Identity override for this store.
    pub identity: Option<Identity>,
    /// Access-controller parameters for creation.
    pub access_controller: Option<AccessControllerSpec>,
    /// Store-type defaults to freeze into the manifest on creation.
    pub defaults: Option<BTreeMap<String, Ipld>>,
    /// Merge manifest defaults underneath these options on open.
    pub merge_defaults: bool,
    /// Store-type-specific knobs; caller values win over manifest defaults.
    pub extra: BTreeMap<String, Ipld>,
}

struct Inner {
    peer_id: PeerId,
    identity: Identity,
    object_store: Arc<dyn ContentStore>,
    pubsub: Option<Arc<dyn PubSub>>,
    directory: PathBuf,
    keystore: Keystore,
    storage: Arc<dyn LocalStorage>,
    access_controllers: Arc<dyn AccessControllerFactory>,
    registry: TypeRegistry,
    stores: RwLock<BTreeMap<String, Arc<dyn Store>>>,
    channels: Mutex<HashMap<PeerId, Arc<dyn DirectChannel>>>,
    caches: Mutex<HashMap<PathBuf, Arc<dyn CacheStore>>>,
    publish_tx: mpsc::UnboundedSender<(String, Bytes)>,
}

/// Controller of a peer's databases.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct OrbitDb {
    inner: Arc<Inner>,
}

impl fmt::Debug for OrbitDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrbitDb")
            .field("peer_id", &self.inner.peer_id)
            .field("directory", &self.inner.directory)
            .field("stores", &self.inner.stores.read().len())
            .finish()
    }
}

impl OrbitDb {
    /// Construct a controller around an object-store client.
    ///
    /// Derives the peer id from the object store, ensures the directory,
    /// opens a keystore under `<directory>/<peer-id>/keystore`, creates a
    /// default identity bound to it, and opens the default cache under
    /// `<directory>/<peer-id>/cache`.
    pub async fn create_instance(
        object_store: Arc<dyn ContentStore>,
        options: OrbitDbOptions,
    ) -> Result<OrbitDb> {
        let peer_id = object_store.id().await?;
        let directory = options
            .directory
            .unwrap_or_else(|| PathBuf::from("./orbitdb"));
        tokio::fs::create_dir_all(&directory)
            .await
            .with_context(|| format!("failed to create directory {}", directory.display()))?;
        let storage: Arc<dyn LocalStorage> = options
            .storage
            .unwrap_or_else(|| Arc::new(RedbStorage));
        let keystore = match options.keystore {
            Some(keystore) => keystore,
            None => Keystore::open(directory.join(peer_id.as_str()).join("keystore")).await?,
        };
        let identity_provider: Arc<dyn IdentityProvider> = options
            .identity_provider
            .unwrap_or_else(|| Arc::new(DefaultIdentityProvider));
        let identity = match options.identity {
            Some(identity) => identity,
            None => {
                identity_provider
                    .create_identity(peer_id.as_str(), &keystore)
                    .await?
            }
        };
        let default_cache = match options.cache {
            Some(cache) => cache,
            None => {
                storage
                    .create_store(&directory.join(peer_id.as_str()).join("cache"))
                    .await?
            }
        };
        let registry = options
            .registry
            .unwrap_or_else(|| default_registry().clone());
        let access_controllers: Arc<dyn AccessControllerFactory> = options
            .access_controllers
            .unwrap_or_else(|| Arc::new(DefaultAccessControllerFactory));

        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        if let Some(pubsub) = options.pubsub.clone() {
            spawn_publisher(pubsub, publish_rx);
        }

        let mut caches = HashMap::new();
        caches.insert(directory.clone(), default_cache);

        debug!(peer = %peer_id, directory = %directory.display(), "controller ready");
        Ok(OrbitDb {
            inner: Arc::new(Inner {
                peer_id,
                identity,
                object_store,
                pubsub: options.pubsub,
                directory,
                keystore,
                storage,
                access_controllers,
                registry,
                stores: RwLock::new(BTreeMap::new()),
                channels: Mutex::new(HashMap::new()),
                caches: Mutex::new(caches),
                publish_tx,
            }),
        })
    }

    /// The controller's identity.
    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// Peer id derived from the object store.
    pub fn peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }

    /// Directory all local state lives under.
    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    /// This controller's type registry.
    pub fn registry(&self) -> &TypeRegistry {
        &self.inner.registry
    }

    /// The live store registered under `address`, if any.
    pub fn store(&self, address: &Address) -> Option<Arc<dyn Store>> {
        self.inner.stores.read().get(&address.to_string()).cloned()
    }

    /// Addresses of all live stores.
    pub fn stores(&self) -> Vec<String> {
        self.inner.stores.read().keys().cloned().collect()
    }

    /// Resolve the address `name` and `db_type` would create, without
    /// persisting the manifest or touching the cache index.
    pub async fn determine_address(
        &self,
        name: &str,
        db_type: &str,
        options: &OpenOptions,
    ) -> Result<Address> {
        self.resolve_address(name, db_type, options, true).await
    }

    async fn resolve_address(
        &self,
        name: &str,
        db_type: &str,
        options: &OpenOptions,
        only_hash: bool,
    ) -> Result<Address> {
        if !self.inner.registry.is_registered(db_type) {
            return Err(Error::InvalidType(db_type.to_string()));
        }
        if Address::is_valid(name) {
            return Err(Error::NameIsAddress);
        }
        let mut spec = options.access_controller.clone().unwrap_or_default();
        if spec.name.is_none() {
            spec.name = Some(name.to_string());
        }
        // No write list means the creating identity is the sole writer,
        // also when only a read list was given.
        if spec.write.is_none() {
            let identity = options.identity.as_ref().unwrap_or(&self.inner.identity);
            spec.write = Some(vec![identity.id().to_string()]);
        }
        let ac_type = spec.ac_type.clone().unwrap_or_else(|| "ipfs".to_string());
        let ac_path = self
            .inner
            .access_controllers
            .create(&*self.inner.object_store, &ac_type, &spec)
            .await?;
        let root = create_db_manifest(
            &*self.inner.object_store,
            name,
            db_type,
            &ac_path,
            &ManifestOptions {
                defaults: options.defaults.clone(),
                only_hash,
                codec: None,
            },
        )
        .await?;
        Address::parse(&format!("/{ADDRESS_PREFIX}/{root}/{name}"))
    }

    /// Create a database named `name` of type `db_type`.
    ///
    /// Fails with [`Error::AlreadyExists`] when the local cache index
    /// already knows the address and `overwrite` is not set. A failure
    /// after the index entry was written leaves the entry in place: the
    /// manifest is immutable and the entry idempotent, so a later `open`
    /// picks up where this left off.
    pub async fn create(
        &self,
        name: &str,
        db_type: &str,
        options: OpenOptions,
    ) -> Result<Arc<dyn Store>> {
        let address = self.resolve_address(name, db_type, &options, false).await?;
        let (cache, cache_dir) = self.request_cache(options.directory.as_deref()).await?;
        let key = manifest_cache_key(&address);
        let existing = cache.get(&key).await?;
        if existing.is_some() && !options.overwrite.unwrap_or(false) {
            return Err(Error::AlreadyExists(address));
        }
        migrations::run(&cache, &cache_dir, &address).await?;
        cache.set(&key, &address.root().to_string()).await?;
        debug!(%address, db_type, "database created");
        self.open_address(address, options).await
    }

    /// Open a database by address, or by name when `create` is set.
    pub async fn open(
        &self,
        address_or_name: &str,
        options: OpenOptions,
    ) -> Result<Arc<dyn Store>> {
        if !Address::is_valid(address_or_name) {
            if !options.create {
                return Err(Error::CreateNotSet);
            }
            let Some(db_type) = options.db_type.clone() else {
                return Err(Error::TypeMissing(self.inner.registry.tags().join("|")));
            };
            let overwrite = options.overwrite.unwrap_or(true);
            return self
                .create(
                    address_or_name,
                    &db_type,
                    OpenOptions {
                        overwrite: Some(overwrite),
                        ..options
                    },
                )
                .await;
        }
        let address = Address::parse(address_or_name)?;
        self.open_address(address, options).await
    }

    async fn open_address(
        &self,
        address: Address,
        mut options: OpenOptions,
    ) -> Result<Arc<dyn Store>> {
        debug!(%address, "open database");
        let (cache, _) = self.request_cache(options.directory.as_deref()).await?;
        let key = manifest_cache_key(&address);
        let known_locally = cache.get(&key).await?.is_some();
        if options.local_only && !known_locally {
            return Err(Error::NotFoundLocally(address));
        }
        let manifest = read_db_manifest(&*self.inner.object_store, address.root()).await?;
        if let Some(requested) = &options.db_type {
            if *requested != manifest.db_type {
                return Err(Error::TypeMismatch {
                    address,
                    actual: manifest.db_type,
                    requested: requested.clone(),
                });
            }
        }
        cache.set(&key, &address.root().to_string()).await?;
        if options.merge_defaults {
            if let Some(defaults) = &manifest.defaults {
                for (k, v) in defaults {
                    options.extra.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }
        self.create_store(
            &manifest.db_type,
            address,
            options,
            Some(manifest.access_controller),
        )
        .await
    }

    async fn create_store(
        &self,
        db_type: &str,
        address: Address,
        options: OpenOptions,
        access_controller_address: Option<String>,
    ) -> Result<Arc<dyn Store>> {
        let store_type = self.inner.registry.resolve(db_type)?;
        let spec = options.access_controller.clone().unwrap_or_default();
        let access_controller = match &access_controller_address {
            Some(path) => Some(
                self.inner
                    .access_controllers
                    .resolve(&*self.inner.object_store, path, &spec)
                    .await?,
            ),
            None => None,
        };
        let (cache, _) = self.request_cache(options.directory.as_deref()).await?;
        let identity = options
            .identity
            .clone()
            .unwrap_or_else(|| self.inner.identity.clone());
        let replicate = options.replicate.unwrap_or(true);

        let weak = Arc::downgrade(&self.inner);
        let on_write: OnWriteCallback = {
            let weak = weak.clone();
            Arc::new(move |address: &Address, _entry: &Entry, heads: &[Entry]| {
                let Some(inner) = weak.upgrade() else { return };
                if !replicate {
                    return;
                }
                if let Err(err) = inner.on_write(address, heads) {
                    error!(%address, %err, "write event failed");
                }
            })
        };
        let on_close: OnCloseCallback = {
            let weak = weak.clone();
            Arc::new(move |address: Address| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(inner) = weak.upgrade() {
                        Inner::on_store_close(inner, address).await;
                    }
                })
            })
        };

        let store_options = StoreOptions {
            replicate,
            local_only: options.local_only,
            access_controller,
            keystore: Some(self.inner.keystore.clone()),
            cache: Some(cache),
            on_write: Some(on_write),
            on_close: Some(on_close),
            extra: options.extra.clone(),
        };
        let ctx = StoreContext {
            object_store: self.inner.object_store.clone(),
            identity,
            address: address.clone(),
            db_type: db_type.to_string(),
            options: store_options,
        };
        let store = store_type.open(ctx).await?;

        // Register before subscribing so message dispatch always finds the
        // store. A prior registration for the same address is replaced.
        self.inner
            .stores
            .write()
            .insert(address.to_string(), store.clone());

        if replicate {
            if let Some(pubsub) = &self.inner.pubsub {
                let topic = address.to_string();
                let on_message: MessageCallback = {
                    let weak = weak.clone();
                    Arc::new(move |topic: String, data: Bytes| {
                        let weak = weak.clone();
                        Box::pin(async move {
                            if let Some(inner) = weak.upgrade() {
                                Inner::on_topic_message(inner, topic, data).await;
                            }
                        })
                    })
                };
                let on_peer: PeerCallback = {
                    let weak = weak.clone();
                    Arc::new(move |topic: String, peer: PeerId| {
                        let weak = weak.clone();
                        Box::pin(async move {
                            if let Some(inner) = weak.upgrade() {
                                Inner::on_peer_connected(inner, topic, peer).await;
                            }
                        })
                    })
                };
                pubsub.subscribe(&topic, on_message, on_peer).await?;
                debug!(address = %topic, "replication enabled");
            }
        }
        Ok(store)
    }

    /// Lazily acquire the cache for `directory`, reusing prior opens.
    async fn request_cache(
        &self,
        directory: Option<&Path>,
    ) -> Result<(Arc<dyn CacheStore>, PathBuf)> {
        let dir = directory
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.inner.directory.clone());
        let mut caches = self.inner.caches.lock().await;
        if let Some(cache) = caches.get(&dir) {
            return Ok((cache.clone(), dir));
        }
        let cache = self.inner.storage.create_store(&dir).await?;
        caches.insert(dir.clone(), cache.clone());
        Ok((cache, dir))
    }

    /// Close every live store, cache and channel and disconnect pubsub.
    ///
    /// Caches close concurrently, stores sequentially in registration
    /// order. Safe to invoke when nothing is open.
    pub async fn stop(&self) -> Result<()> {
        debug!(peer = %self.inner.peer_id, "stopping controller");
        self.inner.keystore.close().await;

        let caches: Vec<_> = {
            let mut caches = self.inner.caches.lock().await;
            caches.drain().map(|(_, cache)| cache).collect()
        };
        let results = futures::future::join_all(caches.iter().map(|cache| cache.close())).await;
        for result in results {
            if let Err(err) = result {
                warn!(%err, "failed to close cache");
            }
        }

        let stores: Vec<Arc<dyn Store>> =
            { self.inner.stores.read().values().cloned().collect() };
        for store in stores {
            store.close().await?;
        }
        self.inner.stores.write().clear();

        let channels: Vec<_> = {
            let mut channels = self.inner.channels.lock().await;
            channels.drain().map(|(_, channel)| channel).collect()
        };
        for channel in channels {
            if let Err(err) = channel.close().await {
                warn!(%err, "failed to close direct channel");
            }
        }

        if let Some(pubsub) = &self.inner.pubsub {
            pubsub.disconnect().await?;
        }
        Ok(())
    }

    /// Alias for [`stop`](OrbitDb::stop).
    pub async fn disconnect(&self) -> Result<()> {
        self.stop().await
    }

    // ---------------------------------------------------------------------
    // Per-type convenience operations
    // ---------------------------------------------------------------------

    /// Open (creating if needed) an event log.
    pub async fn eventlog(&self, address_or_name: &str, options: OpenOptions) -> Result<EventStore> {
        self.open_as("eventlog", address_or_name, options).await
    }

    /// Alias for [`eventlog`](OrbitDb::eventlog).
    pub async fn log(&self, address_or_name: &str, options: OpenOptions) -> Result<EventStore> {
        self.open_as("eventlog", address_or_name, options).await
    }

    /// Open (creating if needed) a feed.
    pub async fn feed(&self, address_or_name: &str, options: OpenOptions) -> Result<EventStore> {
        self.open_as("feed", address_or_name, options).await
    }

    /// Open (creating if needed) a key-value store.
    pub async fn keyvalue(&self, address_or_name: &str, options: OpenOptions) -> Result<KvStore> {
        self.open_as("keyvalue", address_or_name, options).await
    }

    /// Alias for [`keyvalue`](OrbitDb::keyvalue).
    pub async fn kvstore(&self, address_or_name: &str, options: OpenOptions) -> Result<KvStore> {
        self.open_as("keyvalue", address_or_name, options).await
    }

    /// Open (creating if needed) a counter.
    pub async fn counter(&self, address_or_name: &str, options: OpenOptions) -> Result<CounterStore> {
        self.open_as("counter", address_or_name, options).await
    }

    /// Open (creating if needed) a document store.
    pub async fn docstore(&self, address_or_name: &str, options: OpenOptions) -> Result<DocStore> {
        self.open_as("docstore", address_or_name, options).await
    }

    /// Alias for [`docstore`](OrbitDb::docstore).
    pub async fn docs(&self, address_or_name: &str, options: OpenOptions) -> Result<DocStore> {
        self.open_as("docstore", address_or_name, options).await
    }

    async fn open_as<T: Store + Clone>(
        &self,
        db_type: &str,
        address_or_name: &str,
        options: OpenOptions,
    ) -> Result<T> {
        let store = self
            .open(
                address_or_name,
                OpenOptions {
                    create: true,
                    db_type: Some(db_type.to_string()),
                    ..options
                },
            )
            .await?;
        store
            .as_any()
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| Error::invariant(format!("store for '{db_type}' has unexpected type")))
    }
}

impl Inner {
    /// Forward a local write to the pubsub overlay, in emission order.
    fn on_write(&self, address: &Address, heads: &[Entry]) -> Result<()> {
        if heads.is_empty() {
            return Err(Error::invariant(format!(
                "'heads' not defined for write on '{address}'"
            )));
        }
        if self.pubsub.is_none() {
            return Ok(());
        }
        let data = exchange::encode_heads(address, heads)?;
        self.publish_tx
            .send((address.to_string(), data))
            .map_err(|_| Error::invariant("publisher task is gone"))?;
        Ok(())
    }

    /// Merge a head announcement into the matching live store.
    ///
    /// Errors are logged and swallowed; a remote message must never crash
    /// the controller.
    async fn dispatch_heads(self: &Arc<Self>, address: String, heads: Vec<Entry>) {
        if heads.is_empty() {
            return;
        }
        let store = self.stores.read().get(&address).cloned();
        let Some(store) = store else {
            return;
        };
        if let Err(err) = store.sync(heads).await {
            warn!(%address, %err, "failed to sync remote heads");
        }
    }

    async fn on_topic_message(self: Arc<Self>, topic: String, data: Bytes) {
        match exchange::decode_message(&data) {
            Ok(exchange::Message::Heads { heads, .. }) => {
                self.dispatch_heads(topic, heads).await;
            }
            Err(err) => {
                warn!(address = %topic, %err, "ignoring undecodable pubsub message");
            }
        }
    }

    async fn on_channel_message(self: Arc<Self>, from: PeerId, data: Bytes) {
        match exchange::decode_message(&data) {
            Ok(exchange::Message::Heads { address, heads }) => {
                self.dispatch_heads(address, heads).await;
            }
            Err(err) => {
                warn!(peer = %from, %err, "ignoring undecodable channel message");
            }
        }
    }

    /// Head-exchange handshake with a newly-observed peer.
    async fn on_peer_connected(self: Arc<Self>, topic: String, peer: PeerId) {
        let store = self.stores.read().get(&topic).cloned();
        let Some(store) = store else {
            return;
        };
        let Some(pubsub) = self.pubsub.clone() else {
            return;
        };
        debug!(address = %topic, %peer, "peer connected");

        // Concurrent handshakes with the same peer share one channel.
        let channel = {
            let mut channels = self.channels.lock().await;
            match channels.get(&peer) {
                Some(channel) => channel.clone(),
                None => {
                    let on_message: ChannelMessageCallback = {
                        let weak = Arc::downgrade(&self);
                        Arc::new(move |from: PeerId, data: Bytes| {
                            let weak = weak.clone();
                            Box::pin(async move {
                                if let Some(inner) = weak.upgrade() {
                                    inner.on_channel_message(from, data).await;
                                }
                            })
                        })
                    };
                    let channel = match pubsub.open_channel(&peer, on_message).await {
                        Ok(channel) => channel,
                        Err(err) => {
                            warn!(%peer, %err, "failed to open direct channel");
                            return;
                        }
                    };
                    channels.insert(peer.clone(), channel.clone());
                    channel
                }
            }
        };

        let address = store.address().clone();
        match exchange::exchange_heads(channel.as_ref(), &address, &store.heads()).await {
            Ok(()) => {
                store.events().emit(StoreEvent::Peer { address, peer });
            }
            Err(err) => {
                warn!(%address, %peer, %err, "head exchange failed");
            }
        }
    }

    /// Unregister and unsubscribe a closed store. Idempotent.
    async fn on_store_close(self: Arc<Self>, address: Address) {
        let key = address.to_string();
        let removed = self.stores.write().remove(&key).is_some();
        if let Some(pubsub) = &self.pubsub {
            if let Err(err) = pubsub.unsubscribe(&key).await {
                warn!(%address, %err, "failed to unsubscribe");
            }
        }
        debug!(%address, removed, "store closed");
    }
}

fn spawn_publisher(pubsub: Arc<dyn PubSub>, mut rx: mpsc::UnboundedReceiver<(String, Bytes)>) {
    tokio::spawn(async move {
        while let Some((topic, data)) = rx.recv().await {
            if let Err(err) = pubsub.publish(&topic, data).await {
                warn!(topic, %err, "failed to publish heads");
            }
        }
    });
}
