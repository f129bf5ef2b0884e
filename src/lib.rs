//! Coordinator for named, typed, replicated databases on top of a
//! content-addressed object store and a publish/subscribe overlay.
//!
//! A database is identified by an immutable [`Address`]
//! (`/orbitdb/<root>/<path>`) whose root is the content hash of a
//! write-once [manifest](manifest::Manifest). The [`OrbitDb`] controller
//! resolves names to addresses, instantiates the store type the manifest
//! declares, records the database in a local cache index so it survives
//! restart, and binds each live store to the overlay: local appends are
//! broadcast, remote head sets are merged, and newly-observed peers
//! trigger a head-exchange handshake over a direct channel.
//!
//! The external collaborators are consumed through traits:
//! [`ContentStore`](content::ContentStore) for the object store,
//! [`PubSub`](pubsub::PubSub) for the overlay,
//! [`LocalStorage`](cache::LocalStorage) for the on-disk cache, and
//! [`AccessControllerFactory`](access::AccessControllerFactory) for write
//! policies. In-memory implementations of each ship with the crate, so a
//! controller runs end to end without a network:
//!
//! ```no_run
//! use std::sync::Arc;
//! use orbitdb::{MemContentStore, MemNetwork, OrbitDb, OrbitDbOptions, OpenOptions};
//!
//! # async fn example() -> orbitdb::Result<()> {
//! let objects = MemContentStore::new("peer-a");
//! let network = MemNetwork::new();
//! let orbit = OrbitDb::create_instance(
//!     Arc::new(objects),
//!     OrbitDbOptions {
//!         directory: Some("./orbitdb".into()),
//!         pubsub: Some(Arc::new(network.client("peer-a"))),
//!         ..Default::default()
//!     },
//! )
//! .await?;
//! let log = orbit.eventlog("chat", OpenOptions::default()).await?;
//! log.add("hello").await?;
//! orbit.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod address;
pub mod cache;
pub mod content;
mod controller;
mod error;
mod exchange;
pub mod identity;
pub mod manifest;
mod migrations;
pub mod pubsub;
pub mod registry;
pub mod store;

pub use cid::Cid;
pub use libipld::Ipld;

pub use self::address::Address;
pub use self::content::{ContentStore, MemContentStore, PeerId, WriteOptions};
pub use self::controller::{OpenOptions, OrbitDb, OrbitDbOptions};
pub use self::error::{Error, Result};
pub use self::identity::{Identity, Keystore};
pub use self::pubsub::{MemNetwork, PubSub};
pub use self::registry::{add_database_type, TypeRegistry};
pub use self::store::{
    CounterStore, DocStore, Entry, EventStore, IteratorOptions, KvStore, LamportClock, Store,
    StoreEvent,
};
