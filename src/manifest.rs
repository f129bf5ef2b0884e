//! Database manifests.
//!
//! A manifest is the write-once descriptor of a database, persisted as
//! dag-cbor in the object store. Its CID is the `root` of every address
//! that refers to the database.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context};
use cid::Cid;
use libipld::{Ipld, IpldCodec};

use crate::content::{ContentStore, WriteOptions};
use crate::error::Result;

/// Immutable descriptor of a database.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    /// Human name given at creation time.
    pub name: String,
    /// Registered store type tag.
    pub db_type: String,
    /// Object-store path of the access-controller descriptor.
    pub access_controller: String,
    /// Store-type-specific defaults frozen at creation time.
    pub defaults: Option<BTreeMap<String, Ipld>>,
}

impl Manifest {
    pub(crate) fn to_ipld(&self) -> Ipld {
        let mut map = BTreeMap::new();
        map.insert("name".to_string(), Ipld::String(self.name.clone()));
        map.insert("type".to_string(), Ipld::String(self.db_type.clone()));
        map.insert(
            "accessController".to_string(),
            Ipld::String(self.access_controller.clone()),
        );
        if let Some(defaults) = &self.defaults {
            map.insert("defaults".to_string(), Ipld::Map(defaults.clone()));
        }
        Ipld::Map(map)
    }

    pub(crate) fn from_ipld(value: &Ipld) -> Result<Self> {
        let Ipld::Map(map) = value else {
            return Err(anyhow!("manifest is not a map").into());
        };
        let field = |key: &str| -> Result<String> {
            match map.get(key) {
                Some(Ipld::String(s)) => Ok(s.clone()),
                _ => Err(anyhow!("manifest field '{key}' missing or not a string").into()),
            }
        };
        let defaults = match map.get("defaults") {
            Some(Ipld::Map(m)) => Some(m.clone()),
            Some(other) => {
                return Err(anyhow!("manifest field 'defaults' is not a map: {other:?}").into())
            }
            None => None,
        };
        Ok(Self {
            name: field("name")?,
            db_type: field("type")?,
            access_controller: field("accessController")?,
            defaults,
        })
    }
}

/// Options for [`create_db_manifest`].
#[derive(Debug, Clone, Default)]
pub struct ManifestOptions {
    /// Explicit defaults object to freeze into the manifest.
    pub defaults: Option<BTreeMap<String, Ipld>>,
    /// Compute the manifest hash without persisting it.
    pub only_hash: bool,
    /// Codec override; dag-cbor when absent.
    pub codec: Option<IpldCodec>,
}

/// Build a manifest record and persist it to the object store.
///
/// Returns the content hash that becomes the root of the database address.
/// The manifest carries a `defaults` field iff `options.defaults` is set.
pub async fn create_db_manifest(
    store: &dyn ContentStore,
    name: &str,
    db_type: &str,
    access_controller: &str,
    options: &ManifestOptions,
) -> Result<Cid> {
    let manifest = Manifest {
        name: name.to_string(),
        db_type: db_type.to_string(),
        access_controller: access_controller.to_string(),
        defaults: options.defaults.clone(),
    };
    let codec = options.codec.unwrap_or(IpldCodec::DagCbor);
    let cid = store
        .write(
            codec,
            &manifest.to_ipld(),
            WriteOptions {
                only_hash: options.only_hash,
            },
        )
        .await
        .context("failed to write manifest")?;
    Ok(cid)
}

/// Read a manifest back from the object store.
pub async fn read_db_manifest(store: &dyn ContentStore, root: &Cid) -> Result<Manifest> {
    let value = store.read(root).await?;
    Manifest::from_ipld(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MemContentStore;

    #[tokio::test]
    async fn manifest_roundtrip() {
        let store = MemContentStore::new("peer-a");
        let root = create_db_manifest(&store, "events", "eventlog", "/ipfs/abc", &Default::default())
            .await
            .unwrap();
        let manifest = read_db_manifest(&store, &root).await.unwrap();
        assert_eq!(manifest.name, "events");
        assert_eq!(manifest.db_type, "eventlog");
        assert_eq!(manifest.access_controller, "/ipfs/abc");
        assert!(manifest.defaults.is_none());
    }

    #[tokio::test]
    async fn defaults_only_present_when_given() {
        let store = MemContentStore::new("peer-a");
        let mut defaults = BTreeMap::new();
        defaults.insert("indexBy".to_string(), Ipld::String("id".to_string()));
        let with = create_db_manifest(
            &store,
            "docs",
            "docstore",
            "/ipfs/abc",
            &ManifestOptions {
                defaults: Some(defaults.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let without = create_db_manifest(&store, "docs", "docstore", "/ipfs/abc", &Default::default())
            .await
            .unwrap();
        assert_ne!(with, without);
        let manifest = read_db_manifest(&store, &with).await.unwrap();
        assert_eq!(manifest.defaults, Some(defaults));
    }

    #[tokio::test]
    async fn only_hash_matches_persisted_hash() {
        let store = MemContentStore::new("peer-a");
        let opts = ManifestOptions {
            only_hash: true,
            ..Default::default()
        };
        let hashed = create_db_manifest(&store, "a", "feed", "/ipfs/x", &opts)
            .await
            .unwrap();
        assert!(!store.contains(&hashed));
        let written = create_db_manifest(&store, "a", "feed", "/ipfs/x", &Default::default())
            .await
            .unwrap();
        assert_eq!(hashed, written);
    }
}
