//! Client interface to the content-addressed object store.
//!
//! The controller never talks to a concrete object store; it goes through
//! [`ContentStore`]. Objects are IPLD values encoded with the codec named in
//! their CID, dag-cbor by default. Reads wait until the object is available:
//! a store backed by a network fetches from peers, so "not found" is not a
//! final state.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use cid::multihash::{Code, MultihashDigest};
use cid::Cid;
use libipld::{prelude::Codec as _, Ipld, IpldCodec};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Stable string identity of a node, derived from the object store client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap a peer id string.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Options for [`ContentStore::write`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Compute the content hash without persisting the object.
    pub only_hash: bool,
}

/// Client to a content-addressed object store.
#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    /// Read and decode the object behind `cid`.
    ///
    /// Waits until the object is available; callers that cannot tolerate
    /// waiting must check local state first.
    async fn read(&self, cid: &Cid) -> Result<Ipld>;

    /// Encode `value` with `codec` and persist it, returning its CID.
    async fn write(&self, codec: IpldCodec, value: &Ipld, options: WriteOptions) -> Result<Cid>;

    /// Peer id of the node backing this client.
    async fn id(&self) -> Result<PeerId>;
}

impl fmt::Debug for dyn ContentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentStore")
    }
}

/// Encode an IPLD value and compute its CIDv1.
pub(crate) fn encode_ipld(codec: IpldCodec, value: &Ipld) -> Result<(Cid, Vec<u8>)> {
    let bytes = codec.encode(value).context("ipld encode failed")?;
    let hash = Code::Sha2_256.digest(&bytes);
    Ok((Cid::new_v1(codec.into(), hash), bytes))
}

/// Decode bytes with the codec named in `cid`.
pub(crate) fn decode_ipld(cid: &Cid, bytes: &[u8]) -> Result<Ipld> {
    let codec = IpldCodec::try_from(cid.codec())
        .map_err(|_| anyhow::anyhow!("unknown codec {:#x} in {cid}", cid.codec()))?;
    let value = codec.decode(bytes).context("ipld decode failed")?;
    Ok(value)
}

/// In-memory object store shared between clients.
///
/// All clients created with [`MemContentStore::client`] see the same
/// objects, like nodes on the same content network. `read` blocks until the
/// object appears, matching the semantics of a networked store.
#[derive(Clone)]
pub struct MemContentStore {
    inner: Arc<Inner>,
    peer_id: PeerId,
}

struct Inner {
    objects: parking_lot::RwLock<HashMap<Cid, Vec<u8>>>,
    arrived: tokio::sync::Notify,
}

impl MemContentStore {
    /// New store with a single client identified by `peer_id`.
    pub fn new(peer_id: impl Into<PeerId>) -> Self {
        Self {
            inner: Arc::new(Inner {
                objects: Default::default(),
                arrived: Default::default(),
            }),
            peer_id: peer_id.into(),
        }
    }

    /// Another client on the same object network.
    pub fn client(&self, peer_id: impl Into<PeerId>) -> Self {
        Self {
            inner: self.inner.clone(),
            peer_id: peer_id.into(),
        }
    }

    /// Whether the object is present, without waiting.
    pub fn contains(&self, cid: &Cid) -> bool {
        self.inner.objects.read().contains_key(cid)
    }
}

impl fmt::Debug for MemContentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemContentStore")
            .field("peer_id", &self.peer_id)
            .field("objects", &self.inner.objects.read().len())
            .finish()
    }
}

#[async_trait]
impl ContentStore for MemContentStore {
    async fn read(&self, cid: &Cid) -> Result<Ipld> {
        loop {
            if let Some(bytes) = self.inner.objects.read().get(cid) {
                return decode_ipld(cid, bytes);
            }
            let notified = self.inner.arrived.notified();
            // Re-check after arming the notification so a concurrent write
            // cannot slip between the lookup and the wait.
            if let Some(bytes) = self.inner.objects.read().get(cid) {
                return decode_ipld(cid, bytes);
            }
            notified.await;
        }
    }

    async fn write(&self, codec: IpldCodec, value: &Ipld, options: WriteOptions) -> Result<Cid> {
        let (cid, bytes) = encode_ipld(codec, value)?;
        if !options.only_hash {
            self.inner.objects.write().insert(cid, bytes);
            self.inner.arrived.notify_waiters();
        }
        Ok(cid)
    }

    async fn id(&self) -> Result<PeerId> {
        Ok(self.peer_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Ipld {
        let mut map = std::collections::BTreeMap::new();
        map.insert("hello".to_string(), Ipld::String("world".to_string()));
        Ipld::Map(map)
    }

    #[tokio::test]
    async fn write_then_read() {
        let store = MemContentStore::new("peer-a");
        let cid = store
            .write(IpldCodec::DagCbor, &sample(), Default::default())
            .await
            .unwrap();
        let value = store.read(&cid).await.unwrap();
        assert_eq!(value, sample());
    }

    #[tokio::test]
    async fn only_hash_does_not_persist() {
        let store = MemContentStore::new("peer-a");
        let hashed = store
            .write(
                IpldCodec::DagCbor,
                &sample(),
                WriteOptions { only_hash: true },
            )
            .await
            .unwrap();
        assert!(!store.contains(&hashed));
        let written = store
            .write(IpldCodec::DagCbor, &sample(), Default::default())
            .await
            .unwrap();
        assert_eq!(hashed, written);
    }

    #[tokio::test]
    async fn read_waits_for_object() {
        let store = MemContentStore::new("peer-a");
        let (cid, _) = encode_ipld(IpldCodec::DagCbor, &sample()).unwrap();
        let reader = store.client("peer-b");
        let read = tokio::spawn(async move { reader.read(&cid).await });
        tokio::task::yield_now().await;
        store
            .write(IpldCodec::DagCbor, &sample(), Default::default())
            .await
            .unwrap();
        let value = read.await.unwrap().unwrap();
        assert_eq!(value, sample());
    }
}
