//! Access controllers.
//!
//! The controller does not define access policy; it persists and resolves
//! access-controller descriptors through a factory and hands the resolved
//! controller to each store. The built-in `ipfs` type stores the
//! descriptor as a dag-cbor object and grants append rights by identity id.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use cid::Cid;
use libipld::{Ipld, IpldCodec};

use crate::content::{ContentStore, WriteOptions};
use crate::error::Result;

/// Caller-supplied access-controller parameters.
#[derive(Debug, Clone, Default)]
pub struct AccessControllerSpec {
    /// Controller type tag; `ipfs` when absent.
    pub ac_type: Option<String>,
    /// Name, defaulted to the database name.
    pub name: Option<String>,
    /// Identity ids allowed to append. `*` grants everyone.
    pub write: Option<Vec<String>>,
    /// Read keys are accepted but not consulted by the controller.
    pub read: Option<Vec<String>>,
}

/// Resolved access policy for one database.
pub trait AccessController: Send + Sync + 'static {
    /// Identity ids allowed to append.
    fn write_keys(&self) -> &[String];

    /// Whether `identity_id` may append.
    fn can_append(&self, identity_id: &str) -> bool {
        self.write_keys()
            .iter()
            .any(|k| k == "*" || k == identity_id)
    }
}

/// Factory that persists and resolves access-controller descriptors.
#[async_trait]
pub trait AccessControllerFactory: Send + Sync + 'static {
    /// Persist a new descriptor; returns its object-store path.
    async fn create(
        &self,
        store: &dyn ContentStore,
        ac_type: &str,
        spec: &AccessControllerSpec,
    ) -> Result<String>;

    /// Load the descriptor at `path`.
    async fn resolve(
        &self,
        store: &dyn ContentStore,
        path: &str,
        spec: &AccessControllerSpec,
    ) -> Result<Arc<dyn AccessController>>;
}

/// Access controller whose descriptor lives in the object store.
#[derive(Debug, Clone)]
pub struct IpfsAccessController {
    write: Vec<String>,
}

impl IpfsAccessController {
    /// Controller granting append rights to `write`.
    pub fn new(write: Vec<String>) -> Self {
        Self { write }
    }
}

impl AccessController for IpfsAccessController {
    fn write_keys(&self) -> &[String] {
        &self.write
    }
}

/// Default factory; supports the `ipfs` controller type.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAccessControllerFactory;

#[async_trait]
impl AccessControllerFactory for DefaultAccessControllerFactory {
    async fn create(
        &self,
        store: &dyn ContentStore,
        ac_type: &str,
        spec: &AccessControllerSpec,
    ) -> Result<String> {
        if ac_type != "ipfs" {
            return Err(anyhow!("unsupported access-controller type '{ac_type}'").into());
        }
        let write = spec.write.clone().unwrap_or_default();
        let mut map = BTreeMap::new();
        map.insert("type".to_string(), Ipld::String(ac_type.to_string()));
        map.insert(
            "write".to_string(),
            Ipld::List(write.into_iter().map(Ipld::String).collect()),
        );
        let cid = store
            .write(IpldCodec::DagCbor, &Ipld::Map(map), WriteOptions::default())
            .await
            .context("failed to write access-controller descriptor")?;
        Ok(format!("/ipfs/{cid}"))
    }

    async fn resolve(
        &self,
        store: &dyn ContentStore,
        path: &str,
        _spec: &AccessControllerSpec,
    ) -> Result<Arc<dyn AccessController>> {
        let cid = path
            .strip_prefix("/ipfs/")
            .ok_or_else(|| anyhow!("not an object-store path: '{path}'"))?;
        let cid = Cid::from_str(cid).context("invalid access-controller path")?;
        let value = store.read(&cid).await?;
        let Ipld::Map(map) = value else {
            return Err(anyhow!("access-controller descriptor is not a map").into());
        };
        let write = match map.get("write") {
            Some(Ipld::List(keys)) => keys
                .iter()
                .map(|k| match k {
                    Ipld::String(s) => Ok(s.clone()),
                    other => Err(anyhow!("write key is not a string: {other:?}")),
                })
                .collect::<std::result::Result<Vec<_>, _>>()?,
            _ => return Err(anyhow!("access-controller descriptor has no write list").into()),
        };
        Ok(Arc::new(IpfsAccessController::new(write)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MemContentStore;

    #[tokio::test]
    async fn create_and_resolve() {
        let store = MemContentStore::new("peer-a");
        let factory = DefaultAccessControllerFactory;
        let spec = AccessControllerSpec {
            write: Some(vec!["alice".to_string()]),
            ..Default::default()
        };
        let path = factory.create(&store, "ipfs", &spec).await.unwrap();
        assert!(path.starts_with("/ipfs/"));
        let ac = factory.resolve(&store, &path, &spec).await.unwrap();
        assert!(ac.can_append("alice"));
        assert!(!ac.can_append("bob"));
    }

    #[tokio::test]
    async fn wildcard_grants_everyone() {
        let ac = IpfsAccessController::new(vec!["*".to_string()]);
        assert!(ac.can_append("anyone"));
    }

    #[tokio::test]
    async fn unknown_type_fails() {
        let store = MemContentStore::new("peer-a");
        let factory = DefaultAccessControllerFactory;
        assert!(factory
            .create(&store, "orbitdb", &Default::default())
            .await
            .is_err());
    }
}
