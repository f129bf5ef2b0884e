//! Document store (`docstore`).

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::address::Address;
use crate::error::Result;
use crate::registry::StoreType;

use super::keyvalue::apply_op;
use super::{decode_op, Entry, OpLog, Store, StoreContext, StoreEvents, StoreOptions};

const DEFAULT_INDEX_BY: &str = "_id";

/// JSON document store indexed by a configurable id field.
///
/// The id field defaults to `_id` and can be overridden with the `indexBy`
/// option (typically frozen into the manifest defaults at creation time).
#[derive(Debug, Clone)]
pub struct DocStore {
    log: Arc<OpLog>,
    index_by: String,
    index: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl DocStore {
    fn new(log: Arc<OpLog>) -> Self {
        let index_by = log
            .extra_str("indexBy")
            .unwrap_or(DEFAULT_INDEX_BY)
            .to_string();
        Self {
            log,
            index_by,
            index: Default::default(),
        }
    }

    /// Store `doc`, keyed by its id field.
    pub async fn put(&self, doc: Value) -> Result<Entry> {
        let key = doc
            .get(&self.index_by)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("document has no string field '{}'", self.index_by))?
            .to_string();
        let payload = json!({ "op": "PUT", "key": key, "value": doc });
        let entry = self.log.append(payload.to_string().into_bytes()).await?;
        self.rebuild_index();
        Ok(entry)
    }

    /// Delete the document with id `key`.
    pub async fn del(&self, key: &str) -> Result<Entry> {
        let payload = json!({ "op": "DEL", "key": key });
        let entry = self.log.append(payload.to_string().into_bytes()).await?;
        self.rebuild_index();
        Ok(entry)
    }

    /// Document with id `key`, or `None`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.index.read().get(key).cloned()
    }

    /// Documents matching `predicate`.
    pub fn query(&self, predicate: impl Fn(&Value) -> bool) -> Vec<Value> {
        self.index
            .read()
            .values()
            .filter(|doc| predicate(doc))
            .cloned()
            .collect()
    }

    fn rebuild_index(&self) {
        let mut map = BTreeMap::new();
        for entry in self.log.sorted_entries() {
            let Some(op) = decode_op(&entry.payload) else {
                continue;
            };
            apply_op(&mut map, &op);
        }
        *self.index.write() = map;
    }
}

#[async_trait]
impl Store for DocStore {
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
        self.log.load().await?;
        self.rebuild_index();
        Ok(())
    }

    async fn sync(&self, heads: Vec<Entry>) -> Result<()> {
        let added = self.log.merge(heads).await?;
        if added > 0 {
            self.rebuild_index();
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.log.close().await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) struct DocStoreType;

#[async_trait]
impl StoreType for DocStoreType {
    async fn open(&self, ctx: StoreContext) -> Result<Arc<dyn Store>> {
        Ok(Arc::new(DocStore::new(Arc::new(OpLog::new(ctx)))))
    }
}

#[cfg(test)]
mod tests {
    use libipld::Ipld;

    use super::*;
    use crate::store::test_util::{context, env};

    async fn open_store(index_by: Option<&str>) -> DocStore {
        let env = env("docs").await;
        let mut ctx = context(&env, "docstore").await;
        if let Some(field) = index_by {
            ctx.options
                .extra
                .insert("indexBy".to_string(), Ipld::String(field.to_string()));
        }
        let store = DocStoreType.open(ctx).await.unwrap();
        store.as_any().downcast_ref::<DocStore>().cloned().unwrap()
    }

    #[tokio::test]
    async fn put_get_query() {
        let store = open_store(None).await;
        store
            .put(json!({ "_id": "a", "kind": "fruit" }))
            .await
            .unwrap();
        store
            .put(json!({ "_id": "b", "kind": "stone" }))
            .await
            .unwrap();
        assert_eq!(
            store.get("a"),
            Some(json!({ "_id": "a", "kind": "fruit" }))
        );
        let fruit = store.query(|doc| doc.get("kind") == Some(&json!("fruit")));
        assert_eq!(fruit.len(), 1);
        store.del("a").await.unwrap();
        assert_eq!(store.get("a"), None);
    }

    #[tokio::test]
    async fn rejects_documents_without_id_field() {
        let store = open_store(None).await;
        assert!(store.put(json!({ "kind": "fruit" })).await.is_err());
    }

    #[tokio::test]
    async fn custom_index_field() {
        let store = open_store(Some("name")).await;
        store.put(json!({ "name": "shape" })).await.unwrap();
        assert_eq!(store.get("shape"), Some(json!({ "name": "shape" })));
    }
}
