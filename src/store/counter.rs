//! Grow-only counter store (`counter`).

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::address::Address;
use crate::error::Result;
use crate::registry::StoreType;

use super::{decode_op, Entry, OpLog, Store, StoreContext, StoreEvents, StoreOptions};

/// Grow-only counter.
///
/// Each increment is one log entry; the value is the sum over all entries,
/// which commutes under merge since the log deduplicates by hash.
#[derive(Debug, Clone)]
pub struct CounterStore {
    log: Arc<OpLog>,
}

impl CounterStore {
    /// Increment the counter by `amount`.
    pub async fn inc(&self, amount: u64) -> Result<Entry> {
        let payload = json!({ "op": "INC", "amount": amount });
        self.log.append(payload.to_string().into_bytes()).await
    }

    /// Current counter value.
    pub fn value(&self) -> u64 {
        self.log
            .sorted_entries()
            .iter()
            .filter_map(|e| decode_op(&e.payload))
            .filter(|op| op.get("op").and_then(Value::as_str) == Some("INC"))
            .filter_map(|op| op.get("amount").and_then(Value::as_u64))
            .sum()
    }
}

#[async_trait]
impl Store for CounterStore {
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

pub(crate) struct CounterStoreType;

#[async_trait]
impl StoreType for CounterStoreType {
    async fn open(&self, ctx: StoreContext) -> Result<Arc<dyn Store>> {
        Ok(Arc::new(CounterStore {
            log: Arc::new(OpLog::new(ctx)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_util::{context, env};

    #[tokio::test]
    async fn value_sums_increments() {
        let env = env("counter").await;
        let store = CounterStoreType
            .open(context(&env, "counter").await)
            .await
            .unwrap();
        let counter = store
            .as_any()
            .downcast_ref::<CounterStore>()
            .cloned()
            .unwrap();
        assert_eq!(counter.value(), 0);
        counter.inc(1).await.unwrap();
        counter.inc(5).await.unwrap();
        assert_eq!(counter.value(), 6);
    }
}
