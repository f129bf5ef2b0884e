//! Registry of store types.
//!
//! Store implementations register a constructor capability under a string
//! tag. Each controller carries its own registry; a process-wide default
//! holds the built-in types and can be extended with [`add_database_type`]
//! before any controller is constructed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::store::{Store, StoreContext};

/// Constructor capability for one store type.
#[async_trait]
pub trait StoreType: Send + Sync + 'static {
    /// Construct a store instance for `ctx`.
    async fn open(&self, ctx: StoreContext) -> Result<Arc<dyn Store>>;
}

impl fmt::Debug for dyn StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreType")
    }
}

/// Mapping from type tag to store constructor.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    inner: Arc<RwLock<BTreeMap<String, Arc<dyn StoreType>>>>,
}

impl TypeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry seeded with the built-in store types.
    pub fn with_builtin_types() -> Self {
        let registry = Self::new();
        crate::store::register_builtin_types(&registry)
            .expect("built-in type tags are distinct");
        registry
    }

    /// Register `ctor` under `tag`. Fails if the tag is already present.
    pub fn register(&self, tag: &str, ctor: Arc<dyn StoreType>) -> Result<()> {
        let mut table = self.inner.write();
        if table.contains_key(tag) {
            return Err(anyhow!("database type '{tag}' is already registered").into());
        }
        table.insert(tag.to_string(), ctor);
        Ok(())
    }

    /// Look up the constructor for `tag`.
    pub fn resolve(&self, tag: &str) -> Result<Arc<dyn StoreType>> {
        self.inner
            .read()
            .get(tag)
            .cloned()
            .ok_or_else(|| Error::InvalidType(tag.to_string()))
    }

    /// Whether `tag` is registered.
    pub fn is_registered(&self, tag: &str) -> bool {
        self.inner.read().contains_key(tag)
    }

    /// The registered tags, in order.
    pub fn tags(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TypeRegistry").field(&self.tags()).finish()
    }
}

static DEFAULT_REGISTRY: Lazy<TypeRegistry> = Lazy::new(TypeRegistry::with_builtin_types);

/// The process-wide default registry, holding the built-in store types.
pub fn default_registry() -> &'static TypeRegistry {
    &DEFAULT_REGISTRY
}

/// Register a custom store type in the process-wide default registry.
///
/// Must be called before constructing a controller that should see the
/// type; controllers built with their own registry are unaffected.
pub fn add_database_type(tag: &str, ctor: Arc<dyn StoreType>) -> Result<()> {
    default_registry().register(tag, ctor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tags_are_ordered() {
        let registry = TypeRegistry::with_builtin_types();
        let tags = registry.tags();
        let mut sorted = tags.clone();
        sorted.sort();
        assert_eq!(tags, sorted);
        for tag in ["counter", "docstore", "eventlog", "feed", "keyvalue"] {
            assert!(registry.is_registered(tag), "missing builtin '{tag}'");
        }
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = TypeRegistry::with_builtin_types();
        let ctor = registry.resolve("eventlog").unwrap();
        assert!(registry.register("eventlog", ctor).is_err());
    }

    #[test]
    fn unknown_tag_is_invalid_type() {
        let registry = TypeRegistry::with_builtin_types();
        let err = registry.resolve("widget").unwrap_err();
        assert_eq!(err.to_string(), "Invalid database type 'widget'");
    }
}
