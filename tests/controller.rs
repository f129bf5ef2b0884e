//! End-to-end tests for the controller against the in-memory backends.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use orbitdb::access::AccessControllerSpec;
use orbitdb::cache::{LocalStorage, MemStorage, RedbStorage};
use orbitdb::manifest::read_db_manifest;
use orbitdb::{
    Error, Ipld, IteratorOptions, MemContentStore, OpenOptions, OrbitDb, OrbitDbOptions, Store,
};

struct Node {
    orbit: OrbitDb,
    objects: MemContentStore,
    storage: MemStorage,
    _dir: TempDir,
}

async fn spawn_node() -> Node {
    let dir = tempfile::tempdir().unwrap();
    let objects = MemContentStore::new("peer-a");
    let storage = MemStorage::default();
    let orbit = OrbitDb::create_instance(
        Arc::new(objects.clone()),
        OrbitDbOptions {
            directory: Some(dir.path().to_path_buf()),
            storage: Some(Arc::new(storage.clone())),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    Node {
        orbit,
        objects,
        storage,
        _dir: dir,
    }
}

fn local() -> OpenOptions {
    OpenOptions {
        replicate: Some(false),
        ..Default::default()
    }
}

#[tokio::test]
async fn create_with_invalid_type_fails() {
    let node = spawn_node().await;
    let err = node
        .orbit
        .create("first", "invalid-type", local())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidType(_)));
    assert_eq!(err.to_string(), "Invalid database type 'invalid-type'");
}

#[tokio::test]
async fn create_with_address_instead_of_name_fails() {
    let node = spawn_node().await;
    let err = node
        .orbit
        .create(
            "/orbitdb/Qmc9PMho3LwTXSaUXJ8WjeBZyXesAwUofdkGeadFXsqMzW/first",
            "feed",
            local(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NameIsAddress));
}

#[tokio::test]
async fn create_twice_fails_without_overwrite() {
    let node = spawn_node().await;
    node.orbit.create("first", "feed", local()).await.unwrap();
    let err = node
        .orbit
        .create("first", "feed", local())
        .await
        .unwrap_err();
    match err {
        Error::AlreadyExists(address) => {
            assert!(address.to_string().starts_with("/orbitdb/"))
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn opening_with_the_wrong_type_fails() {
    let node = spawn_node().await;
    let kv = node.orbit.kvstore("settings", local()).await.unwrap();
    let address = kv.address().to_string();
    let err = node.orbit.log(&address, local()).await.unwrap_err();
    match &err {
        Error::TypeMismatch {
            actual, requested, ..
        } => {
            assert_eq!(actual, "keyvalue");
            assert_eq!(requested, "eventlog");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err.to_string().contains("keyvalue"));
    assert!(err.to_string().contains("eventlog"));
}

#[tokio::test]
async fn create_writes_manifest_and_cache_entry() {
    let node = spawn_node().await;
    let store = node.orbit.feed("second", local()).await.unwrap();
    let address = store.address().clone();
    assert!(address.to_string().starts_with("/orbitdb/"));

    // The cache index entry maps <address>/_manifest to the root.
    let cache_dir = node._dir.path().join("peer-a").join("cache");
    let cache = node.storage.create_store(&cache_dir).await.unwrap();
    let recorded = cache
        .get(&format!("{address}/_manifest"))
        .await
        .unwrap()
        .expect("cache index entry missing");
    assert_eq!(recorded, address.root().to_string());

    let manifest = read_db_manifest(&node.objects, address.root()).await.unwrap();
    assert_eq!(manifest.name, "second");
    assert_eq!(manifest.db_type, "feed");
    assert!(manifest.access_controller.starts_with("/ipfs"));
}

#[tokio::test]
async fn legacy_cache_layout_is_migrated() {
    // Uses the redb storage adapter so the legacy fixture lives on disk
    // the way an old installation left it.
    let dir = tempfile::tempdir().unwrap();
    let objects = MemContentStore::new("peer-a");
    let orbit = OrbitDb::create_instance(
        Arc::new(objects.clone()),
        OrbitDbOptions {
            directory: Some(dir.path().to_path_buf()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let kv = orbit.kvstore("cache-schema-test", local()).await.unwrap();
    let address = kv.address().clone();
    kv.close().await.unwrap();

    // Seed a legacy per-database cache under <directory>/<root>/<name>.
    let legacy_dir = dir
        .path()
        .join(address.root().to_string())
        .join("cache-schema-test");
    let legacy = RedbStorage.create_store(&legacy_dir).await.unwrap();
    legacy
        .set("_manifest", &address.root().to_string())
        .await
        .unwrap();
    legacy
        .set("_snapshot", &json!({ "key": "value" }).to_string())
        .await
        .unwrap();
    legacy.close().await.unwrap();

    let kv = orbit
        .kvstore(
            "cache-schema-test",
            OpenOptions {
                replicate: Some(false),
                overwrite: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    kv.load().await.unwrap();
    assert_eq!(kv.get("key"), Some(json!("value")));
    assert_eq!(kv.address().root(), address.root());

    // Running the migration again must be a no-op.
    let kv2 = orbit
        .kvstore(
            "cache-schema-test",
            OpenOptions {
                replicate: Some(false),
                overwrite: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    kv2.load().await.unwrap();
    assert_eq!(kv2.get("key"), Some(json!("value")));
}

#[tokio::test]
async fn local_only_open_of_unknown_address_fails() {
    let node = spawn_node().await;
    let store = node.orbit.feed("second", local()).await.unwrap();
    let mut tampered = store.address().to_string();
    tampered.pop();
    tampered.push('X');
    let err = node
        .orbit
        .open(
            &tampered,
            OpenOptions {
                local_only: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFoundLocally(_)));
}

#[tokio::test]
async fn feed_appends_survive_reopen() {
    let node = spawn_node().await;
    let store = node
        .orbit
        .open(
            "ZZZ",
            OpenOptions {
                create: true,
                db_type: Some("feed".to_string()),
                replicate: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let address = store.address().to_string();
    let feed = node.orbit.feed(&address, local()).await.unwrap();
    feed.add("hello1").await.unwrap();
    feed.add("hello2").await.unwrap();

    let reopened = node.orbit.feed(&address, local()).await.unwrap();
    reopened.load().await.unwrap();
    let entries = reopened.iterator(IteratorOptions { limit: -1 });
    let payloads: Vec<&[u8]> = entries.iter().map(|e| e.payload.as_slice()).collect();
    assert_eq!(payloads, vec![&b"hello1"[..], &b"hello2"[..]]);
}

#[tokio::test]
async fn open_of_a_name_requires_create_and_type() {
    let node = spawn_node().await;
    let err = node
        .orbit
        .open("plain-name", OpenOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CreateNotSet));

    let err = node
        .orbit
        .open(
            "plain-name",
            OpenOptions {
                create: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    match &err {
        Error::TypeMissing(tags) => {
            for tag in ["counter", "docstore", "eventlog", "feed", "keyvalue"] {
                assert!(tags.contains(tag), "'{tag}' missing from: {tags}");
            }
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn determine_address_matches_create_without_side_effects() {
    let node = spawn_node().await;
    let determined = node
        .orbit
        .determine_address("same", "feed", &local())
        .await
        .unwrap();
    // Neither the manifest nor the cache index entry was written.
    assert!(!node.objects.contains(determined.root()));
    let cache_dir = node._dir.path().join("peer-a").join("cache");
    let cache = node.storage.create_store(&cache_dir).await.unwrap();
    assert_eq!(
        cache
            .get(&format!("{determined}/_manifest"))
            .await
            .unwrap(),
        None
    );

    let store = node.orbit.create("same", "feed", local()).await.unwrap();
    assert_eq!(store.address(), &determined);
    assert!(node.objects.contains(determined.root()));
}

#[tokio::test]
async fn live_store_map_tracks_open_and_close() {
    let node = spawn_node().await;
    let one = node.orbit.feed("one", local()).await.unwrap();
    let two = node.orbit.feed("two", local()).await.unwrap();
    assert_eq!(node.orbit.stores().len(), 2);

    // A second open of the same address yields a separate handle but a
    // single registration.
    let again = node
        .orbit
        .feed(&two.address().to_string(), local())
        .await
        .unwrap();
    assert_eq!(node.orbit.stores().len(), 2);
    assert_eq!(again.address(), two.address());

    one.close().await.unwrap();
    assert_eq!(node.orbit.stores().len(), 1);
    one.close().await.unwrap();
    assert_eq!(node.orbit.stores().len(), 1);

    node.orbit.stop().await.unwrap();
    assert!(node.orbit.stores().is_empty());
}

#[tokio::test]
async fn stop_with_nothing_open_is_safe() {
    let node = spawn_node().await;
    node.orbit.stop().await.unwrap();
    node.orbit.stop().await.unwrap();
}

#[tokio::test]
async fn manifest_defaults_merge_only_on_request() {
    let node = spawn_node().await;
    let mut defaults = BTreeMap::new();
    defaults.insert("indexBy".to_string(), Ipld::String("name".to_string()));
    let store = node
        .orbit
        .docstore(
            "people",
            OpenOptions {
                defaults: Some(defaults),
                replicate: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let address = store.address().to_string();

    let unmerged = node.orbit.docs(&address, local()).await.unwrap();
    assert!(unmerged.options().extra.get("indexBy").is_none());

    let merged = node
        .orbit
        .docs(
            &address,
            OpenOptions {
                merge_defaults: true,
                replicate: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        merged.options().extra.get("indexBy"),
        Some(&Ipld::String("name".to_string()))
    );
    // Caller options win over manifest defaults.
    let mut extra = BTreeMap::new();
    extra.insert("indexBy".to_string(), Ipld::String("id".to_string()));
    let overridden = node
        .orbit
        .docs(
            &address,
            OpenOptions {
                merge_defaults: true,
                extra,
                replicate: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        overridden.options().extra.get("indexBy"),
        Some(&Ipld::String("id".to_string()))
    );
}

#[tokio::test]
async fn caches_are_shared_per_directory() {
    let node = spawn_node().await;
    let side_dir = node._dir.path().join("side");
    let opts = OpenOptions {
        directory: Some(side_dir.clone()),
        replicate: Some(false),
        ..Default::default()
    };
    let store = node.orbit.feed("aside", opts.clone()).await.unwrap();
    let address = store.address().to_string();

    // The caller-supplied directory holds the cache entry, not the default.
    let side_cache = node.storage.create_store(&side_dir).await.unwrap();
    assert!(side_cache
        .get(&format!("{address}/_manifest"))
        .await
        .unwrap()
        .is_some());
    let default_cache = node
        .storage
        .create_store(&node._dir.path().join("peer-a").join("cache"))
        .await
        .unwrap();
    assert!(default_cache
        .get(&format!("{address}/_manifest"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn default_writer_is_the_controller_identity() {
    let node = spawn_node().await;
    // A read list alone does not displace the default write list.
    let store = node
        .orbit
        .feed(
            "guarded",
            OpenOptions {
                access_controller: Some(AccessControllerSpec {
                    read: Some(vec!["someone".to_string()]),
                    ..Default::default()
                }),
                replicate: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    store.add("mine").await.unwrap();
    let ac = store.options().access_controller.clone().unwrap();
    assert_eq!(ac.write_keys(), &[node.orbit.identity().id().to_string()]);
}
