//! Replication between two controllers over the in-memory overlay.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{prelude::*, EnvFilter};

use orbitdb::access::AccessControllerSpec;
use orbitdb::{
    IteratorOptions, MemContentStore, MemNetwork, OpenOptions, OrbitDb, OrbitDbOptions, Store,
    StoreEvent,
};

fn setup_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

async fn spawn_node(
    objects: &MemContentStore,
    net: &MemNetwork,
    base: &Path,
    peer: &str,
) -> OrbitDb {
    OrbitDb::create_instance(
        Arc::new(objects.client(peer)),
        OrbitDbOptions {
            directory: Some(base.join(peer)),
            pubsub: Some(Arc::new(net.client(peer))),
            ..Default::default()
        },
    )
    .await
    .unwrap()
}

fn open_writable() -> OpenOptions {
    OpenOptions {
        access_controller: Some(AccessControllerSpec {
            write: Some(vec!["*".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within 10s");
}

#[tokio::test]
async fn head_exchange_syncs_a_fresh_replica() {
    setup_logging();
    let dir = tempfile::tempdir().unwrap();
    let objects = MemContentStore::new("net");
    let net = MemNetwork::new();
    let alice = spawn_node(&objects, &net, dir.path(), "alice").await;
    let bob = spawn_node(&objects, &net, dir.path(), "bob").await;

    let log_a = alice.eventlog("chat", open_writable()).await.unwrap();
    log_a.add("hello1").await.unwrap();
    log_a.add("hello2").await.unwrap();

    // Bob joins after the fact; the head exchange plus ancestor fetch
    // brings him up to date.
    let log_b = bob
        .log(&log_a.address().to_string(), OpenOptions::default())
        .await
        .unwrap();
    let probe = log_b.clone();
    eventually(move || probe.iterator(IteratorOptions { limit: -1 }).len() == 2).await;
    let payloads: Vec<Vec<u8>> = log_b
        .iterator(IteratorOptions { limit: -1 })
        .into_iter()
        .map(|e| e.payload)
        .collect();
    assert_eq!(payloads, vec![b"hello1".to_vec(), b"hello2".to_vec()]);

    alice.stop().await.unwrap();
    bob.stop().await.unwrap();
}

#[tokio::test]
async fn live_appends_flow_both_ways() {
    setup_logging();
    let dir = tempfile::tempdir().unwrap();
    let objects = MemContentStore::new("net");
    let net = MemNetwork::new();
    let alice = spawn_node(&objects, &net, dir.path(), "alice").await;
    let bob = spawn_node(&objects, &net, dir.path(), "bob").await;

    let log_a = alice.eventlog("chat", open_writable()).await.unwrap();
    let mut events_a = log_a.events().subscribe();
    log_a.add("hello1").await.unwrap();

    let log_b = bob
        .log(&log_a.address().to_string(), OpenOptions::default())
        .await
        .unwrap();
    let probe = log_b.clone();
    eventually(move || probe.iterator(IteratorOptions { limit: -1 }).len() == 1).await;

    // The handshake surfaced as a peer event on Alice's store.
    let peer_event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events_a.recv().await.unwrap() {
                StoreEvent::Peer { peer, .. } => break peer,
                _ => continue,
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(peer_event.as_str(), "bob");

    // The manifest grants everyone write access, so Bob's appends
    // replicate back to Alice over the topic.
    log_b.add("hello2").await.unwrap();
    let probe = log_a.clone();
    eventually(move || probe.iterator(IteratorOptions { limit: -1 }).len() == 2).await;

    alice.stop().await.unwrap();
    bob.stop().await.unwrap();
}

#[tokio::test]
async fn replicate_false_stays_off_the_overlay() {
    setup_logging();
    let dir = tempfile::tempdir().unwrap();
    let objects = MemContentStore::new("net");
    let net = MemNetwork::new();
    let alice = spawn_node(&objects, &net, dir.path(), "alice").await;

    let log = alice
        .eventlog(
            "private",
            OpenOptions {
                replicate: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    log.add("secret").await.unwrap();
    assert!(net.topic_peers(&log.address().to_string()).is_empty());

    alice.stop().await.unwrap();
}
