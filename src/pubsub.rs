//! The publish/subscribe overlay and direct channels.
//!
//! The controller binds each replicated store to a pubsub topic named by
//! the database address: local appends are broadcast on the topic, inbound
//! messages are merged, and newly-observed peers trigger a head-exchange
//! handshake over a direct channel. The overlay is consumed through the
//! [`PubSub`] trait; [`MemNetwork`] is an in-process implementation used
//! for tests and embedding.
//!
//! Delivery to one subscriber is ordered: messages and peer events are
//! queued per subscriber and handed to the callbacks sequentially.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::content::PeerId;
use crate::error::Result;

/// Callback invoked with each message on a subscribed topic.
pub type MessageCallback = Arc<dyn Fn(String, Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback invoked when a new peer appears on a subscribed topic.
pub type PeerCallback = Arc<dyn Fn(String, PeerId) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback invoked with each message received on a direct channel.
pub type ChannelMessageCallback =
    Arc<dyn Fn(PeerId, Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

/// Client to the publish/subscribe overlay.
#[async_trait]
pub trait PubSub: Send + Sync + 'static {
    /// Subscribe to `topic`, delivering messages and peer arrivals to the
    /// given callbacks. Subscribing twice to the same topic is a no-op.
    async fn subscribe(
        &self,
        topic: &str,
        on_message: MessageCallback,
        on_peer_connected: PeerCallback,
    ) -> Result<()>;

    /// Drop the subscription for `topic`.
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Broadcast `data` to the other subscribers of `topic`.
    async fn publish(&self, topic: &str, data: Bytes) -> Result<()>;

    /// Open a direct bidirectional channel to `peer`.
    ///
    /// Inbound channel messages are handed to `on_message`. The returned
    /// channel must be [`connect`](DirectChannel::connect)ed before use.
    async fn open_channel(
        &self,
        peer: &PeerId,
        on_message: ChannelMessageCallback,
    ) -> Result<Arc<dyn DirectChannel>>;

    /// Leave every topic and close the overlay connection.
    async fn disconnect(&self) -> Result<()>;
}

/// A peer-to-peer bidirectional link, cached by peer id.
#[async_trait]
pub trait DirectChannel: Send + Sync + 'static {
    /// The remote peer.
    fn peer(&self) -> &PeerId;

    /// Wait until both ends of the channel are open.
    async fn connect(&self) -> Result<()>;

    /// Send `data` to the remote end.
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Close this end of the channel.
    async fn close(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory overlay
// ---------------------------------------------------------------------------

enum TopicDelivery {
    Message(String, Bytes),
    PeerJoined(String, PeerId),
}

struct TopicEnd {
    deliveries: mpsc::UnboundedSender<TopicDelivery>,
}

type ChannelKey = (PeerId, PeerId);

fn channel_key(a: &PeerId, b: &PeerId) -> ChannelKey {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

#[derive(Default)]
struct ChannelState {
    ends: HashMap<PeerId, mpsc::UnboundedSender<(PeerId, Bytes)>>,
    both_open: Arc<tokio::sync::Notify>,
}

#[derive(Default)]
struct NetInner {
    topics: Mutex<HashMap<String, BTreeMap<PeerId, TopicEnd>>>,
    channels: Mutex<HashMap<ChannelKey, ChannelState>>,
}

/// In-process pubsub overlay shared between clients.
///
/// Every [`client`](MemNetwork::client) is a peer on the same overlay;
/// subscribing to a topic makes the peer visible to the topic's other
/// subscribers, and publishing fans out to everyone but the sender.
#[derive(Clone, Default)]
pub struct MemNetwork {
    inner: Arc<NetInner>,
}

impl MemNetwork {
    /// A fresh overlay with no peers.
    pub fn new() -> Self {
        Self::default()
    }

    /// A client on this overlay identified by `peer_id`.
    pub fn client(&self, peer_id: impl Into<PeerId>) -> MemPubSub {
        MemPubSub {
            inner: self.inner.clone(),
            peer_id: peer_id.into(),
            disconnected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Peers currently subscribed to `topic`.
    pub fn topic_peers(&self, topic: &str) -> Vec<PeerId> {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map(|subs| subs.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl fmt::Debug for MemNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemNetwork")
            .field("topics", &self.inner.topics.lock().len())
            .finish()
    }
}

/// One peer's client to a [`MemNetwork`].
#[derive(Clone)]
pub struct MemPubSub {
    inner: Arc<NetInner>,
    peer_id: PeerId,
    disconnected: Arc<AtomicBool>,
}

impl MemPubSub {
    fn ensure_connected(&self) -> Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(anyhow!("pubsub client '{}' is disconnected", self.peer_id).into());
        }
        Ok(())
    }
}

impl fmt::Debug for MemPubSub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemPubSub")
            .field("peer_id", &self.peer_id)
            .finish()
    }
}

#[async_trait]
impl PubSub for MemPubSub {
    async fn subscribe(
        &self,
        topic: &str,
        on_message: MessageCallback,
        on_peer_connected: PeerCallback,
    ) -> Result<()> {
        self.ensure_connected()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let my_end = tx.clone();
        let others: Vec<(PeerId, mpsc::UnboundedSender<TopicDelivery>)> = {
            let mut topics = self.inner.topics.lock();
            let subs = topics.entry(topic.to_string()).or_default();
            if subs.contains_key(&self.peer_id) {
                return Ok(());
            }
            let others = subs
                .iter()
                .map(|(peer, end)| (peer.clone(), end.deliveries.clone()))
                .collect();
            subs.insert(self.peer_id.clone(), TopicEnd { deliveries: tx });
            others
        };

        // Sequential pump so one subscriber sees deliveries in order.
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                match delivery {
                    TopicDelivery::Message(topic, data) => on_message(topic, data).await,
                    TopicDelivery::PeerJoined(topic, peer) => on_peer_connected(topic, peer).await,
                }
            }
        });

        // Both sides learn about each other: existing subscribers see the
        // newcomer, the newcomer sees each of them.
        for (peer, end) in others {
            end.send(TopicDelivery::PeerJoined(
                topic.to_string(),
                self.peer_id.clone(),
            ))
            .ok();
            my_end
                .send(TopicDelivery::PeerJoined(topic.to_string(), peer))
                .ok();
        }
        debug!(peer = %self.peer_id, topic, "subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let mut topics = self.inner.topics.lock();
        if let Some(subs) = topics.get_mut(topic) {
            subs.remove(&self.peer_id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Bytes) -> Result<()> {
        self.ensure_connected()?;
        let targets: Vec<mpsc::UnboundedSender<TopicDelivery>> = {
            let topics = self.inner.topics.lock();
            match topics.get(topic) {
                Some(subs) => subs
                    .iter()
                    .filter(|(peer, _)| **peer != self.peer_id)
                    .map(|(_, end)| end.deliveries.clone())
                    .collect(),
                None => Vec::new(),
            }
        };
        for end in targets {
            end.send(TopicDelivery::Message(topic.to_string(), data.clone()))
                .ok();
        }
        Ok(())
    }

    async fn open_channel(
        &self,
        peer: &PeerId,
        on_message: ChannelMessageCallback,
    ) -> Result<Arc<dyn DirectChannel>> {
        self.ensure_connected()?;
        let key = channel_key(&self.peer_id, peer);
        let (tx, mut rx) = mpsc::unbounded_channel::<(PeerId, Bytes)>();
        {
            let mut channels = self.inner.channels.lock();
            let state = channels.entry(key.clone()).or_default();
            state.ends.insert(self.peer_id.clone(), tx);
            state.both_open.notify_waiters();
        }
        tokio::spawn(async move {
            while let Some((from, data)) = rx.recv().await {
                on_message(from, data).await;
            }
        });
        Ok(Arc::new(MemDirectChannel {
            inner: self.inner.clone(),
            key,
            local: self.peer_id.clone(),
            remote: peer.clone(),
        }))
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        let mut topics = self.inner.topics.lock();
        topics.retain(|_, subs| {
            subs.remove(&self.peer_id);
            !subs.is_empty()
        });
        drop(topics);
        let mut channels = self.inner.channels.lock();
        channels.retain(|_, state| {
            state.ends.remove(&self.peer_id);
            !state.ends.is_empty()
        });
        Ok(())
    }
}

/// Direct channel between two peers on a [`MemNetwork`].
pub struct MemDirectChannel {
    inner: Arc<NetInner>,
    key: ChannelKey,
    local: PeerId,
    remote: PeerId,
}

impl fmt::Debug for MemDirectChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemDirectChannel")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish()
    }
}

#[async_trait]
impl DirectChannel for MemDirectChannel {
    fn peer(&self) -> &PeerId {
        &self.remote
    }

    async fn connect(&self) -> Result<()> {
        loop {
            let notify = {
                let channels = self.inner.channels.lock();
                let state = channels
                    .get(&self.key)
                    .ok_or_else(|| anyhow!("channel to '{}' was closed", self.remote))?;
                if state.ends.len() == 2 {
                    return Ok(());
                }
                state.both_open.clone()
            };
            let notified = notify.notified();
            // The other end may have registered between the check and here;
            // re-check before waiting.
            {
                let channels = self.inner.channels.lock();
                if let Some(state) = channels.get(&self.key) {
                    if state.ends.len() == 2 {
                        return Ok(());
                    }
                }
            }
            notified.await;
        }
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let end = {
            let channels = self.inner.channels.lock();
            channels
                .get(&self.key)
                .and_then(|state| state.ends.get(&self.remote).cloned())
        };
        let end = end.ok_or_else(|| anyhow!("channel to '{}' is not open", self.remote))?;
        end.send((self.local.clone(), data))
            .map_err(|_| anyhow!("channel to '{}' is gone", self.remote))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut channels = self.inner.channels.lock();
        if let Some(state) = channels.get_mut(&self.key) {
            state.ends.remove(&self.local);
            if state.ends.is_empty() {
                channels.remove(&self.key);
            }
        }
        Ok(())
    }
}
