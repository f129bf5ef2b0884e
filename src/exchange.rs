//! Head exchange between replicas.
//!
//! Topic broadcasts and direct channels carry the same message encoding:
//! a head-set announcement for one database address. On a new peer, the
//! controller opens (or reuses) a direct channel and sends its current
//! heads; the remote side merges them through the same path as topic
//! messages.

use anyhow::Context;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address::Address;
use crate::error::Result;
use crate::pubsub::DirectChannel;
use crate::store::Entry;

/// Messages carried on the overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Message {
    /// The sender's current head set for a database.
    Heads {
        /// Address string of the database.
        address: String,
        /// Current head entries.
        heads: Vec<Entry>,
    },
}

pub(crate) fn encode_heads(address: &Address, heads: &[Entry]) -> Result<Bytes> {
    let msg = Message::Heads {
        address: address.to_string(),
        heads: heads.to_vec(),
    };
    let bytes = postcard::to_stdvec(&msg).context("failed to encode head announcement")?;
    Ok(bytes.into())
}

pub(crate) fn decode_message(bytes: &[u8]) -> Result<Message> {
    let msg = postcard::from_bytes(bytes).context("failed to decode overlay message")?;
    Ok(msg)
}

/// How long to wait for the remote end of a direct channel to open.
/// Handshakes run on the subscription dispatch path, so a peer that never
/// answers must not wedge it.
const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Run our half of the head-exchange handshake on `channel`.
///
/// Connects first so the announcement is not lost while the remote end is
/// still opening its side of the channel.
pub(crate) async fn exchange_heads(
    channel: &dyn DirectChannel,
    address: &Address,
    heads: &[Entry],
) -> Result<()> {
    tokio::time::timeout(CONNECT_TIMEOUT, channel.connect())
        .await
        .map_err(|_| anyhow::anyhow!("timed out connecting to '{}'", channel.peer()))??;
    debug!(%address, peer = %channel.peer(), heads = heads.len(), "head exchange: send");
    let data = encode_heads(address, heads)?;
    channel.send(data).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heads_roundtrip() {
        let entry = Entry::sample("payload");
        let address = format!("/orbitdb/{}/db", entry.hash);
        let msg = Message::Heads {
            address,
            heads: vec![entry],
        };
        let bytes = postcard::to_stdvec(&msg).unwrap();
        let Message::Heads { heads, .. } = decode_message(&bytes).unwrap();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].payload, b"payload");
    }
}
