//! Identities and the file-backed keystore.
//!
//! Every entry a store appends is signed by the controller's identity. The
//! keystore owns the signing keys, one ed25519 key per label, persisted
//! under the keystore directory and created on demand.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::Result;

/// File-backed store of signing keys.
///
/// Keys are created lazily: asking for a label that has no key yet
/// generates one and persists it. The handle is cheap to clone.
#[derive(Debug, Clone)]
pub struct Keystore {
    inner: Arc<KeystoreInner>,
}

#[derive(Debug)]
struct KeystoreInner {
    directory: PathBuf,
    keys: parking_lot::Mutex<HashMap<String, SigningKey>>,
    closed: AtomicBool,
}

impl Keystore {
    /// Open (creating if needed) a keystore rooted at `directory`.
    pub async fn open(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory)
            .await
            .with_context(|| format!("failed to create keystore at {}", directory.display()))?;
        Ok(Self {
            inner: Arc::new(KeystoreInner {
                directory,
                keys: Default::default(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Load the key for `label`, generating and persisting one if absent.
    pub async fn key(&self, label: &str) -> Result<SigningKey> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(anyhow!("keystore is closed").into());
        }
        if let Some(key) = self.inner.keys.lock().get(label) {
            return Ok(key.clone());
        }
        let path = self.key_path(label);
        let key = if path.exists() {
            let encoded = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read key file {}", path.display()))?;
            let bytes: [u8; 32] = hex::decode(encoded.trim())
                .context("invalid key file")?
                .try_into()
                .map_err(|_| anyhow!("invalid key length in {}", path.display()))?;
            SigningKey::from_bytes(&bytes)
        } else {
            let key = SigningKey::generate(&mut OsRng);
            // Write-then-rename so a crash cannot leave a torn key file.
            let tmp = path.with_extension("tmp");
            tokio::fs::write(&tmp, hex::encode(key.to_bytes()))
                .await
                .context("unable to write key file")?;
            tokio::fs::rename(&tmp, &path)
                .await
                .context("failed to move key file into place")?;
            key
        };
        self.inner.keys.lock().insert(label.to_string(), key.clone());
        Ok(key)
    }

    /// Close the keystore. Further key requests fail.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.keys.lock().clear();
    }

    fn key_path(&self, label: &str) -> PathBuf {
        // Labels are peer ids or caller-chosen names; hex-encode so any
        // label maps to a portable file name.
        self.inner.directory.join(format!("{}.key", hex::encode(label)))
    }

    /// Root directory of this keystore.
    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }
}

/// A signing identity bound to a keystore key.
///
/// `id` is the stable public identifier (hex of the verifying key) that
/// appears in access-controller write lists and on signed entries.
#[derive(Debug, Clone)]
pub struct Identity {
    id: String,
    public_key: VerifyingKey,
    signing_key: Arc<SigningKey>,
}

impl Identity {
    /// Stable public id of this identity.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Verifying half of the identity key.
    pub fn public_key(&self) -> &VerifyingKey {
        &self.public_key
    }

    /// Sign a message with the identity key.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }

    /// Verify a signature against an identity id (hex verifying key).
    pub fn verify(id: &str, msg: &[u8], signature: &Signature) -> Result<()> {
        let bytes: [u8; 32] = hex::decode(id)
            .context("identity id is not hex")?
            .try_into()
            .map_err(|_| anyhow!("identity id has wrong length"))?;
        let key = VerifyingKey::from_bytes(&bytes).context("invalid identity key")?;
        key.verify_strict(msg, signature)
            .context("signature verification failed")?;
        Ok(())
    }
}

/// Source of identities for a controller.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Create (or load) the identity labelled `id` in `keystore`.
    async fn create_identity(&self, id: &str, keystore: &Keystore) -> Result<Identity>;
}

/// Default provider: one ed25519 key per label, id is the hex public key.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultIdentityProvider;

#[async_trait]
impl IdentityProvider for DefaultIdentityProvider {
    async fn create_identity(&self, id: &str, keystore: &Keystore) -> Result<Identity> {
        let signing_key = keystore.key(id).await?;
        let public_key = signing_key.verifying_key();
        Ok(Identity {
            id: hex::encode(public_key.to_bytes()),
            public_key,
            signing_key: Arc::new(signing_key),
        })
    }
}
