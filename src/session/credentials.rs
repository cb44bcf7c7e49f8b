use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::{Arc, Mutex};

use crate::crypto::AdbPrivateKey;

/// Stream of stored keys. Each item is either a usable key or the error that
/// prevented loading it.
pub type KeyStream = BoxStream<'static, Result<AdbPrivateKey>>;

/// Source of private keys for authentication.
///
/// Implementations own key storage; the authentication processor only pulls
/// keys one at a time and asks for a new one when none are stored.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Create a new key, persisting it if the store supports that.
    async fn generate_key(&self) -> Result<AdbPrivateKey>;

    /// Iterate the stored keys in preference order.
    fn iterate_keys(&self) -> KeyStream;
}

/// In-process credential store.
///
/// Generated keys are kept and returned by later iterations.
#[derive(Default, Clone)]
pub struct MemoryCredentialStore {
    keys: Arc<Mutex<Vec<AdbPrivateKey>>>,
    name: Option<String>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys(keys: Vec<AdbPrivateKey>) -> Self {
        Self {
            keys: Arc::new(Mutex::new(keys)),
            name: None,
        }
    }

    /// Name attached to generated keys, usually `user@host`.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn add_key(&self, key: AdbPrivateKey) {
        if let Ok(mut keys) = self.keys.lock() {
            keys.push(key);
        }
    }

    pub fn len(&self) -> usize {
        self.keys.lock().map(|keys| keys.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn generate_key(&self) -> Result<AdbPrivateKey> {
        let key = tokio::task::spawn_blocking(AdbPrivateKey::generate)
            .await
            .context("key generation task failed")??;
        let key = match &self.name {
            Some(name) => key.with_name(name.clone()),
            None => key,
        };
        self.add_key(key.clone());
        tracing::info!(fingerprint = %key.fingerprint(), "Generated new ADB key");
        Ok(key)
    }

    fn iterate_keys(&self) -> KeyStream {
        let snapshot = self
            .keys
            .lock()
            .map(|keys| keys.clone())
            .unwrap_or_default();
        stream::iter(snapshot.into_iter().map(Ok)).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PKCS8: &[u8] = include_bytes!("../../tests/fixtures/adbkey.der");

    #[tokio::test]
    async fn test_iterate_snapshot() {
        let key = AdbPrivateKey::from_der(PKCS8).unwrap();
        let store = MemoryCredentialStore::with_keys(vec![key.clone()]);

        let keys: Vec<_> = store.iterate_keys().collect().await;
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].as_ref().unwrap(), &key);

        store.add_key(key);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_store() {
        let store = MemoryCredentialStore::new();
        assert!(store.is_empty());
        assert!(store.iterate_keys().next().await.is_none());
    }
}
