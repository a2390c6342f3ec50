//! What a node remembers across restarts
//!
//! Feeds themselves live in the feed store; this file only records which
//! feeds make up which spaces and the secrets the keyring holds.

use std::path::PathBuf;

use common::crypto::{Keyring, PublicKey, SecretKey};
use serde::{Deserialize, Serialize};

use crate::error::NodeError;

/// A space this node has joined, and the feed it writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceRecord {
    pub space_key: PublicKey,
    pub genesis_feed: PublicKey,
    pub feed_key: PublicKey,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// The identity space; its space key is the identity key
    #[serde(default)]
    pub identity: Option<SpaceRecord>,
    #[serde(default)]
    pub spaces: Vec<SpaceRecord>,
    /// Hex secrets of every key in the keyring except the device key
    #[serde(default)]
    pub secrets: Vec<String>,
}

impl Metadata {
    pub fn space(&self, space_key: &PublicKey) -> Option<&SpaceRecord> {
        self.spaces.iter().find(|record| record.space_key == *space_key)
    }

    /// Snapshot the keyring's secrets, leaving out `device`
    pub fn capture_secrets(&mut self, keyring: &Keyring, device: &PublicKey) {
        let mut keys = keyring.public_keys();
        keys.sort();
        self.secrets = keys
            .iter()
            .filter(|key| *key != device)
            .filter_map(|key| keyring.get(key))
            .map(|secret| secret.to_hex())
            .collect();
    }

    pub fn restore_secrets(&self, keyring: &Keyring) -> Result<(), NodeError> {
        for secret in &self.secrets {
            keyring.insert(SecretKey::from_hex(secret)?);
        }
        Ok(())
    }
}

/// JSON file holding [`Metadata`], or nothing for in-memory nodes
#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: Option<PathBuf>,
}

impl MetadataStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub async fn load(&self) -> Result<Metadata, NodeError> {
        let Some(path) = &self.path else {
            return Ok(Metadata::default());
        };
        match tokio::fs::read_to_string(path).await {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Metadata::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the file atomically
    pub async fn save(&self, metadata: &Metadata) -> Result<(), NodeError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, serde_json::to_vec_pretty(metadata)?).await?;
        tokio::fs::rename(&staging, path).await?;
        tracing::debug!("saved node metadata to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_metadata_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(Some(dir.path().join("metadata.json")));
        assert_eq!(store.load().await.unwrap(), Metadata::default());

        let keyring = Keyring::new();
        let device = keyring.generate();
        let feed = keyring.generate();
        let mut metadata = Metadata {
            identity: Some(SpaceRecord {
                space_key: keyring.generate(),
                genesis_feed: feed,
                feed_key: feed,
            }),
            ..Default::default()
        };
        metadata.capture_secrets(&keyring, &device);
        assert_eq!(metadata.secrets.len(), 2);
        store.save(&metadata).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, metadata);
        let restored = Keyring::new();
        loaded.restore_secrets(&restored).unwrap();
        assert!(restored.contains(&feed));
        assert!(!restored.contains(&device));
    }

    #[tokio::test]
    async fn test_in_memory_store_is_empty() {
        let store = MetadataStore::new(None);
        store.save(&Metadata::default()).await.unwrap();
        assert!(store.load().await.unwrap().spaces.is_empty());
    }
}
