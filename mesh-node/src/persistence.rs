//! Disk persistence for state that must survive a restart: the node's
//! identity key and the DHT's replicated records.

use std::path::Path;

use mesh_crypto::{KeyPair, PrivateKey};
use mesh_net::dht::DhtRecord;
use tracing::info;

use crate::error::NodeError;

const IDENTITY_FILE: &str = "identity.key";

/// Loads the identity key from `data_dir/identity.key`, generating and
/// persisting a fresh one on first run.
pub async fn load_or_generate_identity(data_dir: &Path) -> Result<KeyPair, NodeError> {
    let path = data_dir.join(IDENTITY_FILE);
    if path.exists() {
        let bytes = tokio::fs::read(&path).await?;
        let private = PrivateKey::from_bytes(&bytes)
            .map_err(|e| NodeError::Config(format!("loading identity key: {e}")))?;
        return Ok(KeyPair::from_private(private));
    }

    info!(path = %path.display(), "no identity key found, generating one");
    let key_pair = mesh_crypto::generate();
    tokio::fs::write(&path, key_pair.private().as_bytes()).await?;
    Ok(key_pair)
}

/// Reads a bincode-encoded DHT snapshot, if one exists.
pub async fn load_dht_snapshot(path: &Path) -> Result<Option<Vec<DhtRecord>>, NodeError> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = tokio::fs::read(path).await?;
    let records: Vec<DhtRecord> = bincode::deserialize(&bytes)
        .map_err(|e| NodeError::Config(format!("decoding DHT snapshot: {e}")))?;
    Ok(Some(records))
}

pub async fn save_dht_snapshot(path: &Path, records: &[DhtRecord]) -> Result<(), NodeError> {
    let bytes = bincode::serialize(records)
        .map_err(|e| NodeError::Config(format!("encoding DHT snapshot: {e}")))?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generates_and_then_reloads_the_same_identity() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_generate_identity(dir.path()).await.unwrap();
        let second = load_or_generate_identity(dir.path()).await.unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
    }

    #[tokio::test]
    async fn dht_snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.bin");
        assert!(load_dht_snapshot(&path).await.unwrap().is_none());

        let records = vec![DhtRecord {
            key: [1u8; 20],
            value: b"v".to_vec(),
            stored_at: 0,
            ttl_secs: 3600,
        }];
        save_dht_snapshot(&path, &records).await.unwrap();
        let loaded = load_dht_snapshot(&path).await.unwrap().unwrap();
        assert_eq!(loaded, records);
    }
}
