//! Durable key-value persistence for bot and orchestrator state.
//!
//! Keys are relative paths under a configurable root. Writes are atomic:
//! content goes to a sibling temp file which is then renamed over the
//! target, so a reader observes either the previous or the new content,
//! never a partial write.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Current schema version stamped into every persisted record.
pub const STATE_SCHEMA_VERSION: u32 = 1;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Atomically replace the value under `key`.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Read the value under `key`, `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List keys directly under `prefix` (non-recursive).
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Envelope wrapping every persisted record with a schema version.
///
/// Records with an unrecognised version are rejected by the loader
/// rather than coerced; the caller discards state and starts fresh.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct VersionedRecord<T> {
    pub version: u32,
    #[serde(flatten)]
    pub record: T,
}

/// Serialize a record with the current schema version.
pub fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    let envelope = VersionedRecord {
        version: STATE_SCHEMA_VERSION,
        record,
    };
    serde_json::to_vec_pretty(&envelope).context("state record serialization failed")
}

/// Decode a record, rejecting unknown schema versions.
pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let envelope: VersionedRecord<T> =
        serde_json::from_slice(bytes).context("state record deserialization failed")?;
    if envelope.version != STATE_SCHEMA_VERSION {
        anyhow::bail!(
            "unrecognised state schema version {} (expected {})",
            envelope.version,
            STATE_SCHEMA_VERSION
        );
    }
    Ok(envelope.record)
}

/// Filesystem-backed store. One file per key under `root`.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let target = self.path_for(key);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating state dir {}", parent.display()))?;
        }

        let tmp = target.with_extension("tmp");
        tokio::fs::write(&tmp, &value)
            .await
            .with_context(|| format!("writing temp state file {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .with_context(|| format!("committing state file {}", target.display()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let target = self.path_for(key);
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading state file {}", target.display())),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let target = self.path_for(key);
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing state file {}", target.display())),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.path_for(prefix);
        let mut keys = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!("Skipping non-UTF8 state key under {prefix}");
                continue;
            };
            // Leftover temp files from an interrupted write are not state.
            if name.ends_with(".tmp") {
                continue;
            }
            if prefix.is_empty() {
                keys.push(name.to_string());
            } else {
                keys.push(format!("{}/{}", prefix.trim_end_matches('/'), name));
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Sample {
        symbol: String,
        count: u32,
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let record = Sample {
            symbol: "BTCUSDT".into(),
            count: 3,
        };
        store
            .put("bot_state_BTCUSDT.json", encode_record(&record).unwrap())
            .await
            .unwrap();

        let bytes = store.get("bot_state_BTCUSDT.json").await.unwrap().unwrap();
        let loaded: Sample = decode_record(&bytes).unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert!(store.get("nope.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_version_is_rejected() {
        let raw = br#"{"version": 99, "symbol": "BTCUSDT", "count": 1}"#;
        let result = decode_record::<Sample>(raw);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn list_skips_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.put("stop_loss/a.json", b"{}".to_vec()).await.unwrap();
        std::fs::write(dir.path().join("stop_loss/b.tmp"), b"partial").unwrap();

        let keys = store.list("stop_loss").await.unwrap();
        assert_eq!(keys, vec!["stop_loss/a.json".to_string()]);
    }
}
