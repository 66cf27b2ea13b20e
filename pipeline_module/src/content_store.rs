//! Content-addressed storage for raw inbound payloads.
//!
//! A payload is serialized to canonical JSON (sorted keys, two-space
//! indent), hashed with SHA-256, and written to
//! `{root}/{d[0..4]}/{d[4..8]}/{d}.json`. Writing the same content twice
//! produces the same digest and the same bytes, so concurrent writers never
//! need to coordinate.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::RawEmail;

const SHARD_WIDTH: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ContentStoreError {
    #[error("invalid content digest: {0:?}")]
    InvalidDigest(String),
    #[error("no stored payload for digest {0}")]
    NotFound(String),
    #[error("stored payload {digest} is corrupt: {source}")]
    Corrupt {
        digest: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("content store io error: {0}")]
    Io(#[from] io::Error),
}

/// Renders a payload as canonical JSON without ever failing.
///
/// When the payload as a whole cannot be serialized, each field is tried on
/// its own and the ones that still fail are replaced by their `Debug`
/// rendering.
pub fn canonical_json<V>(payload: &BTreeMap<String, V>) -> String
where
    V: Serialize + fmt::Debug,
{
    if let Ok(text) = serde_json::to_string_pretty(payload) {
        return text;
    }

    let mut encodable = serde_json::Map::new();
    for (key, item) in payload {
        let value = match serde_json::to_value(item) {
            Ok(value) => value,
            Err(err) => {
                debug!("stringifying unserializable field {}: {}", key, err);
                Value::String(format!("{:?}", item))
            }
        };
        encodable.insert(key.clone(), value);
    }
    // A map of plain `Value`s always serializes.
    serde_json::to_string_pretty(&encodable).unwrap_or_else(|_| "{}".to_string())
}

pub fn digest_of(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

pub(crate) fn validate_digest(digest: &str) -> Result<(), ContentStoreError> {
    let valid = digest.len() >= SHARD_WIDTH * 2
        && digest.chars().all(|ch| ch.is_ascii_hexdigit());
    if valid {
        Ok(())
    } else {
        Err(ContentStoreError::InvalidDigest(digest.to_string()))
    }
}

fn relative_json_path(digest: &str) -> PathBuf {
    PathBuf::from(&digest[0..SHARD_WIDTH])
        .join(&digest[SHARD_WIDTH..SHARD_WIDTH * 2])
        .join(format!("{}.json", digest))
}

/// Readers see either no file or the complete one, never a partial write.
async fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension(format!("json.{:016x}.tmp", rand::random::<u64>()));
    tokio::fs::write(&tmp_path, bytes).await?;
    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, digest: &str) -> Result<PathBuf, ContentStoreError> {
        validate_digest(digest)?;
        Ok(self.root.join(relative_json_path(digest)))
    }

    /// Stores the payload and returns its digest.
    pub async fn put<V>(&self, payload: &BTreeMap<String, V>) -> Result<String, ContentStoreError>
    where
        V: Serialize + fmt::Debug,
    {
        let text = canonical_json(payload);
        let digest = digest_of(&text);
        let path = self.path_for(&digest)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomically(&path, text.as_bytes()).await?;
        debug!("stored payload {} at {}", digest, path.display());
        Ok(digest)
    }

    pub async fn get(&self, digest: &str) -> Result<RawEmail, ContentStoreError> {
        let path = self.path_for(digest)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ContentStoreError::NotFound(digest.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&bytes).map_err(|source| ContentStoreError::Corrupt {
            digest: digest.to_string(),
            source,
        })
    }
}
