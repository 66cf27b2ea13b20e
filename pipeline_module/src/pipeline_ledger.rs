//! Pending-email ledger.
//!
//! One empty file per accepted-but-unfinished email, named by its digest.
//! Only existence matters: after an unclean shutdown the directory listing
//! is exactly the set of emails still owed a full run.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::content_store::{validate_digest, ContentStoreError};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid marker digest: {0:?}")]
    InvalidDigest(String),
    #[error("no pending marker for digest {0}")]
    NotPending(String),
    #[error("pipeline ledger io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct PipelineLedger {
    dir: PathBuf,
}

impl PipelineLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, digest: &str) -> Result<PathBuf, LedgerError> {
        validate_digest(digest).map_err(|err| match err {
            ContentStoreError::InvalidDigest(value) => LedgerError::InvalidDigest(value),
            other => LedgerError::InvalidDigest(other.to_string()),
        })?;
        Ok(self.dir.join(digest))
    }

    pub async fn mark(&self, digest: &str) -> Result<(), LedgerError> {
        let path = self.path_for(digest)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::File::create(&path).await?;
        debug!("marked {} pending", digest);
        Ok(())
    }

    /// Clears a marker. Clearing one that is not there is an error.
    pub async fn unmark(&self, digest: &str) -> Result<(), LedgerError> {
        let path = self.path_for(digest)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("cleared pending marker {}", digest);
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(LedgerError::NotPending(digest.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn is_pending(&self, digest: &str) -> Result<bool, LedgerError> {
        let path = self.path_for(digest)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    /// Digests with a marker. Files whose names are not digests are skipped.
    pub async fn list_pending(&self) -> Result<Vec<String>, LedgerError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut pending = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_digest(&name).is_err() {
                if !name.starts_with('.') {
                    warn!("ignoring stray file in pipeline ledger: {}", name);
                }
                continue;
            }
            pending.push(name);
        }
        Ok(pending)
    }
}
