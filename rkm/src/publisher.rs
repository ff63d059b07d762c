//! The published address record.
//!
//! The record is replaced by writing a temporary file next to it and renaming
//! it over the well-known path, so a reader sees either the old record or the
//! new one and never a torn write.

use std::fs::{self, DirBuilder};
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use common::{LogSinkTarget, NodeIdentity, PublishedAddress};
use tempfile::NamedTempFile;
use tracing::info;

#[derive(Debug, Clone)]
pub struct AddressPublisher {
    path: PathBuf,
}

impl AddressPublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        AddressPublisher { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the record with `identity` and `log_sink`, owned by the
    /// calling process.
    pub fn publish(
        &self,
        identity: &NodeIdentity,
        log_sink: Option<&LogSinkTarget>,
    ) -> Result<PublishedAddress> {
        let record = PublishedAddress {
            identity: identity.clone(),
            log_sink: log_sink.cloned(),
            pid: std::process::id(),
            published_at: Utc::now(),
        };
        self.replace(&record)?;
        info!(path = %self.path.display(), identity = %record.identity, "address published");
        Ok(record)
    }

    fn replace(&self, record: &PublishedAddress) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
        serde_json::to_writer_pretty(&mut tmp, record)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    /// Current record, or `None` when nothing has been published yet.
    pub fn read(&self) -> Result<Option<PublishedAddress>> {
        read_published(&self.path)
    }
}

pub fn read_published(path: &Path) -> Result<Option<PublishedAddress>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };
    let record = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse published address {}", path.display()))?;
    Ok(Some(record))
}
