//! Engines the coordinator activates roles with.
//!
//! The storage and worker engines themselves live elsewhere; the coordinator
//! only needs something that turns a directory into a storage root set and
//! something that turns the runtime into a worker. The `Fs*` and `Local*`
//! types are the engines the agent ships with.

use std::fmt::Debug;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::runtime::Handle;
use tracing::info;

/// Root of the storage objects hosted on this machine.
pub trait StorageRootSet: Debug + Send + Sync {
    fn directory(&self) -> &Path;

    /// Factory for new storage objects under this root.
    fn factory(self: Arc<Self>) -> Arc<dyn StorageFactory>;
}

pub trait StorageFactory: Debug + Send + Sync {
    fn root(&self) -> Arc<dyn StorageRootSet>;
}

pub trait StorageEngine: Send + Sync {
    /// Binds a storage root set to an existing directory.
    fn open(&self, directory: &Path) -> Result<Arc<dyn StorageRootSet>>;
}

pub trait Worker: Debug + Send + Sync {
    fn runtime(&self) -> &Handle;
}

pub trait WorkerEngine: Send + Sync {
    fn start(&self, runtime: &Handle) -> Result<Arc<dyn Worker>>;
}

#[derive(Debug)]
pub struct FsStorage {
    path: PathBuf,
    // Keeps the directory pinned for as long as the role lives.
    _dir: File,
}

impl StorageRootSet for FsStorage {
    fn directory(&self) -> &Path {
        &self.path
    }

    fn factory(self: Arc<Self>) -> Arc<dyn StorageFactory> {
        Arc::new(FsStorageFactory { root: self })
    }
}

#[derive(Debug)]
pub struct FsStorageFactory {
    root: Arc<FsStorage>,
}

impl StorageFactory for FsStorageFactory {
    fn root(&self) -> Arc<dyn StorageRootSet> {
        self.root.clone()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsStorageEngine;

impl StorageEngine for FsStorageEngine {
    fn open(&self, directory: &Path) -> Result<Arc<dyn StorageRootSet>> {
        let dir = File::open(directory)
            .with_context(|| format!("Failed to open storage directory {}", directory.display()))?;
        if !dir.metadata()?.is_dir() {
            bail!("storage path {} is not a directory", directory.display());
        }
        info!(path = %directory.display(), "storage root opened");
        Ok(Arc::new(FsStorage {
            path: directory.to_path_buf(),
            _dir: dir,
        }))
    }
}

#[derive(Debug)]
pub struct LocalWorker {
    runtime: Handle,
}

impl Worker for LocalWorker {
    fn runtime(&self) -> &Handle {
        &self.runtime
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalWorkerEngine;

impl WorkerEngine for LocalWorkerEngine {
    fn start(&self, runtime: &Handle) -> Result<Arc<dyn Worker>> {
        Ok(Arc::new(LocalWorker {
            runtime: runtime.clone(),
        }))
    }
}
