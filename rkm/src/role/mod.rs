//! Role activation.
//!
//! A controller turns a machine into a storage node, a worker, or both by
//! calling [`MachineCoordinator::become_storage`] and
//! [`MachineCoordinator::become_worker`]. Each role is built the first time
//! it is requested and cached for the rest of the process lifetime; later
//! requests (a reconnecting or retrying controller) get the very same bundle
//! back. A failed activation caches nothing, so the next request starts over.

pub mod engine;

use std::fmt;
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use common::{BackendSetKind, CapId, PeerBackend, StorageGrant, WorkerGrant};
use tokio::runtime::Handle;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::backend_set::BackendSet;
use engine::{
    FsStorageEngine, LocalWorkerEngine, StorageEngine, StorageFactory, StorageRootSet, Worker,
    WorkerEngine,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Storage,
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Storage => f.write_str("storage"),
            Role::Worker => f.write_str("worker"),
        }
    }
}

/// Another storage node, as seen by this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sibling(pub PeerBackend);

/// Resolver for persistent references to capabilities hosted on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedRestorer(pub PeerBackend);

/// Resolver for persistent references to externally visible capabilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayRestorer(pub PeerBackend);

macro_rules! peer_wrapper {
    ($($ty:ident),*) => {
        $(
            impl From<PeerBackend> for $ty {
                fn from(peer: PeerBackend) -> Self {
                    $ty(peer)
                }
            }

            impl From<$ty> for PeerBackend {
                fn from(wrapped: $ty) -> Self {
                    wrapped.0
                }
            }
        )*
    };
}

peer_wrapper!(Sibling, HostedRestorer, GatewayRestorer);

/// Capabilities of an active storage role.
#[derive(Debug)]
pub struct StorageRole {
    pub root_set: Arc<dyn StorageRootSet>,
    pub factory: Arc<dyn StorageFactory>,
    // Neither is implemented yet; both stay absent.
    pub restorer: Option<HostedRestorer>,
    pub self_as_sibling: Option<Sibling>,
    pub siblings: BackendSet<Sibling>,
    pub hosted_restorers: BackendSet<HostedRestorer>,
    pub gateway_restorers: BackendSet<GatewayRestorer>,
    grant: StorageGrant,
}

impl StorageRole {
    pub fn grant(&self) -> StorageGrant {
        self.grant
    }

    pub fn reset_backends(&self, kind: BackendSetKind, backends: Vec<(u64, PeerBackend)>) {
        match kind {
            BackendSetKind::Siblings => self
                .siblings
                .reset(backends.into_iter().map(|(id, b)| (id, b.into()))),
            BackendSetKind::HostedRestorers => self
                .hosted_restorers
                .reset(backends.into_iter().map(|(id, b)| (id, b.into()))),
            BackendSetKind::GatewayRestorers => self
                .gateway_restorers
                .reset(backends.into_iter().map(|(id, b)| (id, b.into()))),
        }
    }

    pub fn add_backend(&self, kind: BackendSetKind, id: u64, backend: PeerBackend) {
        match kind {
            BackendSetKind::Siblings => {
                self.siblings.insert(id, backend.into());
            }
            BackendSetKind::HostedRestorers => {
                self.hosted_restorers.insert(id, backend.into());
            }
            BackendSetKind::GatewayRestorers => {
                self.gateway_restorers.insert(id, backend.into());
            }
        }
    }

    pub fn remove_backend(&self, kind: BackendSetKind, id: u64) {
        let removed = match kind {
            BackendSetKind::Siblings => self.siblings.unregister(id).is_some(),
            BackendSetKind::HostedRestorers => self.hosted_restorers.unregister(id).is_some(),
            BackendSetKind::GatewayRestorers => self.gateway_restorers.unregister(id).is_some(),
        };
        if !removed {
            warn!(set = %kind, id, "remove of unknown backend ignored");
        }
    }

    pub fn list_backends(&self, kind: BackendSetKind) -> Vec<(u64, PeerBackend)> {
        fn unwrap_all<T: Into<PeerBackend>>(
            entries: Vec<(u64, T)>,
        ) -> Vec<(u64, PeerBackend)> {
            entries.into_iter().map(|(id, b)| (id, b.into())).collect()
        }
        match kind {
            BackendSetKind::Siblings => unwrap_all(self.siblings.entries()),
            BackendSetKind::HostedRestorers => unwrap_all(self.hosted_restorers.entries()),
            BackendSetKind::GatewayRestorers => unwrap_all(self.gateway_restorers.entries()),
        }
    }
}

/// Capabilities of an active worker role.
#[derive(Debug)]
pub struct WorkerRole {
    pub worker: Arc<dyn Worker>,
    grant: WorkerGrant,
}

impl WorkerRole {
    pub fn grant(&self) -> WorkerGrant {
        self.grant
    }
}

/// An activated role bundle.
#[derive(Debug, Clone)]
pub enum RoleState {
    Storage(Arc<StorageRole>),
    Worker(Arc<WorkerRole>),
}

impl RoleState {
    pub fn role(&self) -> Role {
        match self {
            RoleState::Storage(_) => Role::Storage,
            RoleState::Worker(_) => Role::Worker,
        }
    }

    /// Whether both values hold the very same bundle.
    pub fn same_bundle(&self, other: &RoleState) -> bool {
        match (self, other) {
            (RoleState::Storage(a), RoleState::Storage(b)) => Arc::ptr_eq(a, b),
            (RoleState::Worker(a), RoleState::Worker(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

pub struct MachineCoordinator {
    storage_dir: PathBuf,
    storage_engine: Arc<dyn StorageEngine>,
    worker_engine: Arc<dyn WorkerEngine>,
    runtime: Handle,
    next_cap: AtomicU64,
    storage: OnceCell<Arc<StorageRole>>,
    worker: OnceCell<Arc<WorkerRole>>,
}

impl MachineCoordinator {
    /// Coordinator backed by the engines this agent ships with.
    pub fn new(storage_dir: impl Into<PathBuf>, runtime: Handle) -> Self {
        Self::with_engines(
            storage_dir,
            runtime,
            Arc::new(FsStorageEngine),
            Arc::new(LocalWorkerEngine),
        )
    }

    pub fn with_engines(
        storage_dir: impl Into<PathBuf>,
        runtime: Handle,
        storage_engine: Arc<dyn StorageEngine>,
        worker_engine: Arc<dyn WorkerEngine>,
    ) -> Self {
        MachineCoordinator {
            storage_dir: storage_dir.into(),
            storage_engine,
            worker_engine,
            runtime,
            next_cap: AtomicU64::new(1),
            storage: OnceCell::new(),
            worker: OnceCell::new(),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn export(&self) -> CapId {
        CapId(self.next_cap.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn activate(&self, role: Role) -> Result<RoleState> {
        Ok(match role {
            Role::Storage => RoleState::Storage(self.become_storage().await?),
            Role::Worker => RoleState::Worker(self.become_worker().await?),
        })
    }

    pub async fn become_storage(&self) -> Result<Arc<StorageRole>> {
        self.storage
            .get_or_try_init(|| async { self.activate_storage().map(Arc::new) })
            .await
            .cloned()
    }

    pub async fn become_worker(&self) -> Result<Arc<WorkerRole>> {
        self.worker
            .get_or_try_init(|| async { self.activate_worker().map(Arc::new) })
            .await
            .cloned()
    }

    /// The storage role, if it has been activated.
    pub fn storage(&self) -> Option<Arc<StorageRole>> {
        self.storage.get().cloned()
    }

    pub fn worker(&self) -> Option<Arc<WorkerRole>> {
        self.worker.get().cloned()
    }

    pub fn active_roles(&self) -> Vec<Role> {
        let mut roles = Vec::new();
        if self.storage.initialized() {
            roles.push(Role::Storage);
        }
        if self.worker.initialized() {
            roles.push(Role::Worker);
        }
        roles
    }

    fn activate_storage(&self) -> Result<StorageRole> {
        ensure_dir(&self.storage_dir)?;
        let root_set = self.storage_engine.open(&self.storage_dir)?;
        let factory = root_set.clone().factory();

        let grant = StorageGrant {
            root_set: self.export(),
            factory: self.export(),
            restorer: None,
            self_as_sibling: None,
            sibling_set: self.export(),
            hosted_restorer_set: self.export(),
            gateway_restorer_set: self.export(),
        };
        info!(dir = %self.storage_dir.display(), root_set = %grant.root_set, "became storage");

        Ok(StorageRole {
            root_set,
            factory,
            restorer: None,
            self_as_sibling: None,
            siblings: BackendSet::new(),
            hosted_restorers: BackendSet::new(),
            gateway_restorers: BackendSet::new(),
            grant,
        })
    }

    fn activate_worker(&self) -> Result<WorkerRole> {
        let worker = self.worker_engine.start(&self.runtime)?;
        let grant = WorkerGrant {
            worker: self.export(),
        };
        info!(worker = %grant.worker, "became worker");
        Ok(WorkerRole { worker, grant })
    }
}

/// Creates `path` and its parents. Existing directories are left untouched.
fn ensure_dir(path: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
        .with_context(|| format!("Failed to create storage directory {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn identity(port: u16) -> common::NodeIdentity {
        common::NodeIdentity {
            address: format!("127.0.0.1:{port}").parse().unwrap(),
            cert_sha256: "00".repeat(32),
        }
    }

    fn peer(port: u16, cap: u64) -> PeerBackend {
        PeerBackend {
            vat: identity(port),
            cap: CapId(cap),
        }
    }

    /// Counts how many times the engine was asked to open a root.
    struct CountingEngine {
        opened: AtomicUsize,
    }

    impl StorageEngine for CountingEngine {
        fn open(&self, directory: &Path) -> Result<Arc<dyn StorageRootSet>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            FsStorageEngine.open(directory)
        }
    }

    struct FailingEngine;

    impl StorageEngine for FailingEngine {
        fn open(&self, directory: &Path) -> Result<Arc<dyn StorageRootSet>> {
            anyhow::bail!("cannot open {}", directory.display())
        }
    }

    #[tokio::test]
    async fn storage_activation_is_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = Arc::new(CountingEngine {
            opened: AtomicUsize::new(0),
        });
        let coordinator = MachineCoordinator::with_engines(
            tmp.path().join("var/rkm/storage"),
            Handle::current(),
            engine.clone(),
            Arc::new(LocalWorkerEngine),
        );

        let first = coordinator.become_storage().await.unwrap();
        let second = coordinator.become_storage().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first.root_set, &second.root_set));
        assert!(first.siblings.same_set(&second.siblings));
        assert_eq!(first.grant(), second.grant());
        assert!(first.restorer.is_none());
        assert!(first.self_as_sibling.is_none());
        assert_eq!(engine.opened.load(Ordering::SeqCst), 1);
        assert!(tmp.path().join("var/rkm/storage").is_dir());
    }

    #[tokio::test]
    async fn storage_activation_keeps_existing_content() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("storage");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("object"), b"payload").unwrap();

        let coordinator = MachineCoordinator::new(&dir, Handle::current());
        coordinator.become_storage().await.unwrap();
        assert_eq!(std::fs::read(dir.join("object")).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn failed_activation_is_not_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = MachineCoordinator::with_engines(
            tmp.path().join("storage"),
            Handle::current(),
            Arc::new(FailingEngine),
            Arc::new(LocalWorkerEngine),
        );
        assert!(coordinator.become_storage().await.is_err());
        assert!(coordinator.storage().is_none());
        assert!(coordinator.active_roles().is_empty());
    }

    #[tokio::test]
    async fn directory_failure_propagates() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, b"").unwrap();
        let coordinator = MachineCoordinator::new(blocker.join("storage"), Handle::current());
        let err = coordinator.become_storage().await.unwrap_err();
        assert!(err.to_string().contains("Failed to create storage directory"));
    }

    #[tokio::test]
    async fn roles_are_independent() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = MachineCoordinator::new(tmp.path().join("storage"), Handle::current());

        let storage = coordinator.activate(Role::Storage).await.unwrap();
        let worker = coordinator.activate(Role::Worker).await.unwrap();
        let storage_again = coordinator.activate(Role::Storage).await.unwrap();
        let worker_again = coordinator.activate(Role::Worker).await.unwrap();

        assert_eq!(storage.role(), Role::Storage);
        assert_eq!(worker.role(), Role::Worker);
        assert!(storage.same_bundle(&storage_again));
        assert!(worker.same_bundle(&worker_again));
        assert!(!storage.same_bundle(&worker));
        assert_eq!(coordinator.active_roles(), vec![Role::Storage, Role::Worker]);
    }

    #[tokio::test]
    async fn capability_ids_are_distinct() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = MachineCoordinator::new(tmp.path().join("storage"), Handle::current());
        let storage = coordinator.become_storage().await.unwrap().grant();
        let worker = coordinator.become_worker().await.unwrap().grant();

        let mut ids = vec![
            storage.root_set,
            storage.factory,
            storage.sibling_set,
            storage.hosted_restorer_set,
            storage.gateway_restorer_set,
            worker.worker,
        ];
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 6);
    }

    #[tokio::test]
    async fn backend_sets_are_shared_across_activations() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = MachineCoordinator::new(tmp.path().join("storage"), Handle::current());
        let storage = coordinator.become_storage().await.unwrap();

        storage.add_backend(BackendSetKind::Siblings, 4, peer(7001, 10));
        storage.reset_backends(
            BackendSetKind::GatewayRestorers,
            vec![(1, peer(7002, 11)), (2, peer(7003, 12))],
        );

        let again = coordinator.become_storage().await.unwrap();
        assert_eq!(again.siblings.snapshot(), vec![Sibling(peer(7001, 10))]);
        assert_eq!(
            again.list_backends(BackendSetKind::GatewayRestorers),
            vec![(1, peer(7002, 11)), (2, peer(7003, 12))]
        );
        assert!(again.list_backends(BackendSetKind::HostedRestorers).is_empty());

        again.remove_backend(BackendSetKind::GatewayRestorers, 1);
        again.remove_backend(BackendSetKind::GatewayRestorers, 99);
        assert_eq!(storage.gateway_restorers.len(), 1);
    }
}
