//! Controller path: turns the machines named in a [`MasterConfig`] into one
//! storage node and a set of workers.

use anyhow::{Context, Result, bail};
use common::{BackendSetKind, StorageGrant, WorkerGrant};
use tracing::info;

use crate::config::MasterConfig;
use crate::transport::{self, MachineClient};

/// Connections and grants of an assembled cluster.
pub struct Cluster {
    pub storage: MachineClient,
    pub storage_grant: StorageGrant,
    pub workers: Vec<(MachineClient, WorkerGrant)>,
}

impl Cluster {
    pub async fn close(self) {
        for (worker, _) in self.workers {
            worker.close().await;
        }
        self.storage.close().await;
    }
}

/// Activates storage, empties its membership sets, then activates every worker.
pub async fn assemble(config: &MasterConfig) -> Result<Cluster> {
    if config.workers.is_empty() {
        bail!("at least one worker is required");
    }
    transport::init_crypto();

    let storage = MachineClient::connect(&config.storage).await?;
    let storage_grant = storage
        .become_storage()
        .await
        .with_context(|| format!("Failed to activate storage on {}", config.storage))?;
    info!(machine = %config.storage, root_set = %storage_grant.root_set, "storage activated");

    for kind in BackendSetKind::ALL {
        storage.reset_backends(kind, Vec::new()).await?;
    }

    let mut workers = Vec::with_capacity(config.workers.len());
    for identity in &config.workers {
        let client = MachineClient::connect(identity).await?;
        let grant = client
            .become_worker()
            .await
            .with_context(|| format!("Failed to activate worker on {identity}"))?;
        info!(machine = %identity, worker = %grant.worker, "worker activated");
        workers.push((client, grant));
    }

    Ok(Cluster {
        storage,
        storage_grant,
        workers,
    })
}

/// Assembles the cluster and holds the connections until Ctrl-C.
pub async fn run(config: MasterConfig) -> Result<()> {
    let cluster = assemble(&config).await?;
    info!(workers = cluster.workers.len(), "cluster assembled");
    tokio::signal::ctrl_c().await?;
    cluster.close().await;
    Ok(())
}
