use std::net::SocketAddr;

use anyhow::{Context, Result, bail};
use common::{
    BackendSetKind, MachineMessage, MachineResponse, NodeIdentity, PeerBackend, StorageGrant,
    WorkerGrant,
};
use quinn::{Connection, Endpoint};
use tracing::info;

use super::MAX_MESSAGE_SIZE;
use super::tls::pinned_client_config;
use crate::error::MachineError;

/// Controller-side handle on one machine agent.
pub struct MachineClient {
    endpoint: Endpoint,
    connection: Connection,
    peer: NodeIdentity,
}

impl MachineClient {
    /// Connects to the agent described by `peer`, trusting only the
    /// certificate it published.
    pub async fn connect(peer: &NodeIdentity) -> Result<Self> {
        let local: SocketAddr = if peer.address.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let mut endpoint = Endpoint::client(local)?;
        endpoint.set_default_client_config(pinned_client_config(&peer.cert_sha256)?);

        let connection = endpoint
            .connect(peer.address, "localhost")?
            .await
            .with_context(|| format!("Failed to connect to machine {peer}"))?;
        info!(peer = %peer, "connected to machine");

        Ok(MachineClient {
            endpoint,
            connection,
            peer: peer.clone(),
        })
    }

    pub fn peer(&self) -> &NodeIdentity {
        &self.peer
    }

    /// Sends one request on its own stream and waits for the answer.
    /// Remote failures come back as [`MachineError::Remote`].
    pub async fn call(&self, msg: &MachineMessage) -> Result<MachineResponse> {
        let (mut send, mut recv) = self.connection.open_bi().await?;
        send.write_all(&bincode::serialize(msg)?).await?;
        send.finish()?;
        let data = recv.read_to_end(MAX_MESSAGE_SIZE).await?;
        match bincode::deserialize::<MachineResponse>(&data)? {
            MachineResponse::Error(e) => Err(MachineError::Remote(e).into()),
            response => Ok(response),
        }
    }

    pub async fn become_storage(&self) -> Result<StorageGrant> {
        match self.call(&MachineMessage::BecomeStorage).await? {
            MachineResponse::Storage(grant) => Ok(grant),
            other => bail!("unexpected response to BecomeStorage: {other:?}"),
        }
    }

    pub async fn become_worker(&self) -> Result<WorkerGrant> {
        match self.call(&MachineMessage::BecomeWorker).await? {
            MachineResponse::Worker(grant) => Ok(grant),
            other => bail!("unexpected response to BecomeWorker: {other:?}"),
        }
    }

    pub async fn reset_backends(
        &self,
        set: BackendSetKind,
        backends: Vec<(u64, PeerBackend)>,
    ) -> Result<()> {
        self.expect_ack(&MachineMessage::ResetBackends { set, backends })
            .await
    }

    pub async fn add_backend(&self, set: BackendSetKind, id: u64, backend: PeerBackend) -> Result<()> {
        self.expect_ack(&MachineMessage::AddBackend { set, id, backend })
            .await
    }

    pub async fn remove_backend(&self, set: BackendSetKind, id: u64) -> Result<()> {
        self.expect_ack(&MachineMessage::RemoveBackend { set, id })
            .await
    }

    pub async fn list_backends(&self, set: BackendSetKind) -> Result<Vec<(u64, PeerBackend)>> {
        match self.call(&MachineMessage::ListBackends(set)).await? {
            MachineResponse::Backends(list) => Ok(list),
            other => bail!("unexpected response to ListBackends: {other:?}"),
        }
    }

    async fn expect_ack(&self, msg: &MachineMessage) -> Result<()> {
        match self.call(msg).await? {
            MachineResponse::Ack => Ok(()),
            other => bail!("unexpected response to {msg:?}: {other:?}"),
        }
    }

    pub async fn close(self) {
        self.connection.close(0u32.into(), b"done");
        self.endpoint.wait_idle().await;
    }
}
