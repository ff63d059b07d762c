use std::future::Future;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use anyhow::{Context, Result};
use common::{MachineMessage, MachineResponse, NodeIdentity};
use quinn::{Connection, Endpoint, EndpointConfig, RecvStream, SendStream, TokioRuntime};
use tracing::{debug, info, warn};

use super::MAX_MESSAGE_SIZE;
use super::tls::TlsIdentity;
use crate::error::MachineError;
use crate::role::{MachineCoordinator, StorageRole};

/// A bound but not yet serving endpoint.
///
/// Binding happens on a plain socket so that it can be done before the
/// process daemonizes; the socket is handed to quinn once a runtime exists.
#[derive(Debug)]
pub struct BoundEndpoint {
    socket: UdpSocket,
    tls: TlsIdentity,
    identity: NodeIdentity,
}

impl BoundEndpoint {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).with_context(|| format!("Failed to bind {addr}"))?;
        let local = socket.local_addr()?;
        if local.ip().is_unspecified() {
            warn!(%local, "bound to a wildcard address; peers cannot reach the published identity");
        }
        let tls = TlsIdentity::generate()?;
        let identity = NodeIdentity {
            address: local,
            cert_sha256: tls.fingerprint(),
        };
        Ok(BoundEndpoint {
            socket,
            tls,
            identity,
        })
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Turns the socket into a QUIC server endpoint. Must run inside a tokio runtime.
    pub fn into_endpoint(self) -> Result<Endpoint> {
        self.socket.set_nonblocking(true)?;
        let server_config = self.tls.server_config()?;
        let endpoint = Endpoint::new(
            EndpointConfig::default(),
            Some(server_config),
            self.socket,
            Arc::new(TokioRuntime),
        )?;
        Ok(endpoint)
    }
}

/// Accepts controller connections until `shutdown` resolves.
/// Each connection, and each request on it, runs in its own task.
pub async fn serve<F>(
    endpoint: Endpoint,
    coordinator: Arc<MachineCoordinator>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    info!(addr = %endpoint.local_addr()?, "serving");

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested, closing endpoint");
                endpoint.close(0u32.into(), b"shutdown");
                break;
            }
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else {
                    break;
                };
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => handle_connection(conn, coordinator).await,
                        Err(e) => warn!(error = %e, "failed to establish connection"),
                    }
                });
            }
        }
    }

    Ok(())
}

async fn handle_connection(conn: Connection, coordinator: Arc<MachineCoordinator>) {
    let remote = conn.remote_address();
    info!(%remote, "master connected");

    loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_stream(send, recv, &coordinator).await {
                        warn!(%remote, error = %e, "request stream failed");
                    }
                });
            }
            Err(e) => {
                warn!(%remote, reason = %e, "master disconnected");
                break;
            }
        }
    }
}

async fn handle_stream(
    mut send: SendStream,
    mut recv: RecvStream,
    coordinator: &MachineCoordinator,
) -> Result<()> {
    let request = recv.read_to_end(MAX_MESSAGE_SIZE).await?;
    let response = match bincode::deserialize::<MachineMessage>(&request) {
        Ok(msg) => {
            debug!(?msg, "request");
            dispatch(coordinator, msg).await
        }
        Err(e) => MachineResponse::Error(format!("malformed request: {e}")),
    };
    send.write_all(&bincode::serialize(&response)?).await?;
    send.finish()?;
    Ok(())
}

/// Runs one request against the coordinator. Failures are reported to the
/// caller and never take the server down.
pub async fn dispatch(coordinator: &MachineCoordinator, msg: MachineMessage) -> MachineResponse {
    match handle(coordinator, msg).await {
        Ok(response) => response,
        Err(e) => {
            warn!("request failed: {e:#}");
            MachineResponse::Error(format!("{e:#}"))
        }
    }
}

async fn handle(coordinator: &MachineCoordinator, msg: MachineMessage) -> Result<MachineResponse> {
    let response = match msg {
        MachineMessage::BecomeStorage => {
            MachineResponse::Storage(coordinator.become_storage().await?.grant())
        }
        MachineMessage::BecomeWorker => {
            MachineResponse::Worker(coordinator.become_worker().await?.grant())
        }
        MachineMessage::ResetBackends { set, backends } => {
            info!(%set, count = backends.len(), "backend set reset");
            storage_role(coordinator)?.reset_backends(set, backends);
            MachineResponse::Ack
        }
        MachineMessage::AddBackend { set, id, backend } => {
            info!(%set, id, vat = %backend.vat, "backend added");
            storage_role(coordinator)?.add_backend(set, id, backend);
            MachineResponse::Ack
        }
        MachineMessage::RemoveBackend { set, id } => {
            info!(%set, id, "backend removed");
            storage_role(coordinator)?.remove_backend(set, id);
            MachineResponse::Ack
        }
        MachineMessage::ListBackends(set) => {
            MachineResponse::Backends(storage_role(coordinator)?.list_backends(set))
        }
    };
    Ok(response)
}

fn storage_role(coordinator: &MachineCoordinator) -> Result<Arc<StorageRole>, MachineError> {
    coordinator.storage().ok_or(MachineError::StorageInactive)
}
