use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Identifier of a capability exported by a machine.
///
/// Ids are handed out once per capability object and never reused within a
/// process, so two grants carrying the same id refer to the same object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CapId(pub u64);

impl fmt::Display for CapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cap#{}", self.0)
    }
}

/// Network identity descriptor of a running machine agent.
///
/// `cert_sha256` is the hex SHA-256 of the agent's TLS certificate; peers pin
/// it when they connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub address: SocketAddr,
    #[serde(rename = "certSha256")]
    pub cert_sha256: String,
}

impl NodeIdentity {
    /// Single-line JSON form, as written to the lock payload and stdout.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.cert_sha256.get(..12).unwrap_or(&self.cert_sha256);
        write!(f, "{} ({short})", self.address)
    }
}

/// Where a machine ships its log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSinkTarget {
    pub address: SocketAddr,
    pub name: String,
}

impl fmt::Display for LogSinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.name)
    }
}

/// Record published by the running agent for local tooling and log shipping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedAddress {
    pub identity: NodeIdentity,
    #[serde(rename = "logSink", default)]
    pub log_sink: Option<LogSinkTarget>,
    pub pid: u32,
    #[serde(rename = "publishedAt")]
    pub published_at: DateTime<Utc>,
}

/// A capability hosted by some other machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerBackend {
    pub vat: NodeIdentity,
    pub cap: CapId,
}

/// The membership sets owned by an active storage role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendSetKind {
    Siblings,
    HostedRestorers,
    GatewayRestorers,
}

impl BackendSetKind {
    pub const ALL: [BackendSetKind; 3] = [
        BackendSetKind::Siblings,
        BackendSetKind::HostedRestorers,
        BackendSetKind::GatewayRestorers,
    ];
}

impl fmt::Display for BackendSetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendSetKind::Siblings => "siblings",
            BackendSetKind::HostedRestorers => "hosted-restorers",
            BackendSetKind::GatewayRestorers => "gateway-restorers",
        };
        f.write_str(name)
    }
}

/// Capabilities produced by activating the storage role.
///
/// `restorer` and `self_as_sibling` are not provided by this agent yet and are
/// always `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageGrant {
    pub root_set: CapId,
    pub factory: CapId,
    pub restorer: Option<CapId>,
    pub self_as_sibling: Option<CapId>,
    pub sibling_set: CapId,
    pub hosted_restorer_set: CapId,
    pub gateway_restorer_set: CapId,
}

impl StorageGrant {
    pub fn set_id(&self, kind: BackendSetKind) -> CapId {
        match kind {
            BackendSetKind::Siblings => self.sibling_set,
            BackendSetKind::HostedRestorers => self.hosted_restorer_set,
            BackendSetKind::GatewayRestorers => self.gateway_restorer_set,
        }
    }
}

/// Capabilities produced by activating the worker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerGrant {
    pub worker: CapId,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum MachineMessage {
    //bootstrap
    BecomeStorage,
    BecomeWorker,

    //storage role backend sets
    ResetBackends {
        set: BackendSetKind,
        backends: Vec<(u64, PeerBackend)>,
    },
    AddBackend {
        set: BackendSetKind,
        id: u64,
        backend: PeerBackend,
    },
    RemoveBackend {
        set: BackendSetKind,
        id: u64,
    },
    ListBackends(BackendSetKind),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum MachineResponse {
    Storage(StorageGrant),
    Worker(WorkerGrant),
    Backends(Vec<(u64, PeerBackend)>),
    Ack,
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> NodeIdentity {
        NodeIdentity {
            address: "10.0.0.7:41000".parse().unwrap(),
            cert_sha256: "ab".repeat(32),
        }
    }

    #[test]
    fn identity_line_is_single_line_json() {
        let line = identity().to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.contains("\"certSha256\""));
        assert_eq!(NodeIdentity::from_line(&line).unwrap(), identity());
    }

    #[test]
    fn identity_from_line_rejects_garbage() {
        assert!(NodeIdentity::from_line("").is_err());
        assert!(NodeIdentity::from_line("{\"address\":\"nope\"}").is_err());
    }

    #[test]
    fn grant_maps_set_kinds_to_ids() {
        let grant = StorageGrant {
            root_set: CapId(1),
            factory: CapId(2),
            restorer: None,
            self_as_sibling: None,
            sibling_set: CapId(3),
            hosted_restorer_set: CapId(4),
            gateway_restorer_set: CapId(5),
        };
        let ids: Vec<_> = BackendSetKind::ALL.iter().map(|k| grant.set_id(*k)).collect();
        assert_eq!(ids, vec![CapId(3), CapId(4), CapId(5)]);
    }

    #[test]
    fn messages_survive_bincode() {
        let msg = MachineMessage::AddBackend {
            set: BackendSetKind::Siblings,
            id: 9,
            backend: PeerBackend {
                vat: identity(),
                cap: CapId(3),
            },
        };
        let data = bincode::serialize(&msg).unwrap();
        match bincode::deserialize::<MachineMessage>(&data).unwrap() {
            MachineMessage::AddBackend { set, id, backend } => {
                assert_eq!(set, BackendSetKind::Siblings);
                assert_eq!(id, 9);
                assert_eq!(backend.vat, identity());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
