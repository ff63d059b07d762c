#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error("no back-end available")]
    NoBackendAvailable,
    #[error("storage role has not been activated")]
    StorageInactive,
    #[error("invalid bind address {spec:?}: {reason}")]
    InvalidBindAddress { spec: String, reason: String },
    #[error("interface {iface} has no {family} address")]
    NoInterfaceAddress {
        iface: String,
        family: &'static str,
    },
    #[error("invalid log sink {spec:?}: {reason}")]
    InvalidLogSink { spec: String, reason: String },
    #[error("remote call failed: {0}")]
    Remote(String),
    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),
}
