//! Parsing of the addresses given on the slave command line.

use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use common::LogSinkTarget;
use gethostname::gethostname;
use nix::ifaddrs::getifaddrs;

use crate::error::MachineError;

const LOG_SINK_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    fn name(self) -> &'static str {
        match self {
            IpFamily::V4 => "IPv4",
            IpFamily::V6 => "IPv6",
        }
    }
}

/// Where the agent binds its endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAddress {
    /// First usable address of a local interface (`if4:eth0`, `if6:eth0`).
    Interface { family: IpFamily, name: String },
    /// `ip`, `ip:port`, `[v6]:port` or `host:port`.
    Literal(String),
}

impl FromStr for BindAddress {
    type Err = MachineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| MachineError::InvalidBindAddress {
            spec: s.to_string(),
            reason: reason.to_string(),
        };
        let interface = |family, name: &str| {
            if name.is_empty() {
                Err(invalid("missing interface name"))
            } else {
                Ok(BindAddress::Interface {
                    family,
                    name: name.to_string(),
                })
            }
        };

        if let Some(name) = s.strip_prefix("if4:") {
            interface(IpFamily::V4, name)
        } else if let Some(name) = s.strip_prefix("if6:") {
            interface(IpFamily::V6, name)
        } else if s.is_empty() {
            Err(invalid("empty address"))
        } else {
            Ok(BindAddress::Literal(s.to_string()))
        }
    }
}

impl BindAddress {
    /// Resolves to a concrete socket address. `default_port` applies whenever
    /// the address carries no port of its own; 0 lets the kernel pick one.
    pub fn resolve(&self, default_port: u16) -> Result<SocketAddr, MachineError> {
        match self {
            BindAddress::Interface { family, name } => {
                let ip = interface_address(name, *family)?;
                Ok(SocketAddr::new(ip, default_port))
            }
            BindAddress::Literal(spec) => resolve_literal(spec, default_port),
        }
    }
}

fn resolve_literal(spec: &str, default_port: u16) -> Result<SocketAddr, MachineError> {
    if let Ok(addr) = spec.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = spec.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    let with_port = if spec.contains(':') {
        spec.to_string()
    } else {
        format!("{spec}:{default_port}")
    };
    with_port
        .to_socket_addrs()
        .map_err(|e| MachineError::InvalidBindAddress {
            spec: spec.to_string(),
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| MachineError::InvalidBindAddress {
            spec: spec.to_string(),
            reason: "name resolved to no addresses".to_string(),
        })
}

/// First address of `family` configured on interface `name`. Global
/// addresses are preferred over link-local ones.
pub fn interface_address(name: &str, family: IpFamily) -> Result<IpAddr, MachineError> {
    let mut global = Vec::new();
    let mut link_local = Vec::new();

    for ifaddr in getifaddrs()? {
        if ifaddr.interface_name != name {
            continue;
        }
        let Some(storage) = ifaddr.address else {
            continue;
        };
        let ip = match family {
            IpFamily::V4 => storage
                .as_sockaddr_in()
                .map(|sin| IpAddr::V4(*std::net::SocketAddrV4::from(*sin).ip())),
            IpFamily::V6 => storage
                .as_sockaddr_in6()
                .map(|sin6| IpAddr::V6(*std::net::SocketAddrV6::from(*sin6).ip())),
        };
        let Some(ip) = ip else {
            continue;
        };
        if is_link_local(&ip) {
            link_local.push(ip);
        } else {
            global.push(ip);
        }
    }

    global
        .into_iter()
        .chain(link_local)
        .next()
        .ok_or_else(|| MachineError::NoInterfaceAddress {
            iface: name.to_string(),
            family: family.name(),
        })
}

fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_unicast_link_local(),
    }
}

/// Parses `<addr>[/<name>]` into a log sink target without probing it.
pub fn parse_log_sink(spec: &str) -> Result<LogSinkTarget, MachineError> {
    let invalid = |reason: String| MachineError::InvalidLogSink {
        spec: spec.to_string(),
        reason,
    };

    let (addr, name) = match spec.split_once('/') {
        Some((addr, name)) => (addr, Some(name)),
        None => (spec, None),
    };
    let address = addr
        .to_socket_addrs()
        .map_err(|e| invalid(e.to_string()))?
        .next()
        .ok_or_else(|| invalid("address resolved to nothing".to_string()))?;
    let name = match name {
        Some("") => return Err(invalid("empty name".to_string())),
        Some(name) => name.to_string(),
        None => gethostname().to_string_lossy().into_owned(),
    };

    Ok(LogSinkTarget { address, name })
}

/// Parses a log sink and checks that something is listening on it.
pub fn check_log_sink(spec: &str) -> Result<LogSinkTarget, MachineError> {
    let target = parse_log_sink(spec)?;
    TcpStream::connect_timeout(&target.address, LOG_SINK_PROBE_TIMEOUT).map_err(|e| {
        MachineError::InvalidLogSink {
            spec: spec.to_string(),
            reason: format!("cannot connect: {e}"),
        }
    })?;
    Ok(target)
}
