use std::path::Path;

use anyhow::Result;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use sysinfo::System;
use tracing::{info, warn};

use crate::publisher::read_published;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub cmd: Vec<String>,
}

impl ProcessEntry {
    /// Whether the command line runs the `slave` subcommand, as opposed to
    /// `master` or `address` invocations of the same binary.
    fn runs_slave(&self) -> bool {
        self.cmd.iter().skip(1).any(|arg| arg == SLAVE_SUBCOMMAND)
    }
}

const SLAVE_SUBCOMMAND: &str = "slave";

/// Picks the processes a force restart should terminate.
///
/// The pid recorded in the published address wins when it still names a
/// live instance of this daemon; otherwise every `slave` process with our
/// name, other than ourselves, is a target.
pub fn select_targets(
    processes: &[ProcessEntry],
    own_pid: u32,
    own_name: &str,
    recorded_pid: Option<u32>,
) -> Vec<u32> {
    let is_instance =
        |p: &ProcessEntry| p.pid != own_pid && p.name == own_name && p.runs_slave();

    if let Some(recorded) = recorded_pid {
        if processes.iter().any(|p| p.pid == recorded && is_instance(p)) {
            return vec![recorded];
        }
    }

    let mut pids: Vec<u32> = processes
        .iter()
        .filter(|p| is_instance(p))
        .map(|p| p.pid)
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Sends SIGTERM to every previous instance of this daemon and returns the
/// pids signalled. A process that is already gone is not an error.
pub fn terminate_previous(address_file: &Path) -> Result<Vec<u32>> {
    let recorded_pid = match read_published(address_file) {
        Ok(record) => record.map(|r| r.pid),
        Err(e) => {
            warn!(error = %e, "ignoring unreadable published address");
            None
        }
    };

    let sys = System::new_all();
    let own_pid = std::process::id();
    let own_name = sys
        .process(sysinfo::Pid::from_u32(own_pid))
        .map(|p| p.name().to_string())
        .or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.file_name().map(|n| n.to_string_lossy().into_owned()))
        })
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());

    let processes: Vec<ProcessEntry> = sys
        .processes()
        .iter()
        .map(|(pid, process)| ProcessEntry {
            pid: pid.as_u32(),
            name: process.name().to_string(),
            cmd: process.cmd().to_vec(),
        })
        .collect();

    let targets = select_targets(&processes, own_pid, &own_name, recorded_pid);
    for &pid in &targets {
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => info!(pid, "sent SIGTERM to previous instance"),
            Err(Errno::ESRCH) => info!(pid, "previous instance already exited"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(targets)
}
