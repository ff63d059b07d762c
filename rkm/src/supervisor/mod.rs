//! Single-instance supervision of the slave agent.
//!
//! A launch walks `Unstarted -> LockAttempt -> {AlreadyRunning | Acquired}
//! -> (ForceKillAndRetry) -> Daemonized -> Published -> Serving`. The endpoint
//! is bound and its identity written into the lock payload before the process
//! detaches. The launching process waits on a pipe until the daemon has
//! published its address, and only then echoes the identity; if the daemon
//! dies first the launch fails.

pub mod lock;
pub mod takeover;

use std::fmt;
use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use common::{LogSinkTarget, NodeIdentity};
use daemonize::{Daemonize, Outcome};
use nix::unistd::pipe;
use tokio::runtime::Handle;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

use crate::config::NodePaths;
use crate::publisher::{AddressPublisher, read_published};
use crate::role::MachineCoordinator;
use crate::transport::{self, BoundEndpoint};
use lock::{DaemonLock, read_payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Unstarted,
    LockAttempt,
    AlreadyRunning,
    Acquired,
    ForceKillAndRetry,
    Daemonized,
    Published,
    Serving,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Unstarted => "unstarted",
            SupervisorState::LockAttempt => "lock-attempt",
            SupervisorState::AlreadyRunning => "already-running",
            SupervisorState::Acquired => "acquired",
            SupervisorState::ForceKillAndRetry => "force-kill-and-retry",
            SupervisorState::Daemonized => "daemonized",
            SupervisorState::Published => "published",
            SupervisorState::Serving => "serving",
        };
        f.write_str(name)
    }
}

/// Everything a slave launch needs, already parsed and validated.
#[derive(Debug, Clone)]
pub struct SlaveOptions {
    pub bind: SocketAddr,
    pub log_sink: Option<LogSinkTarget>,
    pub restart: bool,
    pub foreground: bool,
    pub paths: NodePaths,
}

/// Result of the lock step.
#[derive(Debug)]
pub enum LockAttempt {
    /// Another instance owns the machine; carries its identity when known.
    AlreadyRunning(Option<NodeIdentity>),
    Acquired(DaemonLock),
}

pub struct InstanceSupervisor {
    options: SlaveOptions,
    state: SupervisorState,
}

impl InstanceSupervisor {
    pub fn new(options: SlaveOptions) -> Self {
        InstanceSupervisor {
            options,
            state: SupervisorState::Unstarted,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    fn transition(&mut self, next: SupervisorState) {
        info!(from = %self.state, to = %next, "supervisor state");
        self.state = next;
    }

    /// Takes the daemon lock. In restart mode previous instances are
    /// signalled first and the lock is awaited; otherwise a held lock means
    /// another instance is running.
    pub fn lock(&mut self) -> Result<LockAttempt> {
        let lock_file = self.options.paths.lock_file.clone();

        if self.options.restart {
            self.transition(SupervisorState::ForceKillAndRetry);
            let signalled = takeover::terminate_previous(&self.options.paths.address_file)?;
            if !signalled.is_empty() {
                info!(pids = ?signalled, "waiting for previous instance to release the lock");
            }
            self.transition(SupervisorState::LockAttempt);
            let lock = DaemonLock::acquire_blocking(&lock_file)?;
            self.transition(SupervisorState::Acquired);
            return Ok(LockAttempt::Acquired(lock));
        }

        self.transition(SupervisorState::LockAttempt);
        match DaemonLock::try_acquire(&lock_file)? {
            Some(lock) => {
                self.transition(SupervisorState::Acquired);
                Ok(LockAttempt::Acquired(lock))
            }
            None => {
                let identity = running_identity(&self.options.paths);
                self.transition(SupervisorState::AlreadyRunning);
                Ok(LockAttempt::AlreadyRunning(identity))
            }
        }
    }

    /// Runs the whole launch. Returns once another instance was found, once
    /// the daemon has confirmed it is published, or once the daemon has been
    /// asked to stop. `out` receives the identity line, and only after the
    /// address is published.
    pub fn run(mut self, out: &mut impl Write) -> Result<()> {
        let lock = match self.lock()? {
            LockAttempt::AlreadyRunning(identity) => {
                report_running(identity.as_ref(), out)?;
                return Ok(());
            }
            LockAttempt::Acquired(lock) => lock,
        };

        let endpoint = BoundEndpoint::bind(self.options.bind)?;
        lock.write_payload(endpoint.identity())
            .with_context(|| format!("Failed to write identity to {}", lock.path().display()))?;
        let identity = endpoint.identity().clone();

        if self.options.foreground {
            return self.run_daemon(lock, endpoint, || echo_identity(&identity, out));
        }
        match self.daemonize(lock)? {
            Detached::Launcher { lock, ready } => {
                let started = wait_for_daemon(ready, &self.options.paths.daemon_log());
                if started.is_ok() {
                    // Dropping the lock here would unlock the description the
                    // daemon inherited.
                    std::mem::forget(lock);
                }
                started?;
                echo_identity(&identity, out)
            }
            Detached::Daemon { lock, ready } => {
                self.run_daemon(lock, endpoint, move || signal_ready(ready))
            }
        }
    }

    fn run_daemon(
        &mut self,
        lock: DaemonLock,
        endpoint: BoundEndpoint,
        on_ready: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let result = runtime.block_on(self.serve(endpoint, on_ready));
        drop(lock);
        result
    }

    /// Detaches into the background. Both sides keep their end of a
    /// readiness pipe; the daemon writes to it once it is published.
    fn daemonize(&mut self, lock: DaemonLock) -> Result<Detached> {
        let log_path = self.options.paths.daemon_log();
        if let Some(dir) = log_path.parent() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open {}", log_path.display()))?;
        let err_log = log.try_clone()?;
        let (ready_rx, ready_tx) = pipe().context("Failed to create readiness pipe")?;

        let daemonize = Daemonize::new()
            .working_directory(std::env::current_dir()?)
            .stdout(log)
            .stderr(err_log);

        match daemonize.execute() {
            Outcome::Parent(Ok(_)) => {
                drop(ready_tx);
                Ok(Detached::Launcher {
                    lock,
                    ready: File::from(ready_rx),
                })
            }
            Outcome::Parent(Err(e)) => Err(e).context("Failed to daemonize"),
            Outcome::Child(Ok(_)) => {
                drop(ready_rx);
                self.transition(SupervisorState::Daemonized);
                Ok(Detached::Daemon {
                    lock,
                    ready: File::from(ready_tx),
                })
            }
            Outcome::Child(Err(e)) => Err(e).context("Failed to daemonize"),
        }
    }

    async fn serve(
        &mut self,
        endpoint: BoundEndpoint,
        on_ready: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        transport::init_crypto();
        let identity = endpoint.identity().clone();
        let endpoint = endpoint.into_endpoint()?;

        let publisher = AddressPublisher::new(&self.options.paths.address_file);
        publisher.publish(&identity, self.options.log_sink.as_ref())?;
        self.transition(SupervisorState::Published);
        on_ready()?;

        let coordinator = Arc::new(MachineCoordinator::new(
            self.options.paths.storage_dir.clone(),
            Handle::current(),
        ));
        self.transition(SupervisorState::Serving);
        transport::serve(endpoint, coordinator, shutdown_signal()).await
    }
}

/// Which side of the fork a launch ended up on.
enum Detached {
    /// The launching process; `ready` hears from the daemon.
    Launcher { lock: DaemonLock, ready: File },
    Daemon { lock: DaemonLock, ready: File },
}

const READY: u8 = b'R';

fn signal_ready(mut ready: File) -> Result<()> {
    ready
        .write_all(&[READY])
        .context("Failed to notify the launching process")
}

/// Blocks until the daemon reports that it is published. End of file means
/// it exited first.
fn wait_for_daemon(mut ready: File, log_path: &Path) -> Result<()> {
    let mut byte = [0u8; 1];
    match ready.read_exact(&mut byte) {
        Ok(()) if byte[0] == READY => Ok(()),
        Ok(()) => bail!("unexpected readiness byte {:#04x} from daemon", byte[0]),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => bail!(
            "daemon exited before publishing its address, see {}",
            log_path.display()
        ),
        Err(e) => Err(e).context("Failed to wait for the daemon"),
    }
}

fn echo_identity(identity: &NodeIdentity, out: &mut impl Write) -> Result<()> {
    writeln!(out, "{}", identity.to_line()?.trim_end())?;
    out.flush()?;
    Ok(())
}

/// Identity of the instance holding the lock. The lock payload is
/// authoritative; the published record covers the moment between a new
/// owner taking the lock and writing its payload.
pub fn running_identity(paths: &NodePaths) -> Option<NodeIdentity> {
    match read_payload(&paths.lock_file) {
        Ok(Some(identity)) => return Some(identity),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "unreadable lock payload"),
    }
    match read_published(&paths.address_file) {
        Ok(record) => record.map(|r| r.identity),
        Err(e) => {
            warn!(error = %e, "unreadable published address");
            None
        }
    }
}

/// Re-emits the running instance's identity for whoever launched us.
pub fn report_running(identity: Option<&NodeIdentity>, out: &mut impl Write) -> Result<()> {
    match identity {
        Some(identity) => {
            info!(%identity, "already running");
            writeln!(out, "{}", identity.to_line()?.trim_end())?;
        }
        None => warn!("already running, but its identity has not been written yet"),
    }
    out.flush()?;
    Ok(())
}

/// Resolves on SIGTERM or Ctrl-C.
pub async fn shutdown_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = tokio::signal::ctrl_c() => info!("received Ctrl-C"),
    }
}
