use std::fs::{DirBuilder, File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use common::NodeIdentity;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

/// The machine-wide daemon lock and its identity payload.
///
/// The lock lives as long as this value (or the process) does. The file is
/// truncated only once the lock is held: a failed attempt leaves the holder's
/// payload intact, and a new owner never exposes its predecessor's identity.
#[derive(Debug)]
pub struct DaemonLock {
    lock: Flock<File>,
    path: PathBuf,
}

impl DaemonLock {
    /// Takes the lock without waiting. `Ok(None)` means another process holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = open_lock_file(path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => DaemonLock::claim(lock, path).map(Some),
            Err((_file, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_file, e)) => Err(e).with_context(|| format!("Lock failed: {}", path.display())),
        }
    }

    /// Waits until the current holder releases the lock.
    pub fn acquire_blocking(path: &Path) -> Result<Self> {
        let file = open_lock_file(path)?;
        match Flock::lock(file, FlockArg::LockExclusive) {
            Ok(lock) => DaemonLock::claim(lock, path),
            Err((_file, e)) => Err(e).with_context(|| format!("Lock failed: {}", path.display())),
        }
    }

    // Drops whatever the previous owner left behind.
    fn claim(lock: Flock<File>, path: &Path) -> Result<Self> {
        lock.set_len(0)
            .with_context(|| format!("Failed to truncate {}", path.display()))?;
        Ok(DaemonLock {
            lock,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrites the payload with `identity`.
    pub fn write_payload(&self, identity: &NodeIdentity) -> Result<()> {
        let line = identity.to_line()?;
        self.lock.set_len(0)?;
        self.lock.write_all_at(line.as_bytes(), 0)?;
        self.lock
            .sync_data()
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o644)
        .open(path)
        .with_context(|| format!("Failed to open lock file {}", path.display()))?;
    Ok(file)
}

/// Identity left in the lock file by its current (or last) owner.
/// `Ok(None)` when the file is missing or empty.
pub fn read_payload(path: &Path) -> Result<Option<NodeIdentity>> {
    let mut content = String::new();
    match File::open(path) {
        Ok(mut file) => file.read_to_string(&mut content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    if content.trim().is_empty() {
        return Ok(None);
    }
    let identity = NodeIdentity::from_line(&content)
        .with_context(|| format!("Failed to parse lock payload {}", path.display()))?;
    Ok(Some(identity))
}
