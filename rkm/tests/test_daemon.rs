use std::path::Path;
use std::process::{Command, Output};
use std::time::{Duration, Instant};

use common::{NodeIdentity, PublishedAddress};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use rkm::config::NodePaths;
use rkm::publisher::read_published;
use rkm::supervisor::lock::{DaemonLock, read_payload};
use rkm::transport::{MachineClient, init_crypto};
use serial_test::serial;

/// Terminates whichever daemon is recorded when the test ends.
struct DaemonGuard<'a> {
    paths: &'a NodePaths,
}

impl Drop for DaemonGuard<'_> {
    fn drop(&mut self) {
        if let Ok(Some(record)) = read_published(&self.paths.address_file) {
            let _ = kill(Pid::from_raw(record.pid as i32), Signal::SIGTERM);
        }
    }
}

fn launch(paths: &NodePaths, extra: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_rkm"))
        .arg("slave")
        .arg("127.0.0.1")
        .arg("--lock-file")
        .arg(&paths.lock_file)
        .arg("--address-file")
        .arg(&paths.address_file)
        .arg("--storage-dir")
        .arg(&paths.storage_dir)
        .arg("--log-dir")
        .arg(&paths.log_dir)
        .args(extra)
        .output()
        .unwrap()
}

fn identity_from(output: &Output) -> NodeIdentity {
    assert!(
        output.status.success(),
        "launch failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    NodeIdentity::from_line(&String::from_utf8_lossy(&output.stdout)).unwrap()
}

fn wait_for_publication(path: &Path, identity: &NodeIdentity) -> PublishedAddress {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(Some(record)) = read_published(path) {
            if &record.identity == identity {
                return record;
            }
        }
        assert!(Instant::now() < deadline, "daemon never published {identity}");
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[tokio::test]
#[serial]
async fn launch_report_and_restart() {
    init_crypto();
    let tmp = tempfile::tempdir().unwrap();
    let paths = NodePaths::under(tmp.path());
    let _guard = DaemonGuard { paths: &paths };

    // first launch: lock taken, identity echoed, daemon detaches
    let a = identity_from(&launch(&paths, &[]));
    assert_eq!(read_payload(&paths.lock_file).unwrap(), Some(a.clone()));
    let record_a = wait_for_publication(&paths.address_file, &a);
    assert_ne!(record_a.pid, std::process::id());
    assert!(paths.daemon_log().exists());

    let client = MachineClient::connect(&a).await.unwrap();
    client.become_storage().await.unwrap();
    assert!(paths.storage_dir.is_dir());
    client.close().await;

    // second launch: already running, reports A and leaves the payload alone
    let payload = std::fs::read(&paths.lock_file).unwrap();
    let reported = identity_from(&launch(&paths, &[]));
    assert_eq!(reported, a);
    assert_eq!(std::fs::read(&paths.lock_file).unwrap(), payload);

    // restart: the old daemon is told to stop and the new one takes over
    let b = identity_from(&launch(&paths, &["--restart"]));
    assert_ne!(b, a);
    assert_eq!(read_payload(&paths.lock_file).unwrap(), Some(b.clone()));
    let record_b = wait_for_publication(&paths.address_file, &b);
    assert_ne!(record_b.pid, record_a.pid);

    let client = MachineClient::connect(&b).await.unwrap();
    client.become_worker().await.unwrap();
    client.close().await;
}

#[test]
#[serial]
fn unpublishable_launch_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let mut paths = NodePaths::under(tmp.path());
    let blocker = tmp.path().join("blocker");
    std::fs::write(&blocker, b"").unwrap();
    paths.address_file = blocker.join("addr");

    let output = launch(&paths, &[]);
    assert!(!output.status.success(), "launcher reported success");
    assert!(output.stdout.is_empty());
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("daemon exited before publishing")
    );

    // nobody is left holding the lock
    assert!(DaemonLock::try_acquire(&paths.lock_file).unwrap().is_some());
    assert!(!paths.address_file.exists());
}
