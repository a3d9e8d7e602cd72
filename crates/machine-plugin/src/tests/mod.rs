//! Crate-level integration and BDD tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::server::LogSink;


const WAIT: Duration = Duration::from_secs(5);

/// A line forwarded to the sink: `(machine, line, from_stderr)`.
type Forwarded = (String, String, bool);

struct ChannelSink {
    tx: Sender<Forwarded>,
}

impl LogSink for ChannelSink {
    fn plugin_stdout(&self, machine: &str, line: &str) {
        self.tx
            .send((machine.to_owned(), line.to_owned(), false))
            .expect("sink receiver alive");
    }

    fn plugin_stderr(&self, machine: &str, line: &str) {
        self.tx
            .send((machine.to_owned(), line.to_owned(), true))
            .expect("sink receiver alive");
    }
}

fn channel_sink() -> (Arc<dyn LogSink>, Receiver<Forwarded>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (Arc::new(ChannelSink { tx }), rx)
}

/// Writes an executable shell script named `docker-machine-driver-<driver>`.
#[cfg(unix)]
fn write_plugin_script(dir: &Path, driver: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(format!("{}{driver}", crate::DEFAULT_BINARY_PREFIX));
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write plugin script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("make plugin executable");
    path
}

#[cfg(unix)]
#[test]
fn session_launches_script_plugin_end_to_end() {
    use crate::{BinaryLocator, CoreDrivers, PluginSession, SessionOptions};

    let dir = tempfile::TempDir::new().expect("temp dir");
    write_plugin_script(dir.path(), "lab", "echo 127.0.0.1:9000\necho hello\necho dbg >&2");
    let (sink, rx) = channel_sink();
    let locator = BinaryLocator::new(CoreDrivers::new()).with_search_path(dir.path());
    let options = SessionOptions {
        machine_name: Some(String::from("node-1")),
        sink: Some(sink),
        ..SessionOptions::default()
    };

    let session = PluginSession::launch(&locator, "lab", &options).expect("launch");
    assert_eq!(session.address().expect("address"), "127.0.0.1:9000");
    session.wait().expect("session ends cleanly");

    let mut forwarded: Vec<Forwarded> = rx.try_iter().collect();
    forwarded.sort_by_key(|(_, _, from_stderr)| *from_stderr);
    assert_eq!(
        forwarded,
        [
            (String::from("node-1"), String::from("hello"), false),
            (String::from("node-1"), String::from("dbg"), true),
        ]
    );
    assert!(rx.recv_timeout(Duration::from_millis(10)).is_err());
}

#[cfg(unix)]
#[test]
fn joining_a_session_stops_a_cooperative_plugin() {
    use crate::{BinaryLocator, CoreDrivers, PluginSession, SessionOptions};

    let dir = tempfile::TempDir::new().expect("temp dir");
    // Exits once the controller drops its stdin.
    write_plugin_script(dir.path(), "coop", "echo 127.0.0.1:9100\ncat >/dev/null");
    let locator = BinaryLocator::new(CoreDrivers::new()).with_search_path(dir.path());
    let session =
        PluginSession::launch(&locator, "coop", &SessionOptions::default()).expect("launch");
    assert_eq!(session.address().expect("address"), "127.0.0.1:9100");
    assert_eq!(session.plugin().driver(), "coop");
    session.join().expect("join closes and waits");
}

#[cfg(unix)]
#[test]
fn kill_grace_terminates_a_stubborn_plugin() {
    use std::time::Instant;

    use crate::{BinaryLocator, CoreDrivers, PluginSession, SessionOptions};

    let dir = tempfile::TempDir::new().expect("temp dir");
    write_plugin_script(
        dir.path(),
        "stubborn",
        "trap '' PIPE HUP\necho 127.0.0.1:9200\nexec sleep 30",
    );
    let locator = BinaryLocator::new(CoreDrivers::new()).with_search_path(dir.path());
    let options = SessionOptions {
        kill_grace: Some(Duration::from_millis(100)),
        ..SessionOptions::default()
    };
    let session = PluginSession::launch(&locator, "stubborn", &options).expect("launch");
    session.address().expect("address");

    let started = Instant::now();
    session.join().expect("join");
    assert!(started.elapsed() < WAIT);
}
