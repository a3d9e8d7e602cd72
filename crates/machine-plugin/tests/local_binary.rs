//! End-to-end checks that drive real plugin binaries through the public API.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use machine_plugin::{
    BinaryLocator, CoreDrivers, LocalBinaryExecutor, LogSink, Plugin, PluginError, PluginServer,
    SessionState,
};
use tempfile::TempDir;

#[derive(Default)]
struct RecordingSink {
    stdout: Mutex<Vec<String>>,
    stderr: Mutex<Vec<String>>,
}

impl LogSink for RecordingSink {
    fn plugin_stdout(&self, _machine: &str, line: &str) {
        self.stdout.lock().expect("stdout lock").push(line.to_owned());
    }

    fn plugin_stderr(&self, _machine: &str, line: &str) {
        self.stderr.lock().expect("stderr lock").push(line.to_owned());
    }
}

fn install(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
}

#[test]
fn custom_prefix_binary_streams_every_line() {
    let dir = TempDir::new().expect("temp dir");
    install(
        dir.path(),
        "acme-driver-bulk",
        "echo 127.0.0.1:7000\ni=0\nwhile [ $i -lt 100 ]; do echo line-$i; echo err-$i >&2; i=$((i+1)); done",
    );
    let locator = BinaryLocator::new(CoreDrivers::new())
        .with_prefix("acme-driver-")
        .with_search_path(dir.path());
    let binary = locator.resolve("bulk").expect("resolve");

    let sink = Arc::new(RecordingSink::default());
    let plugin = Plugin::new(LocalBinaryExecutor::new("bulk", binary))
        .with_machine_name("bulk-1")
        .with_log_sink(Arc::clone(&sink) as Arc<dyn LogSink>);
    plugin.serve().expect("serve until the plugin exits");

    assert_eq!(plugin.address().expect("address"), "127.0.0.1:7000");
    assert_eq!(plugin.state(), SessionState::Closed);
    let expected_out: Vec<String> = (0..100).map(|i| format!("line-{i}")).collect();
    let expected_err: Vec<String> = (0..100).map(|i| format!("err-{i}")).collect();
    assert_eq!(*sink.stdout.lock().expect("stdout lock"), expected_out);
    assert_eq!(*sink.stderr.lock().expect("stderr lock"), expected_err);
}

#[test]
fn missing_binary_is_reported_before_spawning() {
    let dir = TempDir::new().expect("temp dir");
    let locator = BinaryLocator::new(CoreDrivers::new()).with_search_path(dir.path());
    let err = locator.resolve("absent").expect_err("nothing installed");
    assert!(matches!(err, PluginError::BinaryNotFound { ref driver } if driver == "absent"));
    assert!(err.to_string().contains("PATH"));
}

#[test]
fn close_from_another_thread_ends_serve() {
    let dir = TempDir::new().expect("temp dir");
    install(
        dir.path(),
        "docker-machine-driver-idle",
        "echo 127.0.0.1:7100\ncat >/dev/null",
    );
    let locator = BinaryLocator::new(CoreDrivers::new()).with_search_path(dir.path());
    let binary = locator.resolve("idle").expect("resolve");
    let plugin = Arc::new(
        Plugin::new(LocalBinaryExecutor::new("idle", binary))
            .with_address_timeout(Duration::from_secs(5)),
    );

    let serving = Arc::clone(&plugin);
    let worker = thread::spawn(move || serving.serve());
    assert_eq!(plugin.address().expect("address"), "127.0.0.1:7100");
    plugin.close().expect("close");
    worker
        .join()
        .expect("serve thread")
        .expect("serve returns after close");
    assert_eq!(plugin.state(), SessionState::Closed);
}
