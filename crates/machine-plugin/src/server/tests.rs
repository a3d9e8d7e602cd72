//! Unit tests for plugin session orchestration.

use std::io::{self, BufReader, Cursor, PipeWriter, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use mockall::mock;
use rstest::rstest;

use super::*;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Forwarded {
    Stdout(String, String),
    Stderr(String, String),
}

/// Sink that reports every forwarded line on a channel.
struct ChannelSink {
    tx: Sender<Forwarded>,
}

impl LogSink for ChannelSink {
    fn plugin_stdout(&self, machine: &str, line: &str) {
        self.tx
            .send(Forwarded::Stdout(machine.to_owned(), line.to_owned()))
            .expect("test receiver alive");
    }

    fn plugin_stderr(&self, machine: &str, line: &str) {
        self.tx
            .send(Forwarded::Stderr(machine.to_owned(), line.to_owned()))
            .expect("test receiver alive");
    }
}

fn channel_sink() -> (Arc<dyn LogSink>, Receiver<Forwarded>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (Arc::new(ChannelSink { tx }), rx)
}

mock! {
    Sink {}
    impl LogSink for Sink {
        fn plugin_stdout(&self, machine: &str, line: &str);
        fn plugin_stderr(&self, machine: &str, line: &str);
    }
}

#[derive(Debug, Clone, Default)]
struct Counters {
    starts: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl Counters {
    fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Writers standing in for a live plugin's stdout and stderr.
#[derive(Clone, Default)]
struct LiveWriters {
    stdout: Arc<Mutex<Option<PipeWriter>>>,
    stderr: Arc<Mutex<Option<PipeWriter>>>,
}

impl LiveWriters {
    fn write_stdout(&self, text: &str) {
        write_to(&self.stdout, text);
    }

    fn write_stderr(&self, text: &str) {
        write_to(&self.stderr, text);
    }

    /// Blocks until the executor under test has started the plugin.
    fn wait_until_started(&self) {
        while self.stdout.lock().expect("stdout lock").is_none()
            || self.stderr.lock().expect("stderr lock").is_none()
        {
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn hang_up(&self) {
        self.stdout.lock().expect("stdout lock").take();
        self.stderr.lock().expect("stderr lock").take();
    }
}

fn write_to(slot: &Mutex<Option<PipeWriter>>, text: &str) {
    let mut guard = slot.lock().expect("writer lock");
    let writer = guard.as_mut().expect("writer still open");
    writer.write_all(text.as_bytes()).expect("write to plugin pipe");
}

enum Feed {
    Scripted { stdout: String, stderr: String },
    Live { writers: LiveWriters, hang_up_on_close: bool },
    Refuse,
}

struct FakeExecutor {
    driver: String,
    feed: Feed,
    counters: Counters,
}

impl FakeExecutor {
    fn scripted(stdout: &str, stderr: &str) -> Self {
        Self {
            driver: String::from("fake"),
            feed: Feed::Scripted {
                stdout: stdout.to_owned(),
                stderr: stderr.to_owned(),
            },
            counters: Counters::default(),
        }
    }

    fn live(writers: LiveWriters) -> Self {
        Self {
            driver: String::from("fake"),
            feed: Feed::Live {
                writers,
                hang_up_on_close: true,
            },
            counters: Counters::default(),
        }
    }

    /// A plugin that keeps writing after its pipes are closed.
    fn orphan(writers: LiveWriters) -> Self {
        Self {
            feed: Feed::Live {
                writers,
                hang_up_on_close: false,
            },
            ..Self::live(LiveWriters::default())
        }
    }

    fn refusing() -> Self {
        Self {
            driver: String::from("fake"),
            feed: Feed::Refuse,
            counters: Counters::default(),
        }
    }

    fn counters(&self) -> Counters {
        self.counters.clone()
    }
}

fn live_source(slot: &Mutex<Option<PipeWriter>>) -> LineSource {
    let (reader, writer) = io::pipe().expect("create pipe");
    *slot.lock().expect("writer lock") = Some(writer);
    Box::new(BufReader::new(reader))
}

impl BinaryExecutor for FakeExecutor {
    fn driver_name(&self) -> &str {
        &self.driver
    }

    fn start(&mut self) -> Result<PluginStreams, PluginError> {
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        match &self.feed {
            Feed::Scripted { stdout, stderr } => Ok(PluginStreams {
                stdout: Box::new(Cursor::new(stdout.clone().into_bytes())),
                stderr: Box::new(Cursor::new(stderr.clone().into_bytes())),
            }),
            Feed::Live { writers, .. } => Ok(PluginStreams {
                stdout: live_source(&writers.stdout),
                stderr: live_source(&writers.stderr),
            }),
            Feed::Refuse => Err(PluginError::StartFailed {
                driver: self.driver.clone(),
                stage: crate::error::StartStage::Spawn,
                source: Arc::new(io::Error::from(io::ErrorKind::PermissionDenied)),
            }),
        }
    }

    fn close(&mut self) -> Result<(), PluginError> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        if let Feed::Live {
            writers,
            hang_up_on_close: true,
        } = &self.feed
        {
            writers.hang_up();
        }
        Ok(())
    }
}

fn drain(rx: &Receiver<Forwarded>) -> Vec<Forwarded> {
    rx.try_iter().collect()
}

fn stdout_line(machine: &str, line: &str) -> Forwarded {
    Forwarded::Stdout(machine.to_owned(), line.to_owned())
}

fn spawn_serve<E: BinaryExecutor + 'static>(
    plugin: &Arc<Plugin<E>>,
) -> thread::JoinHandle<Result<(), PluginError>> {
    let serving = Arc::clone(plugin);
    thread::spawn(move || serving.serve())
}

#[rstest]
fn address_and_first_log_line_are_delivered() {
    let executor = FakeExecutor::scripted("127.0.0.1:9000\nhello\n", "");
    let counters = executor.counters();
    let (sink, rx) = channel_sink();
    let plugin = Plugin::new(executor)
        .with_machine_name("node-1")
        .with_log_sink(sink);

    plugin.serve().expect("serve");

    assert_eq!(plugin.address().expect("address"), "127.0.0.1:9000");
    assert_eq!(drain(&rx), [stdout_line("node-1", "hello")]);
    assert_eq!(plugin.state(), SessionState::Closed);
    assert_eq!(counters.closes(), 1);
}

#[rstest]
fn address_is_trimmed_of_surrounding_whitespace() {
    let plugin = Plugin::new(FakeExecutor::scripted("  10.0.0.5:2376 \r\n", ""));
    plugin.serve().expect("serve");
    assert_eq!(plugin.address().expect("address"), "10.0.0.5:2376");
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(250)]
fn every_log_line_is_forwarded_once_in_order(#[case] count: usize) {
    let mut stdout = String::from("127.0.0.1:9000\n");
    for n in 0..count {
        stdout.push_str(&format!("line {n}\n"));
    }
    let (sink, rx) = channel_sink();
    let plugin = Plugin::new(FakeExecutor::scripted(&stdout, "")).with_log_sink(sink);

    plugin.serve().expect("serve");

    let expected: Vec<Forwarded> = (0..count)
        .map(|n| stdout_line("fake", &format!("line {n}")))
        .collect();
    assert_eq!(drain(&rx), expected);
}

#[rstest]
fn address_line_never_reaches_the_sink() {
    let (sink, rx) = channel_sink();
    let plugin =
        Plugin::new(FakeExecutor::scripted("127.0.0.1:9000\n", "")).with_log_sink(sink);
    plugin.serve().expect("serve");
    assert!(drain(&rx).is_empty());
}

#[rstest]
fn stderr_lines_are_forwarded_as_debug() {
    let mut sink = MockSink::new();
    sink.expect_plugin_stdout().never();
    sink.expect_plugin_stderr()
        .withf(|machine, line| machine == "node-2" && line == "dialling api")
        .times(1)
        .return_const(());
    let plugin = Plugin::new(FakeExecutor::scripted("127.0.0.1:1\n", "dialling api\n"))
        .with_machine_name("node-2")
        .with_log_sink(Arc::new(sink));

    plugin.serve().expect("serve");
}

#[rstest]
fn empty_stdout_is_a_handshake_failure() {
    let executor = FakeExecutor::scripted("", "boom\n");
    let counters = executor.counters();
    let plugin = Plugin::new(executor);

    let error = plugin.serve().expect_err("handshake should fail");

    assert!(matches!(error, PluginError::Handshake { .. }), "{error:?}");
    assert_eq!(plugin.state(), SessionState::Failed);
    assert_eq!(counters.closes(), 1);
    assert!(matches!(
        plugin.address(),
        Err(PluginError::AddressUnavailable { .. })
    ));
}

#[rstest]
fn blank_address_line_is_a_handshake_failure() {
    let plugin = Plugin::new(FakeExecutor::scripted("   \nlater\n", ""));
    let error = plugin.serve().expect_err("handshake should fail");
    assert!(error.to_string().contains("empty address"), "{error}");
}

#[rstest]
fn start_failure_fails_the_session() {
    let executor = FakeExecutor::refusing();
    let counters = executor.counters();
    let plugin = Plugin::new(executor).with_address_timeout(WAIT);

    let error = plugin.serve().expect_err("start should fail");

    assert!(matches!(error, PluginError::StartFailed { .. }));
    assert_eq!(plugin.state(), SessionState::Failed);
    assert_eq!(counters.starts(), 1);
    assert!(matches!(
        plugin.address(),
        Err(PluginError::AddressUnavailable { .. })
    ));
}

#[rstest]
fn address_times_out_then_succeeds_once_announced() {
    let writers = LiveWriters::default();
    let plugin = Arc::new(
        Plugin::new(FakeExecutor::live(writers.clone()))
            .with_address_timeout(Duration::from_millis(50)),
    );
    let serving = spawn_serve(&plugin);
    writers.wait_until_started();

    let error = plugin.address().expect_err("no address yet");
    assert!(error.is_recoverable());
    assert!(matches!(error, PluginError::AddressTimeout { timeout_ms: 50, .. }));

    writers.write_stdout("127.0.0.1:9000\n");
    let address = loop {
        match plugin.address() {
            Ok(address) => break address,
            Err(PluginError::AddressTimeout { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    };
    assert_eq!(address, "127.0.0.1:9000");

    plugin.close().expect("close");
    serving.join().expect("serve thread").expect("serve result");
    assert_eq!(plugin.address().expect("cached"), "127.0.0.1:9000");
}

#[rstest]
fn repeated_address_calls_return_the_cached_value() {
    let plugin = Plugin::new(FakeExecutor::scripted("127.0.0.1:9000\n", ""));
    plugin.serve().expect("serve");
    let first = plugin.address().expect("first");
    let second = plugin.address().expect("second");
    assert_eq!(first, second);
}

#[rstest]
fn stop_ends_dispatch_and_closes_pipes() {
    let writers = LiveWriters::default();
    let executor = FakeExecutor::live(writers.clone());
    let counters = executor.counters();
    let (sink, rx) = channel_sink();
    let plugin = Arc::new(
        Plugin::new(executor)
            .with_machine_name("node-3")
            .with_log_sink(sink)
            .with_address_timeout(WAIT),
    );
    let serving = spawn_serve(&plugin);
    writers.wait_until_started();

    writers.write_stdout("127.0.0.1:9000\nready\n");
    writers.write_stderr("detail\n");
    assert_eq!(plugin.address().expect("address"), "127.0.0.1:9000");
    let mut seen = vec![
        rx.recv_timeout(WAIT).expect("first line"),
        rx.recv_timeout(WAIT).expect("second line"),
    ];
    seen.sort_by_key(|forwarded| matches!(forwarded, Forwarded::Stderr(..)));
    assert_eq!(
        seen,
        [
            stdout_line("node-3", "ready"),
            Forwarded::Stderr(String::from("node-3"), String::from("detail")),
        ]
    );

    plugin.close().expect("close");
    serving.join().expect("serve thread").expect("serve result");

    assert_eq!(plugin.state(), SessionState::Closed);
    assert_eq!(counters.closes(), 1);
    assert!(drain(&rx).is_empty());
}

#[rstest]
fn nothing_is_forwarded_after_stop_even_if_the_plugin_keeps_writing() {
    let writers = LiveWriters::default();
    let (sink, rx) = channel_sink();
    let plugin = Arc::new(
        Plugin::new(FakeExecutor::orphan(writers.clone()))
            .with_log_sink(sink)
            .with_address_timeout(WAIT),
    );
    let serving = spawn_serve(&plugin);
    writers.wait_until_started();
    writers.write_stdout("127.0.0.1:9000\n");
    plugin.address().expect("address");

    plugin.close().expect("close");
    writers.write_stdout("late stdout\n");
    writers.write_stderr("late stderr\n");
    serving.join().expect("serve thread").expect("serve result");
    writers.write_stdout("later still\n");

    assert!(drain(&rx).is_empty());
    writers.hang_up();
}

#[rstest]
fn close_before_serve_prevents_start() {
    let executor = FakeExecutor::scripted("127.0.0.1:9000\n", "");
    let counters = executor.counters();
    let plugin = Plugin::new(executor);

    plugin.close().expect("close");
    plugin.serve().expect("serve after close is a no-op");

    assert_eq!(counters.starts(), 0);
    assert_eq!(plugin.state(), SessionState::Closed);
    assert!(matches!(
        plugin.address(),
        Err(PluginError::AddressUnavailable { .. })
    ));
}

#[rstest]
fn second_serve_is_rejected() {
    let plugin = Plugin::new(FakeExecutor::scripted("127.0.0.1:9000\n", ""));
    plugin.serve().expect("first serve");
    let error = plugin.serve().expect_err("second serve");
    assert!(matches!(
        error,
        PluginError::InvalidState {
            operation: "serve",
            ..
        }
    ));
}

#[rstest]
fn close_during_handshake_stops_without_an_address() {
    let writers = LiveWriters::default();
    let executor = FakeExecutor::live(writers.clone());
    let counters = executor.counters();
    let plugin = Arc::new(Plugin::new(executor).with_address_timeout(WAIT));
    let serving = spawn_serve(&plugin);
    writers.wait_until_started();

    while plugin.state() != SessionState::AwaitingAddress {
        thread::sleep(Duration::from_millis(5));
    }
    plugin.close().expect("close");
    serving.join().expect("serve thread").expect("serve result");

    assert_eq!(counters.closes(), 1);
    assert!(matches!(
        plugin.address(),
        Err(PluginError::AddressUnavailable { .. })
    ));
}

#[rstest]
fn concurrent_close_calls_never_block() {
    let writers = LiveWriters::default();
    let plugin = Arc::new(Plugin::new(FakeExecutor::live(writers.clone())));
    let serving = spawn_serve(&plugin);
    writers.wait_until_started();
    writers.write_stdout("127.0.0.1:9000\n");
    plugin.address().expect("address");

    let closers: Vec<_> = (0..8)
        .map(|_| {
            let closing = Arc::clone(&plugin);
            thread::spawn(move || closing.close())
        })
        .collect();
    for closer in closers {
        closer.join().expect("closer thread").expect("close result");
    }
    serving.join().expect("serve thread").expect("serve result");
    plugin.close().expect("close after termination");
    assert!(plugin.is_stopping());
}

#[rstest]
fn plugin_is_usable_through_both_capabilities() {
    fn exercise(plugin: &dyn DriverPlugin) -> String {
        let stream = plugin
            .attach_stream("stdout", Box::new(Cursor::new(b"direct\n".to_vec())))
            .expect("attach");
        let line = stream.lines().recv_timeout(WAIT).expect("line");
        plugin.close().expect("close");
        line
    }
    let plugin = Plugin::new(FakeExecutor::scripted("", ""));
    assert_eq!(exercise(&plugin), "direct");
    assert_eq!(plugin.driver(), "fake");
    assert_eq!(plugin.machine_name(), "fake");
}
