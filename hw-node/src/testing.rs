//! Fakes shared by the unit tests.

use std::{
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tracing::subscriber::DefaultGuard;

use crate::{
    console::{Capture, ConsoleOrigin, ConsoleSource, ReadError},
    directory::{IpAssignment, NodeRecord},
    subprocess::{CommandOutput, CommandRunner, CommandSpec, ExecutionError},
};

pub fn test_node(name: &str, bmc_ip: &str) -> NodeRecord {
    NodeRecord {
        name: name.to_owned(),
        ip: "1.2.3.10".to_owned(),
        mac: "aa:bb:cc:dd:68:70".to_owned(),
        ip_type: IpAssignment::Static,
        bmc_ip: bmc_ip.to_owned(),
        bmc_mac: "aa:bb:cc:dd:68:71".to_owned(),
        bmc_ip_type: IpAssignment::Static,
        hsm_ip: None,
        hsm_mac: None,
        hsm_ip_type: None,
        machine_type: None,
        arch: None,
        comment: String::new(),
        exclude: None,
    }
}

/// Log output written to a buffer instead of stdout, for tests that check what is logged.
/// Only captures events from the current thread while the value is alive.
pub struct CapturedLogs {
    buffer: Arc<Mutex<Vec<u8>>>,
    _guard: DefaultGuard,
}

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
    }
}

#[derive(Clone)]
struct LogWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn capture_logs() -> CapturedLogs {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let writer = LogWriter(buffer.clone());

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();

    CapturedLogs {
        buffer,
        _guard: tracing::subscriber::set_default(subscriber),
    }
}

/// Records every command it is asked to run and answers with a canned output.
pub struct RecordingRunner {
    output: CommandOutput,
    calls: Mutex<Vec<CommandSpec>>,
    delay: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl RecordingRunner {
    pub fn succeeding() -> Self {
        Self::with_output(CommandOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    pub fn failing(exit_code: i32, stderr: &str) -> Self {
        Self::with_output(CommandOutput {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.to_owned(),
        })
    }

    pub fn with_output(output: CommandOutput) -> Self {
        Self {
            output,
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every run takes `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Highest number of runs that were in progress at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn argvs(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().iter().map(CommandSpec::argv).collect()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(CommandSpec::command_line)
            .collect()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ExecutionError> {
        self.calls.lock().unwrap().push(command.clone());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);

        // Give other tasks a chance to run so concurrent tests actually interleave
        tokio::task::yield_now().await;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }
}

/// A console that plays back a script of captures, one per call, repeating the last one.
pub struct ScriptedConsole {
    captures: Mutex<VecDeque<Option<String>>>,
    last: Mutex<Option<String>>,
    calls: Mutex<usize>,
    marks: Mutex<usize>,
}

impl ScriptedConsole {
    /// `None` entries make the capture fail as if the log did not exist yet.
    pub fn new(script: Vec<Option<&str>>) -> Self {
        Self {
            captures: Mutex::new(script.into_iter().map(|c| c.map(str::to_owned)).collect()),
            last: Mutex::new(None),
            calls: Mutex::new(0),
            marks: Mutex::new(0),
        }
    }

    pub fn repeating(text: &str) -> Self {
        Self::new(vec![Some(text)])
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }

    pub fn mark_count(&self) -> usize {
        *self.marks.lock().unwrap()
    }

    pub fn record_mark(&self) {
        *self.marks.lock().unwrap() += 1;
    }
}

#[async_trait]
impl ConsoleSource for ScriptedConsole {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn mark(&mut self) -> Result<(), ReadError> {
        self.record_mark();
        Ok(())
    }

    async fn capture(&self) -> Result<Capture, ReadError> {
        *self.calls.lock().unwrap() += 1;

        let next = {
            let mut captures = self.captures.lock().unwrap();
            let mut last = self.last.lock().unwrap();
            if let Some(next) = captures.pop_front() {
                *last = next;
            }
            last.clone()
        };

        match next {
            Some(text) => Ok(Capture {
                text,
                origin: ConsoleOrigin::Replay,
                partial_first_line: false,
            }),
            None => Err(ReadError::Io {
                path: "scripted".into(),
                err: std::io::Error::from(std::io::ErrorKind::NotFound),
            }),
        }
    }
}

/// Shared handle so a test can keep inspecting a console it handed to the orchestrator.
pub struct SharedConsole(pub Arc<ScriptedConsole>);

#[async_trait]
impl ConsoleSource for SharedConsole {
    fn name(&self) -> &str {
        "shared"
    }

    async fn mark(&mut self) -> Result<(), ReadError> {
        self.0.record_mark();
        Ok(())
    }

    async fn capture(&self) -> Result<Capture, ReadError> {
        self.0.capture().await
    }
}
