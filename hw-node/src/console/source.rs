use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncSeekExt},
    sync::Mutex,
};

use crate::subprocess::{CommandSpec, OutputTail, TailSnapshot};

use super::{ConsoleOrigin, ReadError};

/// How much of the end of a console we look at.
pub const DEFAULT_WINDOW_BYTES: u64 = 64 * 1024;

/// Raw console text captured from a source.
#[derive(Debug, Clone)]
pub struct Capture {
    pub text: String,
    pub origin: ConsoleOrigin,
    /// The capture starts part way through a line.
    pub partial_first_line: bool,
}

#[async_trait]
pub trait ConsoleSource: Send + Sync {
    fn name(&self) -> &str;

    /// Remember the current end of the console so that later captures only contain output
    /// produced after this point.
    async fn mark(&mut self) -> Result<(), ReadError> {
        Ok(())
    }

    async fn capture(&self) -> Result<Capture, ReadError>;
}

/// A console log file written by the console manager, e.g. `/var/log/conman/console.ses-client-3`.
#[derive(Debug, Clone)]
pub struct ConsoleLogFile {
    name: String,
    path: PathBuf,
    window_bytes: u64,
    baseline: Option<u64>,
}

impl ConsoleLogFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_owned();
        Self {
            name: path.display().to_string(),
            path,
            window_bytes: DEFAULT_WINDOW_BYTES,
            baseline: None,
        }
    }

    pub fn with_window_bytes(mut self, window_bytes: u64) -> Self {
        self.window_bytes = window_bytes.max(1);
        self
    }

    fn io_error(&self, err: io::Error) -> ReadError {
        ReadError::Io {
            path: self.path.clone(),
            err,
        }
    }
}

#[async_trait]
impl ConsoleSource for ConsoleLogFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn mark(&mut self) -> Result<(), ReadError> {
        let len = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata.len(),
            // The console manager creates the log on first output
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => return Err(self.io_error(err)),
        };

        tracing::debug!("Marking console log {} at offset {}", self.name, len);
        self.baseline = Some(len);

        Ok(())
    }

    async fn capture(&self) -> Result<Capture, ReadError> {
        let mut file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|err| self.io_error(err))?;
        let len = file
            .metadata()
            .await
            .map_err(|err| self.io_error(err))?
            .len();

        // A log shorter than the mark has been rotated or truncated, start over
        let baseline = match self.baseline {
            Some(baseline) if baseline <= len => baseline,
            Some(baseline) => {
                tracing::debug!(
                    "Console log {} shrank below mark ({} < {}), reading from start",
                    self.name,
                    len,
                    baseline
                );
                0
            }
            None => 0,
        };
        let start = baseline.max(len.saturating_sub(self.window_bytes));

        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|err| self.io_error(err))?;

        let mut bytes = Vec::with_capacity((len - start) as usize);
        file.read_to_end(&mut bytes)
            .await
            .map_err(|err| self.io_error(err))?;

        Ok(Capture {
            text: String::from_utf8_lossy(&bytes).into_owned(),
            origin: ConsoleOrigin::Replay,
            partial_first_line: start > baseline,
        })
    }
}

/// A live console session through the conman client, `conman -d <server> -j <console>`.
///
/// conman does not replay history when a client joins, so the session is held open and its
/// output collected in the background. `mark` joins afresh, dropping anything seen before.
/// A capture without a session joins and waits `capture_window` for output first.
#[derive(Debug)]
pub struct ConmanConsole {
    name: String,
    command: CommandSpec,
    capture_window: Duration,
    window_bytes: usize,
    session: Mutex<Option<OutputTail>>,
}

impl ConmanConsole {
    pub fn new(conman_bin: &str, server: &str, console_name: &str, capture_window: Duration) -> Self {
        Self {
            name: format!("{console_name}@{server}"),
            command: conman_command(conman_bin, server, console_name),
            capture_window,
            window_bytes: DEFAULT_WINDOW_BYTES as usize,
            session: Mutex::new(None),
        }
    }

    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    fn join(&self) -> Result<OutputTail, ReadError> {
        tracing::debug!("Joining console {}", self.name);
        Ok(OutputTail::spawn(&self.command, self.window_bytes)?)
    }
}

pub fn conman_command(conman_bin: &str, server: &str, console_name: &str) -> CommandSpec {
    CommandSpec::new(conman_bin).args(["-d", server, "-j", console_name])
}

#[async_trait]
impl ConsoleSource for ConmanConsole {
    fn name(&self) -> &str {
        &self.name
    }

    async fn mark(&mut self) -> Result<(), ReadError> {
        let session = self.join()?;
        *self.session.get_mut() = Some(session);
        Ok(())
    }

    async fn capture(&self) -> Result<Capture, ReadError> {
        let mut session = self.session.lock().await;

        if let Some(tail) = session.as_ref().filter(|tail| !tail.is_finished()) {
            return Ok(live_capture(tail.snapshot().await));
        }

        let previous = session.take();
        if previous.is_some() {
            tracing::warn!("Console client for {} exited, joining again", self.name);
        }

        let tail = session.insert(self.join()?);
        tokio::time::sleep(self.capture_window).await;
        let mut snapshot = tail.snapshot().await;

        // Keep what the exited client saw in front of the new output
        if let Some(previous) = previous {
            let old = previous.snapshot().await;
            snapshot.text = old.text + &snapshot.text;
            snapshot.truncated |= old.truncated;
        }

        Ok(live_capture(snapshot))
    }
}

fn live_capture(snapshot: TailSnapshot) -> Capture {
    Capture {
        text: snapshot.text,
        origin: ConsoleOrigin::Live,
        partial_first_line: snapshot.truncated,
    }
}
