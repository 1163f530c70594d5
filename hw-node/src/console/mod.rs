//! Reading a node's serial console and finding out what it last said.
//!
//! Console captures are full of cursor positioning and colour codes, and log files keep
//! output from before the node was rebooted. Finding the node's current state is a two
//! stage pipeline: [`strip_escape_sequences`] cleans a single line and [`scan_backward`]
//! walks the capture from the newest line until one survives the [`is_meaningful`] check.

mod escape;
mod source;

use std::{borrow::Cow, path::PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::subprocess::ExecutionError;

pub use escape::{is_meaningful, strip_escape_sequences};
pub use source::{Capture, ConmanConsole, ConsoleLogFile, ConsoleSource, DEFAULT_WINDOW_BYTES};

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("No meaningful output on console {console}")]
    Empty { console: String },
    #[error("Failed to read console log {path}: {err}")]
    Io { path: PathBuf, err: std::io::Error },
    #[error("Console client failed: {0}")]
    Client(#[from] ExecutionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleOrigin {
    /// Read from a live console connection.
    Live,
    /// Read back from a log of buffered console output.
    Replay,
}

/// A console line with escape sequences removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsoleLine {
    pub text: String,
    /// Index of the physical line within the captured window, higher is more recent.
    pub position: usize,
    pub origin: ConsoleOrigin,
}

/// Walks `lines` from the end and returns the first one accepted by `is_meaningful`
/// together with its index.
pub fn scan_backward<T>(lines: &[T], is_meaningful: impl Fn(&T) -> bool) -> Option<(usize, &T)> {
    lines
        .iter()
        .enumerate()
        .rev()
        .find(|(_, line)| is_meaningful(line))
}

/// Finds the most recent meaningful line in a block of console text.
///
/// When `skip_first` is set the first physical line is ignored because the capture
/// started part way through it.
pub fn find_last_meaningful_line(
    text: &str,
    origin: ConsoleOrigin,
    skip_first: bool,
) -> Option<ConsoleLine> {
    let mut stripped: Vec<Cow<'_, str>> = text.split('\n').map(strip_escape_sequences).collect();

    if skip_first && !stripped.is_empty() {
        stripped[0] = Cow::Borrowed("");
    }

    scan_backward(&stripped, |line| is_meaningful(line)).map(|(position, line)| ConsoleLine {
        text: line.to_string(),
        position,
        origin,
    })
}

/// Captures `console` and returns its most recent meaningful line.
pub async fn last_meaningful_line(console: &dyn ConsoleSource) -> Result<ConsoleLine, ReadError> {
    let capture = console.capture().await?;

    find_last_meaningful_line(&capture.text, capture.origin, capture.partial_first_line).ok_or_else(
        || ReadError::Empty {
            console: console.name().to_owned(),
        },
    )
}
