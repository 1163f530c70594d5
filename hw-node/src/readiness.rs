use std::{fmt, num::NonZeroU32, time::Duration};

use common::throttle::BackOffDelay;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::console::{last_meaningful_line, ConsoleLine, ConsoleSource};

pub const DEFAULT_READY_PATTERN: &str = "login:";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 60;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Readiness was never observed within the attempt budget.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("Console not ready after {attempts_made} attempts, last line seen: {last_line_seen:?}")]
pub struct TimeoutError {
    pub attempts_made: u32,
    pub last_line_seen: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error("Waiting for console cancelled after {attempts_made} attempts")]
    Cancelled { attempts_made: u32 },
}

/// What a console line must look like for the node to count as booted.
#[derive(Clone)]
pub enum ReadyPattern {
    Substring(String),
    Prefix(String),
    Regex(Regex),
}

impl ReadyPattern {
    pub fn matches(&self, line: &str) -> bool {
        match self {
            ReadyPattern::Substring(s) => line.contains(s.as_str()),
            ReadyPattern::Prefix(p) => line.trim_start().starts_with(p.as_str()),
            ReadyPattern::Regex(re) => re.is_match(line),
        }
    }
}

impl Default for ReadyPattern {
    fn default() -> Self {
        ReadyPattern::Substring(DEFAULT_READY_PATTERN.to_owned())
    }
}

impl fmt::Debug for ReadyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadyPattern::Substring(s) => write!(f, "Substring({s:?})"),
            ReadyPattern::Prefix(p) => write!(f, "Prefix({p:?})"),
            ReadyPattern::Regex(re) => write!(f, "Regex({:?})", re.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReadinessSettings {
    pub pattern: ReadyPattern,
    pub max_attempts: NonZeroU32,
    /// Delay before the second attempt.
    pub interval: Duration,
    /// Upper bound for the delay, equal to `interval` for a fixed poll rate.
    pub max_interval: Duration,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            pattern: ReadyPattern::default(),
            max_attempts: NonZeroU32::new(DEFAULT_MAX_ATTEMPTS).unwrap_or(NonZeroU32::MIN),
            interval: DEFAULT_POLL_INTERVAL,
            max_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Polls a console until its last meaningful line matches the ready pattern.
#[derive(Debug, Clone)]
pub struct ReadinessDetector {
    settings: ReadinessSettings,
}

impl ReadinessDetector {
    pub fn new(settings: ReadinessSettings) -> Self {
        Self { settings }
    }

    /// Reads the console at most `max_attempts` times, sleeping between attempts but not
    /// after the last one. Unreadable or empty consoles count as a failed attempt.
    pub async fn wait_until_ready(
        &self,
        console: &dyn ConsoleSource,
        cancel: &CancellationToken,
    ) -> Result<ConsoleLine, WaitError> {
        let max_attempts = self.settings.max_attempts.get();
        let mut delay = BackOffDelay::new(self.settings.interval, self.settings.max_interval);
        let mut last_line_seen: Option<String> = None;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(WaitError::Cancelled {
                    attempts_made: attempt - 1,
                });
            }

            match last_meaningful_line(console).await {
                Ok(line) => {
                    if self.settings.pattern.matches(&line.text) {
                        tracing::info!(
                            "Console {} ready after {} attempts: {}",
                            console.name(),
                            attempt,
                            line.text
                        );
                        return Ok(line);
                    }

                    tracing::debug!(
                        "Console {} not ready ({}/{}), last line: {}",
                        console.name(),
                        attempt,
                        max_attempts,
                        line.text
                    );
                    last_line_seen = Some(line.text);
                }
                Err(e) => {
                    tracing::debug!(
                        "Console {} not readable ({}/{}): {}",
                        console.name(),
                        attempt,
                        max_attempts,
                        e
                    );
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(WaitError::Cancelled { attempts_made: attempt });
                    }
                    _ = delay.wait() => {}
                }
            }
        }

        tracing::warn!(
            "Console {} not ready after {} attempts",
            console.name(),
            max_attempts
        );

        Err(WaitError::Timeout(TimeoutError {
            attempts_made: max_attempts,
            last_line_seen,
        }))
    }
}
