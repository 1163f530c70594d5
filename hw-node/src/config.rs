use std::{num::NonZeroUsize, path::PathBuf, time::Duration};

use crate::{
    console::{ConmanConsole, ConsoleLogFile, ConsoleSource, DEFAULT_WINDOW_BYTES},
    directory::{DirectoryError, NodeDirectory, NodeRecord},
    power::IpmiSettings,
    readiness::ReadinessSettings,
    salt::SaltSettings,
};

pub const DEFAULT_CONMAN_LOG_DIR: &str = "/var/log/conman";
pub const DEFAULT_CONMAN_LOG_PREFIX: &str = "console.";
pub const DEFAULT_POWER_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Where node consoles are read from.
#[derive(Debug, Clone)]
pub enum ConsoleSettings {
    /// Log files written by the console manager, one per node named `{prefix}{short name}`.
    LogDirectory {
        dir: PathBuf,
        file_prefix: String,
        window_bytes: u64,
    },
    /// Live sessions through the conman client.
    Conman {
        bin: String,
        server: String,
        capture_window: Duration,
    },
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        ConsoleSettings::LogDirectory {
            dir: PathBuf::from(DEFAULT_CONMAN_LOG_DIR),
            file_prefix: DEFAULT_CONMAN_LOG_PREFIX.to_owned(),
            window_bytes: DEFAULT_WINDOW_BYTES,
        }
    }
}

impl ConsoleSettings {
    pub fn console_for(&self, node: &NodeRecord) -> Box<dyn ConsoleSource> {
        match self {
            ConsoleSettings::LogDirectory {
                dir,
                file_prefix,
                window_bytes,
            } => {
                let path = dir.join(format!("{}{}", file_prefix, node.short_name()));
                Box::new(ConsoleLogFile::new(path).with_window_bytes(*window_bytes))
            }
            ConsoleSettings::Conman {
                bin,
                server,
                capture_window,
            } => Box::new(ConmanConsole::new(
                bin,
                server,
                node.short_name(),
                *capture_window,
            )),
        }
    }
}

/// Everything the bootstrap components need, resolved once at start up and passed in.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub ipmi: IpmiSettings,
    pub console: ConsoleSettings,
    pub readiness: ReadinessSettings,
    pub salt: SaltSettings,
    pub power_timeout: Duration,
    pub apply_timeout: Duration,
    pub max_concurrency: NonZeroUsize,
}

impl BootstrapConfig {
    pub fn new(ipmi: IpmiSettings, salt: SaltSettings) -> Self {
        Self {
            ipmi,
            console: ConsoleSettings::default(),
            readiness: ReadinessSettings::default(),
            salt,
            power_timeout: DEFAULT_POWER_TIMEOUT,
            apply_timeout: DEFAULT_APPLY_TIMEOUT,
            max_concurrency: NonZeroUsize::new(DEFAULT_MAX_CONCURRENCY).unwrap_or(NonZeroUsize::MIN),
        }
    }

    /// Defaults with credentials taken from the inventory options `ipmi_user`, `ipmi_pass`
    /// and `ssh_pass`. The SSH password may be absent, in which case it is empty.
    pub fn from_directory(directory: &NodeDirectory) -> Result<Self, DirectoryError> {
        let ipmi = IpmiSettings::new(
            directory.require_string_option("ipmi_user")?,
            directory.require_string_option("ipmi_pass")?,
        );
        let salt = SaltSettings::new(directory.string_option("ssh_pass").unwrap_or_default());

        Ok(Self::new(ipmi, salt))
    }
}
