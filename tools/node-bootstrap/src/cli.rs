use std::{
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    time::Duration,
};

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use common::clap::Password;
use hw_node::{
    config::{DEFAULT_CONMAN_LOG_DIR, DEFAULT_CONMAN_LOG_PREFIX},
    console::DEFAULT_WINDOW_BYTES,
    power::{IpmiSettings, DEFAULT_IPMI_INTERFACE, DEFAULT_IPMI_TOOL},
    readiness::{ReadinessSettings, ReadyPattern, DEFAULT_READY_PATTERN},
    salt::{SaltSettings, DEFAULT_ROSTER_FILE, DEFAULT_SALT_SSH_TOOL, DEFAULT_STATE_LOG_LEVEL},
    BootstrapConfig, ConsoleSettings, NodeDirectory,
};
use regex::Regex;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
pub struct Cli {
    /// Path to the node inventory JSON file
    #[clap(long, short = 'c', env = "NODE_INVENTORY", global = true, default_value = "nodes.json")]
    pub config_file: PathBuf,

    #[command(flatten)]
    pub ipmi: IpmiArgs,
    #[command(flatten)]
    pub console: ConsoleArgs,
    #[command(flatten)]
    pub readiness: ReadinessArgs,
    #[command(flatten)]
    pub salt: SaltArgs,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List the nodes in the inventory
    #[clap(alias = "ls")]
    ListNodes {
        /// Include nodes marked as excluded
        #[clap(long)]
        all: bool,
    },
    /// Power cycle a node through its management controller
    PowerCycle {
        /// Fully qualified node name as written in the inventory
        node: String,
    },
    /// Print the last meaningful line of a node's console
    LastLine { node: String },
    /// Poll a node's console until it shows the ready pattern
    WaitReady { node: String },
    /// Apply a salt state to a node with salt-ssh
    Apply { node: String, state: String },
    /// Power cycle, wait for the console and apply a salt state.
    ///
    /// Examples:
    ///   # Bootstrap two nodes
    ///   node-bootstrap bootstrap base --node ses-client-3.a.b.de --node ses-client-4.a.b.de
    ///
    ///   # Bootstrap every node that is not excluded, six at a time
    ///   node-bootstrap bootstrap base --max-concurrency 6 --report report.json
    Bootstrap {
        /// The salt state to apply once the node is up
        state: String,
        /// Nodes to bootstrap. Every node not marked as excluded if omitted.
        #[clap(long = "node")]
        nodes: Vec<String>,
        /// How many nodes are bootstrapped at the same time
        #[clap(long, default_value = "4")]
        max_concurrency: NonZeroUsize,
        /// Write the results as JSON to this file
        #[clap(long)]
        report: Option<PathBuf>,
    },
}

/// Management controller access.
#[derive(Args, Clone, Debug)]
pub struct IpmiArgs {
    #[clap(long, env = "IPMI_TOOL", global = true, default_value = DEFAULT_IPMI_TOOL)]
    pub ipmi_tool: String,
    /// Overrides `ipmi_user` from the inventory
    #[clap(long, env = "IPMI_USER", global = true)]
    pub ipmi_user: Option<String>,
    /// Overrides `ipmi_pass` from the inventory
    #[clap(long, env = "IPMI_PASS", global = true)]
    pub ipmi_pass: Option<Password>,
    #[clap(long, global = true, default_value = DEFAULT_IPMI_INTERFACE)]
    pub ipmi_interface: String,
    /// Echo the power commands instead of running them
    #[clap(long, global = true)]
    pub dry_run: bool,
    /// Seconds before a power command is killed
    #[clap(long, global = true, default_value = "60")]
    pub power_timeout_secs: u64,
}

/// Where consoles are read from.
#[derive(Args, Clone, Debug)]
pub struct ConsoleArgs {
    /// Directory with the console manager's per node log files
    #[clap(long, env = "CONSOLE_LOG_DIR", global = true, default_value = DEFAULT_CONMAN_LOG_DIR)]
    pub console_log_dir: PathBuf,
    #[clap(long, global = true, default_value = DEFAULT_CONMAN_LOG_PREFIX)]
    pub console_log_prefix: String,
    /// Read consoles live through this conman server instead of the log files
    #[clap(long, env = "CONMAN_SERVER", global = true)]
    pub conman_server: Option<String>,
    #[clap(long, global = true, default_value = "conman")]
    pub conman_bin: String,
    /// Seconds of live console output collected per poll
    #[clap(long, global = true, default_value = "5")]
    pub capture_window_secs: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum PatternKind {
    Substring,
    Prefix,
    Regex,
}

/// When a node counts as booted.
#[derive(Args, Clone, Debug)]
pub struct ReadinessArgs {
    #[clap(long, global = true, default_value = DEFAULT_READY_PATTERN)]
    pub ready_pattern: String,
    #[clap(long, global = true, value_enum, default_value_t = PatternKind::Substring)]
    pub ready_pattern_kind: PatternKind,
    /// How many times the console is read before giving up
    #[clap(long, global = true, default_value = "60")]
    pub max_attempts: NonZeroU32,
    /// Seconds between console reads
    #[clap(long, global = true, default_value = "10")]
    pub poll_interval_secs: u64,
    /// Grow the interval linearly up to this many seconds
    #[clap(long, global = true)]
    pub max_poll_interval_secs: Option<u64>,
}

impl ReadinessArgs {
    fn settings(&self) -> anyhow::Result<ReadinessSettings> {
        let pattern = match self.ready_pattern_kind {
            PatternKind::Substring => ReadyPattern::Substring(self.ready_pattern.clone()),
            PatternKind::Prefix => ReadyPattern::Prefix(self.ready_pattern.clone()),
            PatternKind::Regex => ReadyPattern::Regex(regex_pattern(&self.ready_pattern)?),
        };
        let interval = Duration::from_secs(self.poll_interval_secs);
        let max_interval = self
            .max_poll_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(interval);

        Ok(ReadinessSettings {
            pattern,
            max_attempts: self.max_attempts,
            interval,
            max_interval,
        })
    }
}

fn regex_pattern(pattern: &str) -> anyhow::Result<Regex> {
    Regex::new(pattern).with_context(|| format!("Invalid ready pattern '{}'", pattern))
}

/// Remote configuration with salt-ssh.
#[derive(Args, Clone, Debug)]
pub struct SaltArgs {
    #[clap(long, env = "SALT_SSH_TOOL", global = true, default_value = DEFAULT_SALT_SSH_TOOL)]
    pub salt_ssh_tool: String,
    #[clap(long, env = "ROSTER_FILE", global = true, default_value = DEFAULT_ROSTER_FILE)]
    pub roster_file: PathBuf,
    /// Salt configuration directory passed to salt-ssh as `-c`
    #[clap(long, global = true, default_value = ".")]
    pub salt_config_root: PathBuf,
    /// Overrides `ssh_pass` from the inventory
    #[clap(long, env = "SSH_PASS", global = true)]
    pub ssh_pass: Option<Password>,
    #[clap(long, global = true, default_value = DEFAULT_STATE_LOG_LEVEL)]
    pub state_log_level: String,
    /// Seconds before a state apply is killed
    #[clap(long, global = true, default_value = "1800")]
    pub apply_timeout_secs: u64,
}

impl Cli {
    /// Builds the configuration object, taking credentials from the flags first and the
    /// inventory options second.
    pub fn bootstrap_config(&self, directory: &NodeDirectory) -> anyhow::Result<BootstrapConfig> {
        let ipmi_user = match &self.ipmi.ipmi_user {
            Some(user) => user.clone(),
            None => credential_option(directory, "ipmi_user", self.ipmi.dry_run)?,
        };
        let ipmi_pass = match &self.ipmi.ipmi_pass {
            Some(pass) => pass.as_str().to_owned(),
            None => credential_option(directory, "ipmi_pass", self.ipmi.dry_run)?,
        };

        let mut ipmi = IpmiSettings::new(ipmi_user, ipmi_pass);
        ipmi.tool = self.ipmi.ipmi_tool.clone();
        ipmi.interface = self.ipmi.ipmi_interface.clone();
        ipmi.dry_run = self.ipmi.dry_run;

        let ssh_pass = match &self.salt.ssh_pass {
            Some(pass) => pass.as_str().to_owned(),
            None => directory.string_option("ssh_pass").unwrap_or_default(),
        };

        let mut salt = SaltSettings::new(ssh_pass);
        salt.tool = self.salt.salt_ssh_tool.clone();
        salt.roster_file = self.salt.roster_file.clone();
        salt.config_root = self.salt.salt_config_root.clone();
        salt.log_level = self.salt.state_log_level.clone();

        let mut config = BootstrapConfig::new(ipmi, salt);
        config.console = self.console_settings();
        config.readiness = self.readiness.settings()?;
        config.power_timeout = Duration::from_secs(self.ipmi.power_timeout_secs);
        config.apply_timeout = Duration::from_secs(self.salt.apply_timeout_secs);

        if let Command::Bootstrap {
            max_concurrency, ..
        } = &self.command
        {
            config.max_concurrency = *max_concurrency;
        }

        Ok(config)
    }

    fn console_settings(&self) -> ConsoleSettings {
        match &self.console.conman_server {
            Some(server) => ConsoleSettings::Conman {
                bin: self.console.conman_bin.clone(),
                server: server.clone(),
                capture_window: Duration::from_secs(self.console.capture_window_secs),
            },
            None => ConsoleSettings::LogDirectory {
                dir: self.console.console_log_dir.clone(),
                file_prefix: self.console.console_log_prefix.clone(),
                window_bytes: DEFAULT_WINDOW_BYTES,
            },
        }
    }
}

/// Credentials may only be missing in dry-run mode.
fn credential_option(directory: &NodeDirectory, name: &str, dry_run: bool) -> anyhow::Result<String> {
    match directory.string_option(name) {
        Some(value) => Ok(value),
        None if dry_run => Ok(String::new()),
        None => anyhow::bail!("'{}' missing from inventory and not given on the command line", name),
    }
}
