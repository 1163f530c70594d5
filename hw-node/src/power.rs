use std::sync::Arc;

use common::clap::Password;
use thiserror::Error;

use crate::{
    directory::NodeRecord,
    subprocess::{CommandRunner, CommandSpec, ExecutionError},
};

pub const DEFAULT_IPMI_TOOL: &str = "ipmitool";
pub const DEFAULT_IPMI_INTERFACE: &str = "lanplus";

/// Program substituted for the power tool in dry-run mode.
pub const DRY_RUN_PROGRAM: &str = "echo";

#[derive(Error, Debug)]
pub enum PowerError {
    #[error("Node {node} has no management controller address")]
    MissingBmcAddress { node: String },
    #[error("Management controller credentials are empty")]
    MissingCredentials,
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("Power cycle exited with status {exit_code:?}: {stderr}")]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },
}

/// How to reach management controllers. Credentials are shared by every node.
#[derive(Debug, Clone)]
pub struct IpmiSettings {
    pub tool: String,
    pub user: String,
    pub password: Password,
    pub interface: String,
    /// Run `echo` instead of the real tool, empty credentials are accepted.
    pub dry_run: bool,
}

impl IpmiSettings {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            tool: DEFAULT_IPMI_TOOL.to_owned(),
            user: user.into(),
            password: Password::new(password.into()),
            interface: DEFAULT_IPMI_INTERFACE.to_owned(),
            dry_run: false,
        }
    }
}

/// `{tool} -H {bmc_ip} -U {user} -P {password} -I {interface} power cycle`
pub fn ipmi_cycle_command(settings: &IpmiSettings, bmc_ip: &str) -> CommandSpec {
    CommandSpec::new(&settings.tool)
        .args(["-H", bmc_ip, "-U", settings.user.as_str(), "-P"])
        .secret_arg(settings.password.as_str())
        .args(["-I", settings.interface.as_str(), "power", "cycle"])
}

pub struct PowerController {
    settings: IpmiSettings,
    runner: Arc<dyn CommandRunner>,
}

impl PowerController {
    pub fn new(settings: IpmiSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self { settings, runner }
    }

    pub fn command_for(&self, node: &NodeRecord) -> Result<CommandSpec, PowerError> {
        if node.bmc_ip.trim().is_empty() {
            return Err(PowerError::MissingBmcAddress {
                node: node.name.clone(),
            });
        }

        let command = ipmi_cycle_command(&self.settings, &node.bmc_ip);

        if self.settings.dry_run {
            return Ok(command.with_program(DRY_RUN_PROGRAM));
        }

        if self.settings.user.is_empty() || self.settings.password.is_empty() {
            return Err(PowerError::MissingCredentials);
        }

        Ok(command)
    }

    /// Power cycles the node through its management controller. Failures are reported, never retried.
    pub async fn power_cycle(&self, node: &NodeRecord) -> Result<(), PowerError> {
        let command = self.command_for(node)?;

        tracing::info!("Power cycling {} via {}", node.name, node.bmc_ip);
        let output = self.runner.run(&command).await?;

        if !output.success() {
            tracing::warn!(
                "Power cycle of {} failed with status {:?}",
                node.name,
                output.exit_code
            );
            return Err(PowerError::Failed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }

        Ok(())
    }
}
