use std::{path::PathBuf, sync::Arc};

use common::clap::Password;
use thiserror::Error;

use crate::subprocess::{CommandOutput, CommandRunner, CommandSpec, ExecutionError};

pub const DEFAULT_SALT_SSH_TOOL: &str = "salt-ssh";
pub const DEFAULT_ROSTER_FILE: &str = "deploy.roster";
pub const DEFAULT_STATE_LOG_LEVEL: &str = "debug";

#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("Roster file {0} does not exist")]
    MissingRoster(PathBuf),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("State apply exited with status {exit_code:?}: {stderr}")]
    Failed {
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

#[derive(Debug, Clone)]
pub struct SaltSettings {
    pub tool: String,
    /// Roster mapping node names to host and user, generated alongside the inventory.
    pub roster_file: PathBuf,
    /// Directory holding the salt master configuration, passed as `-c`.
    pub config_root: PathBuf,
    pub ssh_password: Password,
    pub log_level: String,
}

impl SaltSettings {
    pub fn new(ssh_password: impl Into<String>) -> Self {
        Self {
            tool: DEFAULT_SALT_SSH_TOOL.to_owned(),
            roster_file: PathBuf::from(DEFAULT_ROSTER_FILE),
            config_root: PathBuf::from("."),
            ssh_password: Password::new(ssh_password.into()),
            log_level: DEFAULT_STATE_LOG_LEVEL.to_owned(),
        }
    }
}

/// A `salt-ssh state.apply` invocation against one node.
#[derive(Debug, Clone)]
pub struct SaltCommand {
    spec: CommandSpec,
    node_name: String,
    state_name: String,
    settings: SaltSettings,
}

impl SaltCommand {
    pub fn new(settings: &SaltSettings, node_name: &str, state_name: &str) -> Self {
        let spec = CommandSpec::new(&settings.tool)
            .args(["-i", "--roster-file"])
            .arg(settings.roster_file.display().to_string())
            .arg("-c")
            .arg(settings.config_root.display().to_string())
            .args(["--no-host-keys", "--key-deploy", "--passwd"])
            .secret_arg(settings.ssh_password.as_str())
            .args([node_name, "state.apply", state_name, "-l", settings.log_level.as_str()]);

        Self {
            spec,
            node_name: node_name.to_owned(),
            state_name: state_name.to_owned(),
            settings: settings.clone(),
        }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// The command as it is typed into a shell, node name quoted and two spaces before
    /// `state.apply`. Tooling that scrapes our logs matches on this exact form.
    pub fn command_line(&self) -> String {
        self.render(self.settings.ssh_password.as_str())
    }

    /// Same as [`SaltCommand::command_line`] with the SSH password redacted.
    pub fn redacted_command_line(&self) -> String {
        self.render(common::clap::REDACTED_VALUE)
    }

    fn render(&self, password: &str) -> String {
        format!(
            "{} -i --roster-file {} -c {} --no-host-keys --key-deploy --passwd {} \"{}\"  state.apply {} -l {}",
            self.settings.tool,
            self.settings.roster_file.display(),
            self.settings.config_root.display(),
            password,
            self.node_name,
            self.state_name,
            self.settings.log_level,
        )
    }
}

pub struct ConfigurationApplier {
    settings: SaltSettings,
    runner: Arc<dyn CommandRunner>,
}

impl ConfigurationApplier {
    pub fn new(settings: SaltSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self { settings, runner }
    }

    pub fn command_for(&self, node_name: &str, state_name: &str) -> SaltCommand {
        SaltCommand::new(&self.settings, node_name, state_name)
    }

    /// Applies `state_name` to `node_name`. A failed apply is returned to the caller, not retried.
    pub async fn apply_configuration(
        &self,
        node_name: &str,
        state_name: &str,
    ) -> Result<CommandOutput, ApplyError> {
        if !tokio::fs::try_exists(&self.settings.roster_file)
            .await
            .unwrap_or(false)
        {
            return Err(ApplyError::MissingRoster(self.settings.roster_file.clone()));
        }

        let command = self.command_for(node_name, state_name);
        tracing::info!("Applying state: {}", command.redacted_command_line());

        let output = self.runner.run(command.spec()).await?;

        if !output.success() {
            tracing::warn!(
                "Applying {} to {} failed with status {:?}",
                state_name,
                node_name,
                output.exit_code
            );
            return Err(ApplyError::Failed {
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        tracing::info!("Applied {} to {}", state_name, node_name);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingRunner;

    #[test]
    fn salt_ssh_command_line() {
        let settings = SaltSettings::new("ssh_pass");
        let command = SaltCommand::new(&settings, "test_node", "test_sls");

        assert_eq!(
            command.command_line(),
            "salt-ssh -i --roster-file deploy.roster -c . --no-host-keys --key-deploy --passwd ssh_pass \"test_node\"  state.apply test_sls -l debug"
        );
    }

    #[test]
    fn salt_ssh_argv_keeps_token_order() {
        let settings = SaltSettings::new("ssh_pass");
        let command = SaltCommand::new(&settings, "test_node", "test_sls");

        assert_eq!(
            command.spec().argv(),
            vec![
                "salt-ssh",
                "-i",
                "--roster-file",
                "deploy.roster",
                "-c",
                ".",
                "--no-host-keys",
                "--key-deploy",
                "--passwd",
                "ssh_pass",
                "test_node",
                "state.apply",
                "test_sls",
                "-l",
                "debug",
            ]
        );
        assert!(!command.redacted_command_line().contains("ssh_pass"));
        assert!(!command.spec().to_string().contains("ssh_pass"));
    }

    fn settings_with_roster(dir: &tempfile::TempDir) -> SaltSettings {
        let roster_file = dir.path().join("deploy.roster");
        std::fs::write(&roster_file, "test_node:\n  host: 1.2.3.10\n  user: root\n").unwrap();

        let mut settings = SaltSettings::new("ssh_pass");
        settings.roster_file = roster_file;
        settings
    }

    #[tokio::test]
    async fn apply_runs_salt_ssh() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::succeeding());
        let applier = ConfigurationApplier::new(settings_with_roster(&dir), runner.clone());

        let output = applier.apply_configuration("test_node", "test_sls").await.unwrap();

        assert!(output.success());
        let argv = &runner.argvs()[0];
        assert_eq!(argv[0], "salt-ssh");
        assert_eq!(argv[10..13], ["test_node", "state.apply", "test_sls"]);
    }

    #[tokio::test]
    async fn missing_roster_is_rejected_before_running() {
        let runner = Arc::new(RecordingRunner::succeeding());
        let mut settings = SaltSettings::new("ssh_pass");
        settings.roster_file = PathBuf::from("/nonexistent/deploy.roster");
        let applier = ConfigurationApplier::new(settings, runner.clone());

        assert!(matches!(
            applier.apply_configuration("test_node", "test_sls").await,
            Err(ApplyError::MissingRoster(_))
        ));
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn failed_apply_carries_output() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::failing(11, "Minion did not return"));
        let applier = ConfigurationApplier::new(settings_with_roster(&dir), runner.clone());

        match applier.apply_configuration("test_node", "test_sls").await {
            Err(ApplyError::Failed {
                exit_code, stderr, ..
            }) => {
                assert_eq!(exit_code, Some(11));
                assert_eq!(stderr, "Minion did not return");
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(runner.call_count(), 1);
    }
}
