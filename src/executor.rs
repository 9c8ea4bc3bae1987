use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::traits::{CollaboratorError, CollaboratorResult};

/// Timeout for cheap introspection commands.
pub const INTROSPECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Captured result of an external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs external tools inside the repository checkout.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    workdir: PathBuf,
}

impl CommandExecutor {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Runs `program args...`, waiting at most `limit` when given.
    ///
    /// A non-zero exit status is not an error here; see [`Self::run_checked`].
    #[instrument(skip(self, args, limit), fields(args = ?args))]
    pub async fn run(
        &self,
        program: &str,
        args: &[&str],
        limit: Option<Duration>,
    ) -> CollaboratorResult<CommandOutput> {
        let mut command = Command::new(program);
        command.args(args).current_dir(&self.workdir).kill_on_drop(true);

        let output = match limit {
            Some(limit) => tokio::time::timeout(limit, command.output())
                .await
                .map_err(|_| CollaboratorError::Timeout {
                    command: display_command(program, args),
                    timeout_secs: limit.as_secs(),
                })??,
            None => command.output().await?,
        };

        debug!(status = ?output.status, "Command finished");
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Like [`Self::run`], failing on a non-zero exit status.
    pub async fn run_checked(
        &self,
        program: &str,
        args: &[&str],
        limit: Option<Duration>,
    ) -> CollaboratorResult<String> {
        let output = self.run(program, args, limit).await?;
        if !output.success {
            return Err(CollaboratorError::CommandFailed {
                command: display_command(program, args),
                stderr: output.stderr.trim_end().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

fn display_command(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}
