//! `run-command` action
//!
//! Runs a shell script in the step's working directory with the step's
//! environment. Parameters:
//! - `run` (required): script passed to `<shell> -c`
//! - `shell` (optional): overrides the configured default shell
//! - `outputs` (optional): globs, relative to the working directory, naming
//!   the files the command produced
//!
//! Output is streamed to tracing line by line. The child process is killed
//! if the step is abandoned (timeout).

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{Action, ActionInvocation, ActionOutcome, resolve_outputs};

pub const RUN_COMMAND: &str = "run-command";

pub struct CommandAction {
    default_shell: String,
}

impl CommandAction {
    pub fn new(default_shell: String) -> Self {
        Self { default_shell }
    }
}

#[async_trait]
impl Action for CommandAction {
    fn name(&self) -> &str {
        RUN_COMMAND
    }

    async fn run(&self, invocation: ActionInvocation) -> Result<ActionOutcome> {
        let script = invocation
            .str_param("run")
            .context("run-command requires a 'run' parameter")?;
        let shell = invocation.str_param("shell").unwrap_or(self.default_shell.as_str());
        let outputs = invocation.string_list_param("outputs")?;

        info!(
            "Step '{}': running command with {}",
            invocation.step_name, shell
        );

        let mut child = Command::new(shell)
            .arg("-c")
            .arg(script)
            .current_dir(&invocation.working_directory)
            .envs(&invocation.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", shell))?;

        let stdout = child
            .stdout
            .take()
            .map(|s| spawn_line_logger(invocation.step_name.clone(), "stdout", s));
        let stderr = child
            .stderr
            .take()
            .map(|s| spawn_line_logger(invocation.step_name.clone(), "stderr", s));

        let status = child
            .wait()
            .await
            .context("Failed to wait for command")?;

        for logger in [stdout, stderr].into_iter().flatten() {
            let _ = logger.await;
        }

        let exit_code = status.code().unwrap_or(-1);
        if !status.success() {
            warn!(
                "Step '{}': command exited with code {}",
                invocation.step_name, exit_code
            );
            return Ok(ActionOutcome::failure(exit_code));
        }

        let output_paths = resolve_outputs(
            &outputs,
            &invocation.working_directory,
            &invocation.workspace,
        )?;

        Ok(ActionOutcome::success_with_outputs(output_paths))
    }
}

fn spawn_line_logger<R>(
    step_name: String,
    stream: &'static str,
    reader: R,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(step = %step_name, stream, "{}", line);
        }
    })
}
