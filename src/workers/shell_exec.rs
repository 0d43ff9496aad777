//! Demo worker running one fixed local command
//!
//! Only the configured command can run; nothing from the message body is
//! passed to the shell.

use crate::dispatch::{DispatchContext, HandlerError, Worker};
use crate::protocol::{Status, StatusMessage};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

/// Command run when none is configured
pub const DEFAULT_COMMAND: &[&str] = &["/bin/ls", "-la"];

#[derive(Debug, Clone)]
pub struct ShellExec {
    command: Vec<String>,
}

impl Default for ShellExec {
    fn default() -> Self {
        Self {
            command: DEFAULT_COMMAND.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ShellExec {
    pub fn with_command<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut command = vec![program.to_string()];
        command.extend(args.into_iter().map(Into::into));
        Self { command }
    }

    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }

    async fn notify_result(&self, ctx: &DispatchContext<'_>, succeeded: bool) {
        let command_line = self.command_line();
        let (slug, message, phase) = if succeeded {
            (
                "ShellExec Executed Successfully",
                format!("ShellExec successfully executed {command_line}. See logs."),
                "completed",
            )
        } else {
            (
                "ShellExec Failed",
                format!("ShellExec failed trying to execute {command_line}. See logs."),
                "failed",
            )
        };

        if let Err(e) = ctx.notify(slug, &message, phase).await {
            warn!(error = %e, phase, "Result notification failed");
        }
    }
}

#[async_trait]
impl Worker for ShellExec {
    fn name(&self) -> &str {
        "ShellExec"
    }

    async fn process(&self, ctx: &mut DispatchContext<'_>) -> Result<(), HandlerError> {
        ctx.ack().await?;
        ctx.reply(&StatusMessage::started()).await?;

        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| HandlerError::failed("no command configured"))?;

        let output = ctx.output();
        output
            .info(&format!("Command: {}", self.command_line()))
            .await?;
        let location = std::env::current_dir()?;
        output
            .info(&format!("Location: {}", location.display()))
            .await?;

        let result = Command::new(program).args(args).output().await?;
        for stream in [&result.stdout, &result.stderr] {
            for line in String::from_utf8_lossy(stream).lines() {
                output.info(line).await?;
            }
        }

        let return_value = result
            .status
            .code()
            .map_or_else(|| "terminated by signal".to_string(), |code| code.to_string());
        output
            .debug(&format!("return value: {return_value}"))
            .await?;

        let succeeded = result.status.success();
        let status = if succeeded {
            StatusMessage::completed()
        } else {
            StatusMessage::new(Status::Failed)
        };
        ctx.reply(&status).await?;
        self.notify_result(ctx, succeeded).await;

        info!(correlation_id = ctx.correlation_id(), succeeded, "Handled a message");
        Ok(())
    }
}
