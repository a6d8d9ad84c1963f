//! Shell-out helpers shared by the system modules.

use std::process::Command as SyncCommand;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{NetShareError, Result};

/// Runs external programs for the rule and sysctl backends.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String>;

    /// Fire-and-forget variant for Drop paths.
    fn run_sync(&self, program: &str, args: &[&str]);
}

/// Executes commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        run(program, args).await
    }

    fn run_sync(&self, program: &str, args: &[&str]) {
        run_sync(program, args)
    }
}

/// Run `program args..` and return its stdout.
///
/// Non-zero exits become [`NetShareError::PermissionDenied`] when stderr
/// says so, [`NetShareError::CommandFailed`] otherwise.
pub async fn run(program: &str, args: &[&str]) -> Result<String> {
    let command_line = command_line(program, args);
    debug!(command = %command_line, "running");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| NetShareError::CommandFailed {
            command: command_line.clone(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(classify_failure(command_line, &stderr));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Blocking variant for Drop paths. Errors are ignored.
pub fn run_sync(program: &str, args: &[&str]) {
    let _ = SyncCommand::new(program).args(args).output();
}

fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

fn classify_failure(command: String, stderr: &str) -> NetShareError {
    if stderr.contains("Operation not permitted") || stderr.contains("Permission denied") {
        return NetShareError::PermissionDenied;
    }
    NetShareError::CommandFailed {
        command,
        message: stderr.trim().to_string(),
    }
}
