//! Kernel IPv4 forwarding control via sysctl.

use super::command::CommandRunner;
use crate::error::{NetShareError, Result};

const IP_FORWARD_KEY: &str = "net.ipv4.ip_forward";

/// Manages the kernel IP forwarding switch.
#[derive(Debug, Default)]
pub struct IpForwarding {
    /// Value seen before the first `enable`.
    original_state: Option<bool>,
}

impl IpForwarding {
    pub fn new() -> Self {
        Self {
            original_state: None,
        }
    }

    /// Read `net.ipv4.ip_forward`.
    pub async fn get_state(&self, runner: &dyn CommandRunner) -> Result<bool> {
        let stdout = runner.run("sysctl", &["-n", IP_FORWARD_KEY]).await?;
        parse_sysctl_bool(&stdout)
    }

    /// Turn kernel forwarding on, remembering the previous value once.
    pub async fn enable(&mut self, runner: &dyn CommandRunner) -> Result<()> {
        if self.original_state.is_none() {
            self.original_state = Some(self.get_state(runner).await?);
        }

        set_state(runner, true).await
    }

    /// Put back the value seen before `enable`. The saved value is kept
    /// until the write succeeds so a failed restore can be retried.
    pub async fn restore(&mut self, runner: &dyn CommandRunner) -> Result<()> {
        if let Some(original) = self.original_state {
            set_state(runner, original).await?;
            self.original_state = None;
        }
        Ok(())
    }

    /// Whether `enable` changed the setting and `restore` is still owed.
    pub fn is_modified(&self) -> bool {
        self.original_state.is_some()
    }

    /// Synchronous restore for use in Drop.
    pub fn restore_sync(&mut self, runner: &dyn CommandRunner) {
        if let Some(original) = self.original_state.take() {
            runner.run_sync("sysctl", &["-w", &assignment(original)]);
        }
    }
}

async fn set_state(runner: &dyn CommandRunner, enabled: bool) -> Result<()> {
    runner.run("sysctl", &["-w", &assignment(enabled)]).await?;
    Ok(())
}

fn assignment(enabled: bool) -> String {
    format!("{}={}", IP_FORWARD_KEY, if enabled { 1 } else { 0 })
}

fn parse_sysctl_bool(output: &str) -> Result<bool> {
    match output.trim() {
        "1" => Ok(true),
        "0" => Ok(false),
        value => Err(NetShareError::ParseError(format!(
            "Unexpected sysctl value: {}",
            value
        ))),
    }
}
