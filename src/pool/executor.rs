//! Shell-backed command executor

use crate::domain::ports::Executor;
use crate::error::{Error, Result};
use std::process::Command;
use tracing::{debug, warn};

/// Runs pool command lines through `sh -c` on the local node
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for ShellExecutor {
    fn execute(&self, command: &str) -> Result<Vec<u8>> {
        debug!(command = %command, "Executing command");

        let output = Command::new("sh")
            .args(["-c", command])
            .output()
            .map_err(|e| Error::Command {
                command: command.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let reason = if stderr.is_empty() {
                format!("exited with {}", output.status)
            } else {
                stderr
            };
            warn!(command = %command, reason = %reason, "Command failed");
            return Err(Error::Command {
                command: command.to_string(),
                reason,
            });
        }

        Ok(output.stdout)
    }
}
