//! Directive execution against the live networking stack
//!
//! The orchestrator only knows the `Effector` trait. Production runs use
//! `CommandEffector`, which spawns the rendered `ip` / `iptables` /
//! `sysctl` command; `--dry-run` uses `DryRunEffector`.
//!
//! Effectors never retry. A failure is reported once and the orchestrator
//! decides from the step's policy whether the operation continues.

use crate::directive::Step;
use crate::error::{Error, Result};
use std::process::Command;
use tracing::{debug, info};

/// Executes one directive and reports success or failure
pub trait Effector {
    fn apply(&mut self, step: &Step) -> Result<()>;
}

/// Runs directives as host commands
#[derive(Debug, Default)]
pub struct CommandEffector;

impl CommandEffector {
    pub fn new() -> Self {
        Self
    }
}

impl Effector for CommandEffector {
    fn apply(&mut self, step: &Step) -> Result<()> {
        let argv = step.directive.argv();
        let command = argv.join(" ");
        info!(policy = ?step.policy, "[CMD] {}", command);

        let (program, args) = argv.split_first().ok_or_else(|| Error::CommandFailed {
            command: command.clone(),
            message: "empty command".to_string(),
        })?;

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::CommandFailed {
                command: command.clone(),
                message: format!("failed to spawn {}: {}", program, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::CommandFailed {
                command,
                message: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!("{}", stdout.trim());
        }

        Ok(())
    }
}

/// Prints directives without running them
#[derive(Debug, Default)]
pub struct DryRunEffector;

impl DryRunEffector {
    pub fn new() -> Self {
        Self
    }
}

impl Effector for DryRunEffector {
    fn apply(&mut self, step: &Step) -> Result<()> {
        println!("  [DRY-RUN] {}", step.directive);
        Ok(())
    }
}

/// Records every step and fails the ones matching configured patterns
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingEffector {
    pub steps: Vec<Step>,
    failures: Vec<String>,
}

#[cfg(test)]
impl RecordingEffector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every directive whose rendered command contains `pattern`
    pub fn fail_on(mut self, pattern: &str) -> Self {
        self.failures.push(pattern.to_string());
        self
    }

    /// Rendered commands, in order
    pub fn commands(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.directive.to_string()).collect()
    }

    pub fn clear(&mut self) {
        self.steps.clear();
    }
}

#[cfg(test)]
impl Effector for RecordingEffector {
    fn apply(&mut self, step: &Step) -> Result<()> {
        self.steps.push(step.clone());
        let command = step.directive.to_string();
        if self.failures.iter().any(|p| command.contains(p.as_str())) {
            return Err(Error::CommandFailed {
                command,
                message: "simulated failure".to_string(),
            });
        }
        Ok(())
    }
}
